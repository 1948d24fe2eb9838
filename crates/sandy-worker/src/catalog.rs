//! Guest modules built into the worker binary.
//!
//! A source unit is a manifest naming the types it exports, one per line;
//! exactly one of them has to be a concrete module.

use std::{path::PathBuf, sync::Arc, time::Duration};

use sandy::{Ambient, CatalogCompiler, GuestError, GuestModule, MethodTable, ParamType, TypeExport};
use serde_json::{Value, json};

pub fn compiler(readable_paths: Vec<PathBuf>) -> CatalogCompiler {
    let files = Arc::new(readable_paths);
    CatalogCompiler::new()
        .with_type(TypeExport::module::<Calculator>("Calculator"))
        .with_type(TypeExport::module::<Diagnostics>("Diagnostics"))
        .with_type(TypeExport::with_factory(
            "Files",
            Arc::new(move || -> Box<dyn GuestModule> {
                Box::new(Files {
                    readable: Arc::clone(&files),
                })
            }),
        ))
        .with_type(TypeExport::module::<Calculator>("ModuleBase").abstract_type())
        .with_type(TypeExport::plain("Helper"))
}

#[derive(Default)]
struct Calculator {
    ambient: Option<Ambient>,
}

impl GuestModule for Calculator {
    fn initialize(&mut self, ambient: Ambient) -> Result<(), GuestError> {
        self.ambient = Some(ambient);
        Ok(())
    }

    fn register(self: Arc<Self>, table: &mut MethodTable) {
        table
            .define("Add")
            .param("x", ParamType::Float)
            .param("y", ParamType::Float)
            .handler(|args| Ok(args.get::<f64>(0)? + args.get::<f64>(1)?));
        table
            .define("Add")
            .param("x", ParamType::String)
            .param("y", ParamType::String)
            .handler(|args| Ok(args.get::<String>(0)? + &args.get::<String>(1)?));
        table
            .define("Divide")
            .param("x", ParamType::Int)
            .param("y", ParamType::Int)
            .handler(|args| {
                let x = args.get::<i64>(0)?;
                let y = args.get::<i64>(1)?;
                x.checked_div(y)
                    .ok_or_else(|| GuestError::new("DivideByZero", "attempt to divide by zero"))
            });

        let this = Arc::clone(&self);
        table
            .define("Concat")
            .param("a", ParamType::Int)
            .param("b", ParamType::Int)
            .handler_async(move |args| {
                let ambient = this.ambient.clone();
                async move {
                    let ambient =
                        ambient.ok_or_else(|| GuestError::new("NotInitialized", "no ambient"))?;
                    let params = json!([args.get::<i64>(0)?, args.get::<i64>(1)?]);
                    let joined = ambient.invoke("Concat", params).await?;
                    let digits = joined
                        .as_str()
                        .ok_or_else(|| GuestError::new("FormatError", "Concat did not return text"))?;
                    Ok::<_, GuestError>(digits.parse::<i64>()?)
                }
            });
    }
}

#[derive(Default)]
struct Diagnostics;

impl GuestModule for Diagnostics {
    fn register(self: Arc<Self>, table: &mut MethodTable) {
        table
            .define("Exit")
            .optional("code", ParamType::Int, json!(1))
            .handler_void(|args| {
                let code = args.get::<i32>(0)?;
                tracing::warn!(target: sandy::TRACE_TARGET, code, "guest requested process exit");
                std::process::exit(code)
            });
        table
            .define("Sleep")
            .param("millis", ParamType::Int)
            .handler_async(|args| async move {
                let millis = args.get::<u64>(0)?;
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok::<_, GuestError>(millis)
            });
        table
            .define("Panic")
            .param("message", ParamType::String)
            .handler_void(|args| -> Result<(), GuestError> {
                let message = args.get::<String>(0)?;
                panic!("{message}")
            });
        table
            .define("Pid")
            .handler(|_args| Ok(std::process::id()));
    }
}

struct Files {
    readable: Arc<Vec<PathBuf>>,
}

impl GuestModule for Files {
    fn register(self: Arc<Self>, table: &mut MethodTable) {
        let this = Arc::clone(&self);
        table
            .define("Read")
            .param("path", ParamType::String)
            .handler_async(move |args| {
                let this = Arc::clone(&this);
                async move {
                    let path = PathBuf::from(args.get::<String>(0)?);
                    if !this.readable.iter().any(|root| path.starts_with(root)) {
                        return Err(GuestError::new(
                            "AccessDenied",
                            format!("{} is outside the trusted paths", path.display()),
                        ));
                    }
                    let content = tokio::fs::read_to_string(&path).await?;
                    Ok::<_, GuestError>(Value::String(content))
                }
            });
    }
}
