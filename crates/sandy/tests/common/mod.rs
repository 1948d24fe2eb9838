#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use sandy::{
    Ambient, CatalogCompiler, ExecutionHost, GuestError, GuestModule, HostConfig,
    InProcessIsolation, MethodTable, ParamType, TypeExport, WorkerConfig,
};
use serde_json::{Value, json};
use tempfile::TempDir;

pub static HANGING: AtomicUsize = AtomicUsize::new(0);
pub static BLOCKED: AtomicUsize = AtomicUsize::new(0);

/// Counts a guest call as in flight until the call is dropped.
struct InFlight(&'static AtomicUsize);

impl InFlight {
    fn enter(counter: &'static AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct Calculator {
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
            .param("x", ParamType::Float)
            .param("y", ParamType::Float)
            .handler(|args| {
                let y = args.get::<f64>(1)?;
                if y == 0.0 {
                    return Err(GuestError::new("DivideByZero", "attempt to divide by zero"));
                }
                Ok(args.get::<f64>(0)? / y)
            });
        table
            .define("Greet")
            .param("name", ParamType::String)
            .optional("greeting", ParamType::String, json!("Hello"))
            .handler(|args| Ok(format!("{}, {}!", args.get::<String>(1)?, args.get::<String>(0)?)));

        let this = Arc::clone(&self);
        table
            .define("Concat")
            .param("a", ParamType::Int)
            .param("b", ParamType::Int)
            .handler_async(move |args| {
                let ambient = this.ambient.clone();
                async move {
                    let ambient = ambient.ok_or_else(|| GuestError::new("NotInitialized", "no ambient"))?;
                    let joined = ambient
                        .invoke("Concat", json!([args.get::<i64>(0)?, args.get::<i64>(1)?]))
                        .await?;
                    let digits = joined
                        .as_str()
                        .ok_or_else(|| GuestError::new("FormatError", "Concat did not return text"))?;
                    Ok::<_, GuestError>(digits.parse::<i64>()?)
                }
            });

        let this = Arc::clone(&self);
        table
            .define("Ask")
            .param("method", ParamType::String)
            .handler_async(move |args| {
                let ambient = this.ambient.clone();
                async move {
                    let ambient = ambient.ok_or_else(|| GuestError::new("NotInitialized", "no ambient"))?;
                    let method = args.get::<String>(0)?;
                    Ok::<_, GuestError>(ambient.invoke(&method, Value::Null).await?)
                }
            });

        table.define("Hang").handler_async(|_args| async {
            let _in_flight = InFlight::enter(&HANGING);
            std::future::pending::<()>().await;
            Ok::<_, GuestError>(Value::Null)
        });
        table.define("Block").handler_async(|_args| async {
            let _in_flight = InFlight::enter(&BLOCKED);
            std::future::pending::<()>().await;
            Ok::<_, GuestError>(Value::Null)
        });
    }
}

#[derive(Default)]
pub struct Echo;

impl GuestModule for Echo {
    fn register(self: Arc<Self>, table: &mut MethodTable) {
        table
            .define("Echo")
            .param("value", ParamType::Any)
            .handler(|args| args.value(0));
    }
}

pub fn compiler() -> CatalogCompiler {
    CatalogCompiler::new()
        .with_type(TypeExport::module::<Calculator>("Calculator"))
        .with_type(TypeExport::module::<Echo>("Echo"))
        .with_type(TypeExport::module::<Echo>("EchoBase").abstract_type())
        .with_type(TypeExport::plain("Helper"))
}

pub struct Harness {
    pub host: ExecutionHost,
    pub isolation: InProcessIsolation,
    pub root: TempDir,
}

pub fn harness() -> Result<Harness> {
    let root = tempfile::tempdir().context("create temp dir")?;
    let isolation = InProcessIsolation::new(
        Arc::new(compiler()),
        WorkerConfig {
            sandbox_root: root.path().join("sandboxes"),
            readable_paths: Vec::new(),
        },
    );
    let config = HostConfig::new("in-process")
        .working_directory(root.path().join("work"))
        .socket_directory(root.path().join("sockets"));
    let host = ExecutionHost::new(config, Arc::new(isolation.clone()));
    Ok(Harness {
        host,
        isolation,
        root,
    })
}

/// Polls `check` until it holds or `limit` elapses.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> Result<()> {
    tokio::time::timeout(limit, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("condition not reached in time")
}
