//! Guest modules, their method tables, and how source becomes a module.

use std::{collections::HashMap, fmt, future::Future, panic::AssertUnwindSafe, sync::Arc};

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    ambient::{Ambient, scope_call},
    binder::{self, Args, Candidate, GuestError, Outcome, ParamType, Parameter, Returns},
    error::{BindingError, LoadError, Result},
};

/// A unit of guest code hosted inside a sandbox.
pub trait GuestModule: Send + Sync + 'static {
    /// Called once, before any method is invoked.
    fn initialize(&mut self, ambient: Ambient) -> Result<(), GuestError> {
        let _ = ambient;
        Ok(())
    }

    /// Declares the methods the module exposes.
    fn register(self: Arc<Self>, table: &mut MethodTable);

    /// Called when the module is replaced or its sandbox is torn down.
    fn dispose(&self) {}
}

/// Methods exposed by a module, by name, each with its overloads.
#[derive(Default, Clone)]
pub struct MethodTable {
    methods: HashMap<String, Vec<Candidate>>,
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.methods.iter().map(|(k, v)| (k, v.len())))
            .finish()
    }
}

impl MethodTable {
    pub fn define(&mut self, name: impl Into<String>) -> MethodBuilder<'_> {
        MethodBuilder {
            table: self,
            name: name.into(),
            params: Vec::new(),
        }
    }

    pub fn candidates(&self, name: &str) -> Option<&[Candidate]> {
        self.methods.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    fn insert(&mut self, candidate: Candidate) {
        self.methods
            .entry(candidate.name().to_string())
            .or_default()
            .push(candidate);
    }
}

/// Declares one overload; finished by one of the `handler*` methods.
#[must_use]
pub struct MethodBuilder<'a> {
    table: &'a mut MethodTable,
    name: String,
    params: Vec<Parameter>,
}

impl MethodBuilder<'_> {
    pub fn param(mut self, name: impl Into<String>, ty: ParamType) -> Self {
        self.params.push(Parameter {
            name: name.into(),
            ty,
            default: None,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, ty: ParamType, default: Value) -> Self {
        self.params.push(Parameter {
            name: name.into(),
            ty,
            default: Some(default),
        });
        self
    }

    pub fn handler<F, T>(self, f: F)
    where
        F: Fn(Args) -> Result<T, GuestError> + Send + Sync + 'static,
        T: Serialize,
    {
        self.finish(
            Returns::Value,
            Arc::new(move |args: Args| f(args).and_then(to_value).map(Outcome::Ready)),
        );
    }

    pub fn handler_async<F, Fut, T>(self, f: F)
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, GuestError>> + Send + 'static,
        T: Serialize + 'static,
    {
        self.finish(
            Returns::Value,
            Arc::new(move |args: Args| -> Result<Outcome, GuestError> {
                let fut = f(args);
                Ok(Outcome::Deferred(Box::pin(async move { to_value(fut.await?) })))
            }),
        );
    }

    pub fn handler_void<F>(self, f: F)
    where
        F: Fn(Args) -> Result<(), GuestError> + Send + Sync + 'static,
    {
        self.finish(
            Returns::Void,
            Arc::new(move |args: Args| f(args).map(|()| Outcome::Ready(Value::Null))),
        );
    }

    fn finish(self, returns: Returns, handler: binder::GuestFn) {
        let candidate = Candidate::new(self.name, self.params, returns, handler);
        self.table.insert(candidate);
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value, GuestError> {
    serde_json::to_value(value).map_err(GuestError::from)
}

pub type ModuleFactory = Arc<dyn Fn() -> Box<dyn GuestModule> + Send + Sync>;

/// A type exported by a compiled unit.
///
/// Only public, non-abstract types that carry a factory are module
/// candidates.
#[derive(Clone)]
pub struct TypeExport {
    name: String,
    public: bool,
    is_abstract: bool,
    factory: Option<ModuleFactory>,
}

impl fmt::Debug for TypeExport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeExport")
            .field("name", &self.name)
            .field("public", &self.public)
            .field("is_abstract", &self.is_abstract)
            .field("module", &self.factory.is_some())
            .finish()
    }
}

impl TypeExport {
    /// A public guest module constructed with `Default`.
    pub fn module<M: GuestModule + Default>(name: impl Into<String>) -> Self {
        Self::with_factory(name, Arc::new(|| -> Box<dyn GuestModule> { Box::new(M::default()) }))
    }

    pub fn with_factory(name: impl Into<String>, factory: ModuleFactory) -> Self {
        Self {
            name: name.into(),
            public: true,
            is_abstract: false,
            factory: Some(factory),
        }
    }

    /// A public type that is not a guest module.
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            public: true,
            is_abstract: false,
            factory: None,
        }
    }

    #[must_use]
    pub const fn private(mut self) -> Self {
        self.public = false;
        self
    }

    #[must_use]
    pub const fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn is_candidate(&self) -> bool {
        self.public && !self.is_abstract && self.factory.is_some()
    }
}

/// Output of a [`ModuleCompiler`].
#[derive(Debug, Clone)]
pub struct LoadableUnit {
    name: String,
    exports: Vec<TypeExport>,
}

impl LoadableUnit {
    pub fn new(name: impl Into<String>, exports: Vec<TypeExport>) -> Self {
        Self {
            name: name.into(),
            exports,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exports(&self) -> &[TypeExport] {
        &self.exports
    }

    /// The single public, concrete guest module the unit exports.
    pub fn select_module(&self) -> Result<&TypeExport, LoadError> {
        let candidates: Vec<&TypeExport> =
            self.exports.iter().filter(|e| e.is_candidate()).collect();
        match candidates.as_slice() {
            [] => Err(LoadError::missing_module(&self.name)),
            [export] => Ok(export),
            many => Err(LoadError::ambiguous_module(
                &self.name,
                &many.iter().map(|e| e.name()).collect::<Vec<_>>(),
            )),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CompileError(pub String);

impl From<CompileError> for LoadError {
    fn from(value: CompileError) -> Self {
        Self::Compile(value.0)
    }
}

/// Turns guest source text into a loadable unit.
#[async_trait::async_trait]
pub trait ModuleCompiler: Send + Sync + 'static {
    async fn compile(&self, source: &str, unit_name: &str) -> Result<LoadableUnit, CompileError>;
}

#[async_trait::async_trait]
impl<T: ModuleCompiler + ?Sized> ModuleCompiler for Arc<T> {
    async fn compile(&self, source: &str, unit_name: &str) -> Result<LoadableUnit, CompileError> {
        (**self).compile(source, unit_name).await
    }
}

/// Compiles a manifest naming types from a fixed catalog.
///
/// Each non-empty line names one type; text after `#` is a comment. Naming a
/// type twice exports it once.
#[derive(Default, Clone)]
pub struct CatalogCompiler {
    catalog: HashMap<String, TypeExport>,
}

impl CatalogCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_type(mut self, export: TypeExport) -> Self {
        self.register(export);
        self
    }

    pub fn register(&mut self, export: TypeExport) {
        self.catalog.insert(export.name.clone(), export);
    }
}

#[async_trait::async_trait]
impl ModuleCompiler for CatalogCompiler {
    async fn compile(&self, source: &str, unit_name: &str) -> Result<LoadableUnit, CompileError> {
        let mut exports: Vec<TypeExport> = Vec::new();
        for (index, line) in source.lines().enumerate() {
            let name = line.split('#').next().unwrap_or_default().trim();
            if name.is_empty() {
                continue;
            }
            let export = self.catalog.get(name).ok_or_else(|| {
                CompileError(format!("{unit_name}({}): unknown type `{name}`", index + 1))
            })?;
            if !exports.iter().any(|e| e.name == export.name) {
                exports.push(export.clone());
            }
        }
        Ok(LoadableUnit::new(unit_name, exports))
    }
}

/// An initialized module instance with its method table.
pub struct LoadedModule {
    type_name: String,
    instance: Arc<dyn GuestModule>,
    methods: MethodTable,
}

impl fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModule")
            .field("type_name", &self.type_name)
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}

impl LoadedModule {
    /// Selects, constructs and initializes the unit's module.
    ///
    /// A module whose initialization fails is disposed before the error is
    /// returned.
    pub fn instantiate(unit: &LoadableUnit, ambient: Ambient) -> Result<Self, LoadError> {
        let export = unit.select_module()?;
        let factory = export
            .factory
            .as_ref()
            .ok_or_else(|| LoadError::missing_module(unit.name()))?;

        let mut instance = std::panic::catch_unwind(AssertUnwindSafe(|| factory()))
            .map_err(|_| LoadError::module_loader(export.name(), "constructor panicked"))?;
        let initialized = std::panic::catch_unwind(AssertUnwindSafe(|| instance.initialize(ambient)));
        match initialized {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                instance.dispose();
                return Err(LoadError::module_loader(export.name(), err));
            }
            Err(_) => {
                instance.dispose();
                return Err(LoadError::module_loader(export.name(), "initialize panicked"));
            }
        }

        let instance: Arc<dyn GuestModule> = Arc::from(instance);
        let mut methods = MethodTable::default();
        Arc::clone(&instance).register(&mut methods);
        Ok(Self {
            type_name: export.name().to_string(),
            instance,
            methods,
        })
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub const fn methods(&self) -> &MethodTable {
        &self.methods
    }

    /// Resolves `name` against the arguments and runs the chosen overload
    /// with `cancel` installed as the current call token.
    pub async fn invoke(
        &self,
        name: &str,
        positional: &[Value],
        named: &Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<Value> {
        let candidates = self
            .methods
            .candidates(name)
            .ok_or_else(|| BindingError::missing_method(&self.type_name, name))?;
        let (candidate, args) = binder::bind(&self.type_name, name, candidates, positional, named)?;
        metrics::counter!("sandy_invocations_total").increment(1);
        scope_call(cancel, binder::invoke(candidate, args)).await
    }

    pub fn dispose(&self) {
        if std::panic::catch_unwind(AssertUnwindSafe(|| self.instance.dispose())).is_err() {
            tracing::warn!(module = %self.type_name, "guest module panicked during dispose");
        }
    }
}
