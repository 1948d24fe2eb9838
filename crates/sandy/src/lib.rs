//! Hosts untrusted guest modules in an isolated worker and talks to them over
//! line-delimited JSON channels.
//!
//! The host side is [`ExecutionHost`] and [`Sandbox`]; the isolated side is
//! [`worker::run_worker`], which a worker binary calls with its end of the
//! worker channel and a [`ModuleCompiler`].

pub mod ambient;
pub mod binder;
pub mod config;
pub mod error;
pub mod host;
pub mod isolation;
mod lifecycle;
pub mod module;
pub mod protocol;
pub mod resources;
pub mod rpc;
pub mod value;
pub mod worker;

#[cfg(test)]
mod testing;

/// Tracing target for events about guest code.
pub const TRACE_TARGET: &str = "sandy::guest";

pub use ambient::{Ambient, AmbientContext, AmbientHandler, handler_fn};
pub use binder::{Args, GuestError, ParamType};
pub use config::{HostConfig, WorkerConfig};
pub use error::{BindingError, Error, ErrorKind, LoadError, ProtocolError, Result};
pub use host::{ExecutionHost, Sandbox};
pub use isolation::{InProcessIsolation, IsolationPrimitive, ProcessIsolation, Restrictions, TrustedResources};
pub use lifecycle::SandboxState;
pub use module::{CatalogCompiler, GuestModule, MethodTable, ModuleCompiler, TypeExport};
pub use protocol::SandboxId;
pub use value::{NamedArgs, Value, ValueKind};

pub use tokio_util::sync::CancellationToken;
