use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rpc::{ChannelError, RpcError};

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Error type carried in the `type` field of an error response.
///
/// Every error that crosses a channel is reduced to one of these kinds so the
/// receiving side can rebuild a matching [`Error`] variant. Kinds this build
/// does not know decode as [`ErrorKind::Internal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    StartupFailure,
    CompileError,
    MissingModule,
    AmbiguousModule,
    ModuleLoader,
    MissingMethod,
    AmbiguousMatch,
    ArgumentMismatch,
    GuestFault,
    ChannelFailure,
    InvalidState,
    MethodNotFound,
    InvalidParams,
    Framing,
    Cancelled,
    NoAmbientHandler,
    #[serde(other)]
    Internal,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StartupFailure => "StartupFailure",
            Self::CompileError => "CompileError",
            Self::MissingModule => "MissingModule",
            Self::AmbiguousModule => "AmbiguousModule",
            Self::ModuleLoader => "ModuleLoader",
            Self::MissingMethod => "MissingMethod",
            Self::AmbiguousMatch => "AmbiguousMatch",
            Self::ArgumentMismatch => "ArgumentMismatch",
            Self::GuestFault => "GuestFault",
            Self::ChannelFailure => "ChannelFailure",
            Self::InvalidState => "InvalidState",
            Self::MethodNotFound => "MethodNotFound",
            Self::InvalidParams => "InvalidParams",
            Self::Framing => "Framing",
            Self::Cancelled => "Cancelled",
            Self::NoAmbientHandler => "NoAmbientHandler",
            Self::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures while turning source into a running guest module.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// The compiler rejected the source.
    #[error("{0}")]
    Compile(String),

    /// The compiled unit exports no public, concrete guest module.
    #[error("{0}")]
    MissingModule(String),

    /// The compiled unit exports more than one candidate guest module.
    #[error("{0}")]
    AmbiguousModule(String),

    /// Instantiation or initialization of the selected module failed.
    #[error("{0}")]
    ModuleLoader(String),
}

impl LoadError {
    pub(crate) fn missing_module(unit: &str) -> Self {
        Self::MissingModule(format!(
            "`{unit}` does not export a public, concrete guest module"
        ))
    }

    pub(crate) fn ambiguous_module(unit: &str, candidates: &[&str]) -> Self {
        Self::AmbiguousModule(format!(
            "`{unit}` exports more than one guest module: {}",
            candidates.join(", ")
        ))
    }

    pub(crate) fn module_loader(module: &str, reason: impl fmt::Display) -> Self {
        Self::ModuleLoader(format!("failed to load guest module `{module}`: {reason}"))
    }

    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Compile(_) => ErrorKind::CompileError,
            Self::MissingModule(_) => ErrorKind::MissingModule,
            Self::AmbiguousModule(_) => ErrorKind::AmbiguousModule,
            Self::ModuleLoader(_) => ErrorKind::ModuleLoader,
        }
    }
}

/// Failures while matching a request against the loaded module's methods.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindingError {
    /// No method of that name accepts the supplied arguments.
    #[error("{0}")]
    MissingMethod(String),

    /// More than one overload accepts the supplied arguments.
    #[error("{0}")]
    AmbiguousMatch(String),

    /// A value matched by kind but could not be converted to the parameter.
    #[error("{0}")]
    ArgumentMismatch(String),
}

impl BindingError {
    pub(crate) fn missing_method(module: &str, method: &str) -> Self {
        Self::MissingMethod(format!(
            "no overload of `{module}.{method}` accepts the supplied arguments"
        ))
    }

    pub(crate) fn ambiguous_match(module: &str, method: &str, signatures: &[String]) -> Self {
        Self::AmbiguousMatch(format!(
            "call to `{module}.{method}` is ambiguous between {}",
            signatures.join(" and ")
        ))
    }

    pub(crate) fn argument_mismatch(parameter: &str, reason: impl fmt::Display) -> Self {
        Self::ArgumentMismatch(format!("argument `{parameter}`: {reason}"))
    }

    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingMethod(_) => ErrorKind::MissingMethod,
            Self::AmbiguousMatch(_) => ErrorKind::AmbiguousMatch,
            Self::ArgumentMismatch(_) => ErrorKind::ArgumentMismatch,
        }
    }
}

/// Violations of the message protocol or of the sandbox lifecycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The operation is not valid in the sandbox's current state.
    #[error("{0}")]
    InvalidState(String),

    /// The peer does not serve the requested method.
    #[error("{0}")]
    MethodNotFound(String),

    /// The request parameters do not have the expected shape.
    #[error("{0}")]
    InvalidParams(String),

    /// A line on the channel was not a well-formed message.
    #[error("{0}")]
    Framing(String),
}

impl ProtocolError {
    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub(crate) fn method_not_found(method: &str) -> Self {
        Self::MethodNotFound(format!("method `{method}` is not served on this channel"))
    }

    pub(crate) fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams(message.into())
    }

    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::MethodNotFound(_) => ErrorKind::MethodNotFound,
            Self::InvalidParams(_) => ErrorKind::InvalidParams,
            Self::Framing(_) => ErrorKind::Framing,
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The worker or a sandbox failed to come up.
    #[error("startup failure: {0}")]
    Startup(String),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Binding(#[from] BindingError),

    /// Guest code raised an error; `guest_type` identifies it.
    #[error("guest fault [{guest_type}]: {message}")]
    GuestFault { guest_type: String, message: String },

    /// The channel closed or broke while the operation was outstanding.
    #[error("channel failure: {0}")]
    Channel(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Neither the sandbox nor the host has an ambient handler.
    #[error("no ambient handler registered for `{method}`")]
    NoAmbientHandler { method: String },

    /// Anything else, including errors raised by embedder ambient handlers.
    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn internal(message: impl fmt::Display) -> Self {
        Self::Internal(message.to_string())
    }

    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Startup(_) => ErrorKind::StartupFailure,
            Self::Load(e) => e.kind(),
            Self::Binding(e) => e.kind(),
            Self::GuestFault { .. } => ErrorKind::GuestFault,
            Self::Channel(_) => ErrorKind::ChannelFailure,
            Self::Protocol(e) => e.kind(),
            Self::Cancelled => ErrorKind::Cancelled,
            Self::NoAmbientHandler { .. } => ErrorKind::NoAmbientHandler,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Reduces the error to its wire form.
    pub fn to_rpc(&self) -> RpcError {
        let (message, guest_type) = match self {
            Self::GuestFault {
                guest_type,
                message,
            } => (message.clone(), Some(guest_type.clone())),
            Self::NoAmbientHandler { method } => (method.clone(), None),
            Self::Cancelled => (self.to_string(), None),
            Self::Startup(m) | Self::Channel(m) | Self::Internal(m) => (m.clone(), None),
            Self::Load(e) => (e.to_string(), None),
            Self::Binding(e) => (e.to_string(), None),
            Self::Protocol(e) => (e.to_string(), None),
        };
        RpcError {
            kind: self.kind(),
            message,
            guest_type,
        }
    }
}

impl From<RpcError> for Error {
    fn from(value: RpcError) -> Self {
        let RpcError {
            kind,
            message,
            guest_type,
        } = value;
        match kind {
            ErrorKind::StartupFailure => Self::Startup(message),
            ErrorKind::CompileError => LoadError::Compile(message).into(),
            ErrorKind::MissingModule => LoadError::MissingModule(message).into(),
            ErrorKind::AmbiguousModule => LoadError::AmbiguousModule(message).into(),
            ErrorKind::ModuleLoader => LoadError::ModuleLoader(message).into(),
            ErrorKind::MissingMethod => BindingError::MissingMethod(message).into(),
            ErrorKind::AmbiguousMatch => BindingError::AmbiguousMatch(message).into(),
            ErrorKind::ArgumentMismatch => BindingError::ArgumentMismatch(message).into(),
            ErrorKind::GuestFault => Self::GuestFault {
                guest_type: guest_type.unwrap_or_else(|| "unknown".to_string()),
                message,
            },
            ErrorKind::ChannelFailure => Self::Channel(message),
            ErrorKind::InvalidState => ProtocolError::InvalidState(message).into(),
            ErrorKind::MethodNotFound => ProtocolError::MethodNotFound(message).into(),
            ErrorKind::InvalidParams => ProtocolError::InvalidParams(message).into(),
            ErrorKind::Framing => ProtocolError::Framing(message).into(),
            ErrorKind::Cancelled => Self::Cancelled,
            ErrorKind::NoAmbientHandler => Self::NoAmbientHandler { method: message },
            ErrorKind::Internal => Self::Internal(message),
        }
    }
}

impl From<ChannelError> for Error {
    fn from(value: ChannelError) -> Self {
        match value {
            ChannelError::Framing(e) => ProtocolError::Framing(e.to_string()).into(),
            other => Self::Channel(other.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Internal(format!("I/O error: {value}"))
    }
}
