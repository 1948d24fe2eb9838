use std::sync::Weak;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{HostInner, sandbox::SandboxInner};
use crate::{
    TRACE_TARGET,
    ambient::AmbientContext,
    error::{Error, ProtocolError, Result},
    protocol::{INVOKE_AMBIENT, InvokeAmbientParams, NOTIFY_STARTED, parse_params},
    rpc::{RequestContext, Service},
};

/// What the host serves on the worker channel and on every sandbox channel.
pub(crate) struct HostService {
    host: Weak<HostInner>,
    /// Set on sandbox channels; ambient calls there resolve to this sandbox.
    sandbox: Option<Weak<SandboxInner>>,
}

impl HostService {
    pub(crate) const fn worker(host: Weak<HostInner>) -> Self {
        Self { host, sandbox: None }
    }

    pub(crate) const fn sandbox(host: Weak<HostInner>, sandbox: Weak<SandboxInner>) -> Self {
        Self {
            host,
            sandbox: Some(sandbox),
        }
    }

    async fn invoke_ambient(&self, params: InvokeAmbientParams, cancel: CancellationToken) -> Result<Value> {
        let host = self
            .host
            .upgrade()
            .ok_or_else(|| Error::Channel("execution host has been dropped".to_string()))?;

        let sandbox = match &self.sandbox {
            Some(weak) => {
                let sandbox = weak
                    .upgrade()
                    .ok_or_else(|| ProtocolError::invalid_state("sandbox has been disposed"))?;
                if sandbox.id != params.sandbox_id {
                    return Err(ProtocolError::invalid_params(format!(
                        "ambient call from sandbox {} claims sandbox {}",
                        sandbox.id, params.sandbox_id
                    ))
                    .into());
                }
                Some(sandbox)
            }
            None => host.sandbox_inner(params.sandbox_id),
        };

        let handler = sandbox
            .as_ref()
            .and_then(|s| s.ambient_handler())
            .or_else(|| host.default_handler())
            .ok_or_else(|| Error::NoAmbientHandler {
                method: params.method_name.clone(),
            })?;
        let context = AmbientContext {
            sandbox_id: params.sandbox_id,
            sandbox_name: sandbox.map(|s| s.name.clone()).unwrap_or_default(),
        };

        debug!(
            target: TRACE_TARGET,
            sandbox_id = context.sandbox_id,
            method = %params.method_name,
            "ambient call"
        );
        handler
            .invoke(&params.method_name, params.params, &context, cancel)
            .await
    }
}

#[async_trait::async_trait]
impl Service for HostService {
    async fn handle_request(&self, ctx: RequestContext, method: &str, params: Value) -> Result<Value> {
        match method {
            INVOKE_AMBIENT => {
                let params: InvokeAmbientParams = parse_params(method, params)?;
                self.invoke_ambient(params, ctx.cancel).await
            }
            _ => Err(ProtocolError::method_not_found(method).into()),
        }
    }

    async fn handle_notification(&self, _ctx: RequestContext, method: &str, _params: Value) {
        match method {
            NOTIFY_STARTED => debug!("repeated readiness notification ignored"),
            _ => warn!(method, "unknown notification from worker"),
        }
    }
}

