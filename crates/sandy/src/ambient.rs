//! Guest-to-host capability calls.

use std::{future::Future, sync::Arc};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{ProtocolError, Result},
    protocol::{INVOKE_AMBIENT, InvokeAmbientParams, SandboxId},
    rpc::Endpoint,
};

tokio::task_local! {
    static CURRENT_CALL: CancellationToken;
}

/// Token of the guest call being executed on this task, if any.
pub fn current_call_token() -> Option<CancellationToken> {
    CURRENT_CALL.try_with(Clone::clone).ok()
}

pub(crate) async fn scope_call<F: Future>(token: CancellationToken, future: F) -> F::Output {
    CURRENT_CALL.scope(token, future).await
}

/// Identifies the sandbox an ambient call came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmbientContext {
    pub sandbox_id: SandboxId,
    pub sandbox_name: String,
}

/// Host-side implementation of the capabilities guests may call.
///
/// A handler registered on a sandbox takes precedence over the one registered
/// on the execution host.
#[async_trait::async_trait]
pub trait AmbientHandler: Send + Sync + 'static {
    async fn invoke(
        &self,
        method: &str,
        params: Value,
        context: &AmbientContext,
        cancel: CancellationToken,
    ) -> Result<Value>;
}

#[async_trait::async_trait]
impl<T: AmbientHandler + ?Sized> AmbientHandler for Arc<T> {
    async fn invoke(
        &self,
        method: &str,
        params: Value,
        context: &AmbientContext,
        cancel: CancellationToken,
    ) -> Result<Value> {
        (**self).invoke(method, params, context, cancel).await
    }
}

struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> AmbientHandler for FnHandler<F>
where
    F: Fn(String, Value, AmbientContext, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn invoke(
        &self,
        method: &str,
        params: Value,
        context: &AmbientContext,
        cancel: CancellationToken,
    ) -> Result<Value> {
        (self.0)(method.to_string(), params, context.clone(), cancel).await
    }
}

/// Builds an [`AmbientHandler`] from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn AmbientHandler>
where
    F: Fn(String, Value, AmbientContext, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// The capability handed to a guest module when it is initialized.
#[derive(Debug, Clone)]
pub struct Ambient {
    sandbox_id: SandboxId,
    name: String,
    endpoint: Endpoint,
}

impl Ambient {
    pub(crate) fn new(sandbox_id: SandboxId, endpoint: Endpoint) -> Self {
        Self {
            sandbox_id,
            name: format!("Sandbox {sandbox_id}"),
            endpoint,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn sandbox_id(&self) -> SandboxId {
        self.sandbox_id
    }

    /// Calls the host. Cancelled together with the guest call that issued it.
    pub async fn invoke(&self, method: &str, params: Value) -> Result<Value> {
        let token = current_call_token().unwrap_or_default();
        self.invoke_with_cancel(method, params, &token).await
    }

    pub async fn invoke_with_cancel(
        &self,
        method: &str,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        if method.is_empty() {
            return Err(ProtocolError::invalid_params("ambient method name must not be empty").into());
        }
        metrics::counter!("sandy_ambient_calls_total").increment(1);
        let params = serde_json::to_value(InvokeAmbientParams {
            method_name: method.to_string(),
            params,
            sandbox_id: self.sandbox_id,
        })
        .map_err(|err| ProtocolError::invalid_params(err.to_string()))?;
        self.endpoint.request(INVOKE_AMBIENT, params, cancel).await
    }
}
