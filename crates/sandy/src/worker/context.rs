use std::{
    path::PathBuf,
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::{net::UnixStream, task::AbortHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::WorkerService;
use crate::{
    TRACE_TARGET,
    ambient::Ambient,
    error::{Error, LoadError, ProtocolError, Result},
    lifecycle::{SandboxState, StateCell},
    module::{LoadedModule, ModuleCompiler},
    protocol::{DISPOSE, INVOKE, InvokeParams, NOTIFY_STARTED, SandboxId, parse_params},
    resources::{OwnedPath, ResourceStack},
    rpc::{Endpoint, MessageReader, MessageWriter, RequestContext, Service},
};

/// Worker-side state of one sandbox.
pub struct SandboxContext {
    id: SandboxId,
    name: String,
    state: StateCell,
    compiler: Arc<dyn ModuleCompiler>,
    module: RwLock<Option<Arc<LoadedModule>>>,
    units: AtomicU64,
    endpoint: OnceLock<Endpoint>,
    resources: ResourceStack,
    disposal: CancellationToken,
    finished: CancellationToken,
    task: Mutex<Option<AbortHandle>>,
    owner: Weak<WorkerService>,
}

impl SandboxContext {
    pub(super) fn new(
        id: SandboxId,
        name: String,
        work_dir: PathBuf,
        compiler: Arc<dyn ModuleCompiler>,
        disposal: CancellationToken,
        owner: Weak<WorkerService>,
    ) -> Arc<Self> {
        let resources = ResourceStack::default();
        resources.push(OwnedPath::directory(work_dir));
        Arc::new(Self {
            id,
            name,
            state: StateCell::new(),
            compiler,
            module: RwLock::new(None),
            units: AtomicU64::new(0),
            endpoint: OnceLock::new(),
            resources,
            disposal,
            finished: CancellationToken::new(),
            task: Mutex::new(None),
            owner,
        })
    }

    pub const fn id(&self) -> SandboxId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SandboxState {
        self.state.get()
    }

    pub(super) fn spawn(self: &Arc<Self>, address: String) {
        let span = info_span!("sandbox", sandbox_id = self.id, name = %self.name);
        let task = tokio::spawn(Arc::clone(self).run(address).instrument(span));
        *self.task.lock() = Some(task.abort_handle());
    }

    pub(super) async fn finished(&self) {
        self.finished.cancelled().await;
    }

    /// Drops everything without running teardown.
    pub(super) fn abort(&self) {
        self.disposal.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        if let Some(endpoint) = self.endpoint.get() {
            endpoint.abort();
        }
    }

    async fn run(self: Arc<Self>, address: String) {
        if let Err(err) = self.serve(&address).await {
            warn!(%err, "sandbox channel failed");
        }
        self.teardown().await;
    }

    async fn serve(self: &Arc<Self>, address: &str) -> Result<()> {
        let stream = tokio::select! {
            stream = UnixStream::connect(address) => stream.map_err(|err| {
                Error::Startup(format!("failed to connect to {address}: {err}"))
            })?,
            () = self.disposal.cancelled() => return Ok(()),
        };
        let (reader, writer) = stream.into_split();
        let service = Arc::new(ContextService {
            context: Arc::downgrade(self),
        });
        let endpoint = Endpoint::attach(
            format!("worker/sandbox-{}", self.id),
            MessageReader::new(reader),
            MessageWriter::new(writer),
            service,
        );
        let _ = self.endpoint.set(endpoint.clone());
        self.resources.push(endpoint.clone());

        self.state.advance(SandboxState::Started);
        endpoint.notify(NOTIFY_STARTED, Value::Null).await?;
        info!("sandbox started");

        tokio::select! {
            () = self.disposal.cancelled() => debug!("sandbox disposal requested"),
            () = endpoint.closed() => info!("sandbox channel closed by host"),
        }
        Ok(())
    }

    async fn teardown(&self) {
        self.state.advance(SandboxState::Stopped);
        let module = self.module.write().take();
        if let Some(module) = module {
            module.dispose();
        }
        self.resources.release_all().await;
        self.state.advance(SandboxState::Disposed);
        if let Some(owner) = self.owner.upgrade() {
            owner.deregister(self.id);
        }
        info!("sandbox disposed");
        self.finished.cancel();
    }

    /// Compiles `content` and makes its module the active one.
    ///
    /// On failure the previously loaded module, if any, stays active.
    pub async fn load_source(&self, content: &str, display_name: Option<&str>) -> Result<()> {
        self.state.ensure(SandboxState::Started, "load a module")?;
        let endpoint = self
            .endpoint
            .get()
            .cloned()
            .ok_or_else(|| ProtocolError::invalid_state("sandbox channel is not connected"))?;

        let unit_name = format!("Module{}", self.units.fetch_add(1, Ordering::Relaxed) + 1);
        let display_label = display_name.unwrap_or(&unit_name);
        let unit = self
            .compiler
            .compile(content, &unit_name)
            .await
            .map_err(|err| LoadError::Compile(format!("{display_label}: {err}")))?;
        let loaded = Arc::new(LoadedModule::instantiate(&unit, Ambient::new(self.id, endpoint))?);
        info!(
            target: TRACE_TARGET,
            sandbox_id = self.id,
            source = display_label,
            module = loaded.type_name(),
            methods = loaded.methods().len(),
            "guest module loaded"
        );

        let previous = self.module.write().replace(loaded);
        if let Some(previous) = previous {
            previous.dispose();
        }
        Ok(())
    }

    pub async fn invoke(&self, params: InvokeParams, cancel: CancellationToken) -> Result<Value> {
        self.state.ensure(SandboxState::Started, "invoke a method")?;
        if params.sandbox_id != self.id {
            return Err(ProtocolError::invalid_params(format!(
                "invocation addressed to sandbox {} arrived on the channel of sandbox {}",
                params.sandbox_id, self.id
            ))
            .into());
        }
        let module = self
            .module
            .read()
            .clone()
            .ok_or_else(|| ProtocolError::invalid_state("no module has been loaded"))?;
        module
            .invoke(&params.name, &params.positional_params, &params.named_params, cancel)
            .await
    }
}

struct ContextService {
    context: Weak<SandboxContext>,
}

impl ContextService {
    fn context(&self) -> Result<Arc<SandboxContext>> {
        self.context
            .upgrade()
            .ok_or_else(|| ProtocolError::invalid_state("sandbox has been disposed").into())
    }
}

#[async_trait::async_trait]
impl Service for ContextService {
    async fn handle_request(&self, ctx: RequestContext, method: &str, params: Value) -> Result<Value> {
        match method {
            INVOKE => {
                let params: InvokeParams = parse_params(method, params)?;
                debug!(target: TRACE_TARGET, method = %params.name, "invoke");
                self.context()?.invoke(params, ctx.cancel).await
            }
            _ => Err(ProtocolError::method_not_found(method).into()),
        }
    }

    async fn handle_notification(&self, _ctx: RequestContext, method: &str, _params: Value) {
        match method {
            DISPOSE => {
                if let Ok(context) = self.context() {
                    context.disposal.cancel();
                }
            }
            _ => warn!(method, "unknown notification on sandbox channel"),
        }
    }
}
