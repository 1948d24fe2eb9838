use std::{
    path::{Path, PathBuf},
    sync::{Arc, Weak},
};

use parking_lot::RwLock;
use serde_json::{Map, Value, json};
use tokio::{
    net::{UnixListener, unix::OwnedWriteHalf},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span};

use super::{HostInner, WorkerConnection, service::HostService};
use crate::{
    ambient::AmbientHandler,
    error::{Error, ProtocolError, Result},
    lifecycle::{SandboxState, StateCell},
    protocol::{
        CREATE_SANDBOX, CreateSandboxParams, DISPOSE, INVOKE, InvokeParams, LOAD_SOURCE,
        LoadSourceParams, NOTIFY_STARTED, SandboxId,
    },
    resources::{Held, OwnedPath, ResourceStack},
    rpc::{Endpoint, MessageReader, MessageWriter},
};

pub(crate) struct SandboxInner {
    pub(crate) id: SandboxId,
    pub(crate) name: String,
    state: StateCell,
    endpoint: Endpoint,
    worker: Endpoint,
    resources: ResourceStack,
    handler: RwLock<Option<Arc<dyn AmbientHandler>>>,
    host: Weak<HostInner>,
    disposed: CancellationToken,
    dispose_lock: tokio::sync::Mutex<()>,
}

impl SandboxInner {
    pub(crate) fn ambient_handler(&self) -> Option<Arc<dyn AmbientHandler>> {
        self.handler.read().clone()
    }

    async fn dispose(&self, notify_worker: bool) {
        let _serialized = self.dispose_lock.lock().await;
        let Some(previous) = self.state.advance(SandboxState::Stopped) else {
            return;
        };
        if previous == SandboxState::Started && notify_worker {
            if let Err(err) = self.endpoint.notify(DISPOSE, Value::Null).await {
                debug!(sandbox_id = self.id, %err, "dispose notification not delivered");
            }
        }
        self.resources.release_all().await;
        if let Some(host) = self.host.upgrade() {
            host.sandboxes.remove(&self.id);
        }
        self.state.advance(SandboxState::Disposed);
        self.disposed.cancel();
        metrics::counter!("sandy_sandboxes_disposed_total").increment(1);
        info!(sandbox_id = self.id, name = %self.name, "sandbox disposed");
    }
}

/// Host-side handle to a sandbox living in the worker.
///
/// Cheap to clone; all clones refer to the same sandbox.
#[derive(Clone)]
pub struct Sandbox {
    pub(crate) inner: Arc<SandboxInner>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Asks the worker for a sandbox and waits for its channel to come up.
    ///
    /// Everything acquired on the way is released again if any step fails.
    pub(crate) async fn start(
        host: &Arc<HostInner>,
        worker: &WorkerConnection,
        name: &str,
    ) -> Result<Self> {
        let resources = ResourceStack::default();
        match Self::handshake(host, worker, name, resources).await {
            Ok(sandbox) => Ok(sandbox),
            Err((err, resources)) => {
                resources.release_all().await;
                Err(err)
            }
        }
    }

    async fn handshake(
        host: &Arc<HostInner>,
        worker: &WorkerConnection,
        name: &str,
        resources: ResourceStack,
    ) -> Result<Self, (Error, ResourceStack)> {
        macro_rules! tri {
            ($e:expr) => {
                match $e {
                    Ok(v) => v,
                    Err(err) => return Err((Error::from(err), resources)),
                }
            };
        }

        let address = tri!(channel_address(&host.config.socket_directory).await);
        let listener = tri!(UnixListener::bind(&address).map_err(|err| {
            Error::Startup(format!("cannot listen on {}: {err}", address.display()))
        }));
        resources.push(OwnedPath::file(address.clone()));
        let listener = Arc::new(listener);
        resources.push(Held("sandbox listener", Arc::clone(&listener)));

        let params = json!(CreateSandboxParams {
            name: name.to_string(),
            channel_address: address.display().to_string(),
        });
        let timeout = host.config.sandbox_startup_timeout;
        let deadline = Instant::now() + timeout;
        let created = tokio::time::timeout_at(
            deadline,
            worker
                .endpoint
                .request(CREATE_SANDBOX, params, &CancellationToken::new()),
        )
        .await;
        let id = match created {
            Ok(result) => tri!(result),
            Err(_) => {
                return Err((
                    Error::Startup(format!(
                        "worker did not create sandbox `{name}` within {timeout:?}"
                    )),
                    resources,
                ));
            }
        };
        let id: SandboxId = tri!(serde_json::from_value(id).map_err(|err| {
            ProtocolError::invalid_params(format!("CreateSandbox returned a bad id: {err}"))
        }));

        let (reader, writer) = match tokio::time::timeout_at(deadline, accept(&listener, id)).await {
            Ok(result) => tri!(result),
            Err(_) => {
                return Err((
                    Error::Startup(format!(
                        "sandbox {id} did not signal readiness within {timeout:?}"
                    )),
                    resources,
                ));
            }
        };

        let inner = Arc::new_cyclic(|weak: &Weak<SandboxInner>| {
            let service = HostService::sandbox(Arc::downgrade(host), weak.clone());
            let endpoint = Endpoint::attach(
                format!("host/sandbox-{id}"),
                reader,
                MessageWriter::new(writer),
                Arc::new(service),
            );
            resources.push(endpoint.clone());
            SandboxInner {
                id,
                name: name.to_string(),
                state: StateCell::new(),
                endpoint,
                worker: worker.endpoint.clone(),
                resources,
                handler: RwLock::new(None),
                host: Arc::downgrade(host),
                disposed: CancellationToken::new(),
                dispose_lock: tokio::sync::Mutex::new(()),
            }
        });
        inner.state.advance(SandboxState::Started);
        spawn_watcher(&inner);
        info!(sandbox_id = id, name, channel = %address.display(), "sandbox started");
        Ok(Self { inner })
    }

    pub fn id(&self) -> SandboxId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> SandboxState {
        self.inner.state.get()
    }

    /// Number of host resources still held for this sandbox.
    pub fn open_handles(&self) -> usize {
        self.inner.resources.len()
    }

    /// Handler consulted before the host-wide one for this sandbox's calls.
    pub fn set_ambient_handler(&self, handler: Arc<dyn AmbientHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    pub fn clear_ambient_handler(&self) {
        *self.inner.handler.write() = None;
    }

    pub async fn load_source(&self, content: &str) -> Result<()> {
        self.load_named_source(content, None, &CancellationToken::new())
            .await
    }

    /// Loads source, naming it `display_name` in diagnostics.
    pub async fn load_named_source(
        &self,
        content: &str,
        display_name: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.inner.state.ensure(SandboxState::Started, "load source")?;
        let params = json!(LoadSourceParams {
            sandbox_id: self.inner.id,
            content: content.to_string(),
            display_name: display_name.map(ToString::to_string),
        });
        self.settle(self.inner.worker.request(LOAD_SOURCE, params, cancel).await)
            .await
            .map(|_| ())
    }

    /// Reads `path` and loads it, named after the file.
    pub async fn load_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|err| {
            ProtocolError::invalid_params(format!("cannot read {}: {err}", path.display()))
        })?;
        let display = path.display().to_string();
        self.load_named_source(&content, Some(&display), &CancellationToken::new())
            .await
    }

    pub async fn invoke(&self, name: &str, positional: Vec<Value>, named: Map<String, Value>) -> Result<Value> {
        self.invoke_with_cancel(name, positional, named, &CancellationToken::new())
            .await
    }

    pub async fn invoke_with_cancel(
        &self,
        name: &str,
        positional: Vec<Value>,
        named: Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.inner.state.ensure(SandboxState::Started, "invoke")?;
        let params = json!(InvokeParams {
            sandbox_id: self.inner.id,
            name: name.to_string(),
            positional_params: positional,
            named_params: named,
        });
        let span = info_span!("sandbox.invoke", sandbox_id = self.inner.id, method = name);
        let result = self
            .inner
            .endpoint
            .request(INVOKE, params, cancel)
            .instrument(span)
            .await;
        self.settle(result).await
    }

    /// Disposes the sandbox after a channel failure so callers observe it
    /// as disposed once the error is returned.
    async fn settle(&self, result: Result<Value>) -> Result<Value> {
        if matches!(result, Err(Error::Channel(_))) && self.inner.endpoint.is_closed() {
            self.inner.dispose(false).await;
        }
        result
    }

    /// Tears the sandbox down. Idempotent.
    pub async fn dispose(&self) {
        self.inner.dispose(true).await;
    }

    /// Resolves once the sandbox is disposed, for whatever reason.
    pub async fn disposed(&self) {
        self.inner.disposed.cancelled().await;
    }
}

/// Waits for the worker to connect and announce the sandbox.
async fn accept(listener: &UnixListener, id: SandboxId) -> Result<(MessageReader, OwnedWriteHalf)> {
    let (stream, _) = listener.accept().await?;
    let (reader, writer) = stream.into_split();
    let mut reader = MessageReader::new(reader);
    match reader
        .read_matching(|m| m.is_notification_of(NOTIFY_STARTED))
        .await?
    {
        Some(_) => Ok((reader, writer)),
        None => Err(Error::Startup(format!(
            "sandbox {id} closed its channel before signalling readiness"
        ))),
    }
}

async fn channel_address(dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await.map_err(|err| {
        Error::Startup(format!("cannot create socket directory {}: {err}", dir.display()))
    })?;
    let suffix: u64 = rand::random();
    Ok(dir.join(format!("sandy-{}-{suffix:016x}.sock", std::process::id())))
}

/// Disposes the sandbox when its channel closes underneath it.
fn spawn_watcher(inner: &Arc<SandboxInner>) {
    let weak = Arc::downgrade(inner);
    let endpoint = inner.endpoint.clone();
    let disposed = inner.disposed.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = endpoint.closed() => {}
            () = disposed.cancelled() => return,
        }
        drop(endpoint);
        if let Some(inner) = weak.upgrade() {
            if inner.state.get() < SandboxState::Stopped {
                tracing::warn!(sandbox_id = inner.id, "sandbox channel lost; disposing");
            }
            inner.dispose(false).await;
        }
    });
}
