//! The isolated side: creates sandboxes on request and serves guest calls.

mod context;

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use self::context::SandboxContext;
use crate::{
    config::WorkerConfig,
    error::{ProtocolError, Result},
    module::ModuleCompiler,
    protocol::{
        CREATE_SANDBOX, CreateSandboxParams, LOAD_SOURCE, LoadSourceParams, NOTIFY_STARTED,
        SHUTDOWN, SandboxId, parse_params,
    },
    rpc::{Endpoint, MessageReader, MessageWriter, RequestContext, Service},
};

/// How long shutdown waits for sandbox contexts to tear down.
const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// Registry of the sandboxes living in this worker.
pub struct WorkerService {
    config: WorkerConfig,
    compiler: Arc<dyn ModuleCompiler>,
    contexts: DashMap<SandboxId, Arc<SandboxContext>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    this: Weak<Self>,
}

impl WorkerService {
    pub fn new(config: WorkerConfig, compiler: Arc<dyn ModuleCompiler>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            compiler,
            contexts: DashMap::new(),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            this: this.clone(),
        })
    }

    pub fn sandbox_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn context(&self, id: SandboxId) -> Result<Arc<SandboxContext>> {
        self.contexts
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ProtocolError::invalid_state(format!("sandbox {id} does not exist")).into())
    }

    async fn create_sandbox(&self, params: CreateSandboxParams) -> Result<SandboxId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let work_dir = unique_work_dir(&self.config.sandbox_root, id).await?;
        tokio::fs::create_dir_all(&work_dir).await?;

        let context = SandboxContext::new(
            id,
            params.name,
            work_dir,
            Arc::clone(&self.compiler),
            self.shutdown.child_token(),
            self.this.clone(),
        );
        self.contexts.insert(id, Arc::clone(&context));
        context.spawn(params.channel_address);
        Ok(id)
    }

    fn deregister(&self, id: SandboxId) {
        self.contexts.remove(&id);
    }

    /// Tears down every sandbox and waits for them to finish.
    pub async fn dispose_all(&self) {
        self.shutdown.cancel();
        let contexts: Vec<Arc<SandboxContext>> =
            self.contexts.iter().map(|e| Arc::clone(e.value())).collect();
        let finished = futures::future::join_all(contexts.iter().map(|c| c.finished()));
        if tokio::time::timeout(TEARDOWN_GRACE, finished).await.is_err() {
            warn!(remaining = self.contexts.len(), "sandboxes did not tear down in time");
        }
    }

    fn abort_all(&self) {
        self.shutdown.cancel();
        for entry in &self.contexts {
            entry.value().abort();
        }
    }
}

#[async_trait::async_trait]
impl Service for WorkerService {
    async fn handle_request(&self, _ctx: RequestContext, method: &str, params: Value) -> Result<Value> {
        match method {
            CREATE_SANDBOX => {
                let params: CreateSandboxParams = parse_params(method, params)?;
                let id = self.create_sandbox(params).await?;
                Ok(json!(id))
            }
            LOAD_SOURCE => {
                let params: LoadSourceParams = parse_params(method, params)?;
                self.context(params.sandbox_id)?
                    .load_source(&params.content, params.display_name.as_deref())
                    .await?;
                Ok(Value::Null)
            }
            _ => Err(ProtocolError::method_not_found(method).into()),
        }
    }

    async fn handle_notification(&self, _ctx: RequestContext, method: &str, _params: Value) {
        match method {
            SHUTDOWN => {
                info!("shutdown requested by host");
                self.shutdown.cancel();
            }
            _ => warn!(method, "unknown notification on worker channel"),
        }
    }
}

/// `<root>/Sandbox<pid>#<id>`, suffixed `#<n>` when that already exists.
async fn unique_work_dir(root: &Path, id: SandboxId) -> Result<PathBuf> {
    let base = format!("Sandbox{}#{id}", std::process::id());
    let mut candidate = root.join(&base);
    let mut suffix = 1;
    while tokio::fs::try_exists(&candidate).await? {
        candidate = root.join(format!("{base}#{suffix}"));
        suffix += 1;
    }
    Ok(candidate)
}

/// Aborts everything the worker started if its task is dropped early.
struct AbortOnDrop {
    service: Arc<WorkerService>,
    endpoint: Endpoint,
    armed: bool,
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.service.abort_all();
            self.endpoint.abort();
        }
    }
}

/// Serves the worker channel until the host asks for shutdown or goes away.
pub async fn run_worker<R, W>(
    reader: R,
    writer: W,
    compiler: Arc<dyn ModuleCompiler>,
    config: WorkerConfig,
) -> Result<()>
where
    R: AsyncRead + Send + 'static,
    W: AsyncWrite + Send + 'static,
{
    let service = WorkerService::new(config, compiler);
    let endpoint = Endpoint::attach(
        "worker",
        MessageReader::new(reader),
        MessageWriter::new(writer),
        Arc::clone(&service) as Arc<dyn Service>,
    );
    let mut guard = AbortOnDrop {
        service: Arc::clone(&service),
        endpoint: endpoint.clone(),
        armed: true,
    };

    endpoint.notify(NOTIFY_STARTED, Value::Null).await?;
    info!(
        pid = std::process::id(),
        sandbox_root = %service.config.sandbox_root.display(),
        "worker started"
    );

    tokio::select! {
        () = service.shutdown.cancelled() => {}
        () = endpoint.closed() => warn!("host channel closed; shutting down"),
    }

    service.dispose_all().await;
    endpoint.close().await;
    guard.armed = false;
    info!("worker stopped");
    Ok(())
}
