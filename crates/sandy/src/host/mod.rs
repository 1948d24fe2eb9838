//! The host side: starts the worker lazily and manages sandboxes in it.

mod sandbox;
mod service;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

pub use self::sandbox::Sandbox;
use self::{sandbox::SandboxInner, service::HostService};
use crate::{
    ambient::AmbientHandler,
    config::HostConfig,
    error::{Error, ProtocolError, Result},
    isolation::{IsolatedHandle, IsolatedWorker, IsolationPrimitive, ProcessIsolation},
    protocol::{NOTIFY_STARTED, SHUTDOWN, SandboxId},
    resources::ResourceStack,
    rpc::{Endpoint, MessageReader, MessageWriter},
};

/// How long a worker that failed to start gets to exit before it is killed.
const FAILED_START_GRACE: Duration = Duration::from_secs(1);

pub(crate) struct WorkerConnection {
    endpoint: Endpoint,
    handle: Mutex<Box<dyn IsolatedHandle>>,
    resources: ResourceStack,
}

impl WorkerConnection {
    async fn shutdown(&self, grace: Duration) {
        if let Err(err) = self.endpoint.notify(SHUTDOWN, Value::Null).await {
            debug!(%err, "shutdown notification not delivered");
        }
        let mut handle = self.handle.lock().await;
        if !handle.wait(grace).await {
            warn!(worker = %handle.id(), ?grace, "worker did not exit in time; terminating");
            if let Err(err) = handle.terminate().await {
                warn!(%err, "failed to terminate worker");
            }
        }
        self.resources.release_all().await;
        info!(worker = %handle.id(), "worker stopped");
    }
}

pub(crate) struct HostInner {
    config: HostConfig,
    isolation: Arc<dyn IsolationPrimitive>,
    worker: OnceCell<Result<Arc<WorkerConnection>, String>>,
    sandboxes: DashMap<SandboxId, Sandbox>,
    default_handler: RwLock<Option<Arc<dyn AmbientHandler>>>,
    shut_down: AtomicBool,
    gate: tokio::sync::RwLock<()>,
}

impl HostInner {
    pub(crate) fn default_handler(&self) -> Option<Arc<dyn AmbientHandler>> {
        self.default_handler.read().clone()
    }

    pub(crate) fn sandbox_inner(&self, id: SandboxId) -> Option<Arc<SandboxInner>> {
        self.sandboxes.get(&id).map(|s| Arc::clone(&s.inner))
    }

    /// The running worker, started on first use.
    ///
    /// A failed start is remembered; the host never retries it.
    async fn worker(self: &Arc<Self>) -> Result<Arc<WorkerConnection>> {
        let started = self
            .worker
            .get_or_init(|| async {
                self.start_worker().await.map_err(|err| {
                    metrics::counter!("sandy_startup_failures_total").increment(1);
                    warn!(%err, "worker failed to start");
                    err.to_string()
                })
            })
            .await;
        match started {
            Ok(worker) => Ok(Arc::clone(worker)),
            Err(reason) => Err(Error::Startup(reason.clone())),
        }
    }

    async fn start_worker(self: &Arc<Self>) -> Result<Arc<WorkerConnection>> {
        let mut restrictions = self.config.restrictions.clone();
        restrictions
            .working_directory
            .get_or_insert_with(|| self.config.working_directory.clone());

        let IsolatedWorker {
            reader,
            writer,
            mut handle,
        } = self.isolation.spawn(&restrictions, &self.config.trusted).await?;
        let mut reader = MessageReader::new(reader);
        let writer = MessageWriter::new(writer);

        let timeout = self.config.startup_timeout;
        let ready = tokio::time::timeout(
            timeout,
            reader.read_matching(|m| m.is_notification_of(NOTIFY_STARTED)),
        )
        .await;
        let failure = match ready {
            Ok(Ok(Some(_))) => None,
            Ok(Ok(None)) => Some("worker closed its channel before signalling readiness".to_string()),
            Ok(Err(err)) => Some(format!("worker channel failed during startup: {err}")),
            Err(_) => Some(format!("worker did not signal readiness within {timeout:?}")),
        };
        if let Some(reason) = failure {
            writer.close().await;
            drop(reader);
            if !handle.wait(FAILED_START_GRACE).await {
                if let Err(err) = handle.terminate().await {
                    warn!(%err, worker = %handle.id(), "failed to terminate worker");
                }
            }
            return Err(Error::Startup(reason));
        }

        let endpoint = Endpoint::attach(
            "host/worker",
            reader,
            writer,
            Arc::new(HostService::worker(Arc::downgrade(self))),
        );
        let resources = ResourceStack::default();
        resources.push(endpoint.clone());
        info!(worker = %handle.id(), "worker started");
        Ok(Arc::new(WorkerConnection {
            endpoint,
            handle: Mutex::new(handle),
            resources,
        }))
    }
}

/// Owns the worker and every sandbox created in it.
///
/// The worker starts on the first [`ExecutionHost::create_sandbox`] call.
/// Call [`ExecutionHost::shutdown`] before dropping the host; process workers
/// are killed if the host is dropped without it.
#[derive(Clone)]
pub struct ExecutionHost {
    inner: Arc<HostInner>,
}

impl ExecutionHost {
    pub fn new(config: HostConfig, isolation: Arc<dyn IsolationPrimitive>) -> Self {
        Self {
            inner: Arc::new(HostInner {
                config,
                isolation,
                worker: OnceCell::new(),
                sandboxes: DashMap::new(),
                default_handler: RwLock::new(None),
                shut_down: AtomicBool::new(false),
                gate: tokio::sync::RwLock::new(()),
            }),
        }
    }

    /// A host running its worker as a child process.
    pub fn process(config: HostConfig) -> Self {
        let isolation = ProcessIsolation::new(
            config.worker_executable.clone(),
            config.worker_args.clone(),
        );
        Self::new(config, Arc::new(isolation))
    }

    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    /// Handler used for sandboxes that have none of their own.
    pub fn set_ambient_handler(&self, handler: Arc<dyn AmbientHandler>) {
        *self.inner.default_handler.write() = Some(handler);
    }

    pub fn clear_ambient_handler(&self) {
        *self.inner.default_handler.write() = None;
    }

    pub async fn create_sandbox(&self, name: &str) -> Result<Sandbox> {
        let _gate = self.inner.gate.read().await;
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(ProtocolError::invalid_state("execution host has been shut down").into());
        }
        let worker = self.inner.worker().await?;
        let sandbox = Sandbox::start(&self.inner, &worker, name).await?;
        self.inner.sandboxes.insert(sandbox.id(), sandbox.clone());
        metrics::counter!("sandy_sandboxes_created_total").increment(1);
        Ok(sandbox)
    }

    pub fn try_get_sandbox(&self, id: SandboxId) -> Option<Sandbox> {
        self.inner.sandboxes.get(&id).map(|s| s.value().clone())
    }

    pub fn sandbox_count(&self) -> usize {
        self.inner.sandboxes.len()
    }

    /// Disposes every sandbox, then stops the worker. Idempotent.
    pub async fn shutdown(&self) {
        let _gate = self.inner.gate.write().await;
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let ids: Vec<SandboxId> = self.inner.sandboxes.iter().map(|e| *e.key()).collect();
        for id in ids {
            let sandbox = self.inner.sandboxes.remove(&id).map(|(_, s)| s);
            if let Some(sandbox) = sandbox {
                sandbox.dispose().await;
            }
        }
        if let Some(Ok(worker)) = self.inner.worker.get() {
            worker.shutdown(self.inner.config.shutdown_grace).await;
        }
    }
}
