//! How a worker is started apart from the host.

use std::{
    path::PathBuf,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    process::{Child, Command},
    task::{AbortHandle, JoinHandle},
};
use tracing::{debug, info};

use crate::{
    config::WorkerConfig,
    error::{Error, Result},
    module::ModuleCompiler,
    rpc::{BoxedReader, BoxedWriter},
    worker::run_worker,
};

/// Environment variables a process worker inherits from the host.
const INHERITED_ENV: &[&str] = &["PATH", "RUST_LOG", "RUST_BACKTRACE", "TMPDIR", "LANG"];

/// Limits applied to a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Restrictions {
    pub working_directory: Option<PathBuf>,
    pub max_memory: Option<u64>,
    pub max_open_files: Option<u64>,
    pub max_cpu_seconds: Option<u64>,
    pub allow_network: bool,
    /// Additional host environment variables the worker may see.
    pub env_allowlist: Vec<String>,
}

impl Restrictions {
    /// Command-line form understood by the worker binary.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(bytes) = self.max_memory {
            args.push(format!("--max-memory={bytes}"));
        }
        if let Some(files) = self.max_open_files {
            args.push(format!("--max-open-files={files}"));
        }
        if let Some(seconds) = self.max_cpu_seconds {
            args.push(format!("--max-cpu-seconds={seconds}"));
        }
        if !self.allow_network {
            args.push("--no-network".to_string());
        }
        args
    }
}

/// Resources a worker may use despite its restrictions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustedResources {
    pub readable_paths: Vec<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// A started worker: its end of the worker channel and a handle to stop it.
pub struct IsolatedWorker {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub handle: Box<dyn IsolatedHandle>,
}

#[async_trait::async_trait]
pub trait IsolatedHandle: Send + 'static {
    fn id(&self) -> String;

    /// Waits up to `grace` for the worker to exit; `true` if it did.
    async fn wait(&mut self, grace: Duration) -> bool;

    /// Stops the worker unconditionally.
    async fn terminate(&mut self) -> Result<()>;
}

#[async_trait::async_trait]
pub trait IsolationPrimitive: Send + Sync + 'static {
    async fn spawn(
        &self,
        restrictions: &Restrictions,
        trusted: &TrustedResources,
    ) -> Result<IsolatedWorker>;
}

#[async_trait::async_trait]
impl<T: IsolationPrimitive + ?Sized> IsolationPrimitive for Arc<T> {
    async fn spawn(
        &self,
        restrictions: &Restrictions,
        trusted: &TrustedResources,
    ) -> Result<IsolatedWorker> {
        (**self).spawn(restrictions, trusted).await
    }
}

/// Runs the worker as a child process talking over stdin/stdout.
///
/// The child starts with a cleared environment; only [`INHERITED_ENV`],
/// the restriction allowlist and the trusted variables are passed in.
#[derive(Debug, Clone)]
pub struct ProcessIsolation {
    executable: PathBuf,
    args: Vec<String>,
}

impl ProcessIsolation {
    pub fn new(executable: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            args,
        }
    }
}

#[async_trait::async_trait]
impl IsolationPrimitive for ProcessIsolation {
    async fn spawn(
        &self,
        restrictions: &Restrictions,
        trusted: &TrustedResources,
    ) -> Result<IsolatedWorker> {
        let executable = std::path::absolute(&self.executable).map_err(|err| {
            Error::Startup(format!("invalid worker path {}: {err}", self.executable.display()))
        })?;

        let mut command = Command::new(&executable);
        command
            .args(&self.args)
            .args(restrictions.to_args())
            .args(
                trusted
                    .readable_paths
                    .iter()
                    .map(|p| format!("--trusted-path={}", p.display())),
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .env_clear();
        let inherited = INHERITED_ENV
            .iter()
            .copied()
            .chain(restrictions.env_allowlist.iter().map(String::as_str));
        for key in inherited {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }
        command.envs(trusted.env.iter().map(|(k, v)| (k, v)));
        if let Some(dir) = &restrictions.working_directory {
            tokio::fs::create_dir_all(dir).await?;
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|err| {
            Error::Startup(format!("failed to spawn worker {}: {err}", executable.display()))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Startup("worker stdin is not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Startup("worker stdout is not piped".to_string()))?;
        info!(pid = child.id(), executable = %executable.display(), "worker process spawned");

        Ok(IsolatedWorker {
            reader: Box::pin(stdout),
            writer: Box::pin(stdin),
            handle: Box::new(ProcessHandle { child }),
        })
    }
}

struct ProcessHandle {
    child: Child,
}

#[async_trait::async_trait]
impl IsolatedHandle for ProcessHandle {
    fn id(&self) -> String {
        self.child
            .id()
            .map_or_else(|| "exited process".to_string(), |pid| format!("pid {pid}"))
    }

    async fn wait(&mut self, grace: Duration) -> bool {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(%status, "worker process exited");
                true
            }
            Ok(Err(err)) => {
                debug!(%err, "waiting for worker process failed");
                false
            }
            Err(_) => false,
        }
    }

    async fn terminate(&mut self) -> Result<()> {
        if self.child.try_wait()?.is_none() {
            self.child.kill().await?;
        }
        Ok(())
    }
}

/// Runs the worker as a task of the current runtime, connected through an
/// in-memory pipe.
///
/// Offers no isolation at all; meant for tests and embedding.
/// [`InProcessIsolation::terminate_all`] aborts every worker it started, which
/// looks to the host exactly like a crashed worker process.
#[derive(Clone)]
pub struct InProcessIsolation {
    compiler: Arc<dyn ModuleCompiler>,
    config: WorkerConfig,
    spawned: Arc<Mutex<Vec<AbortHandle>>>,
    next_id: Arc<AtomicU64>,
}

impl InProcessIsolation {
    pub fn new(compiler: Arc<dyn ModuleCompiler>, config: WorkerConfig) -> Self {
        Self {
            compiler,
            config,
            spawned: Arc::default(),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn terminate_all(&self) {
        for task in self.spawned.lock().drain(..) {
            task.abort();
        }
    }
}

#[async_trait::async_trait]
impl IsolationPrimitive for InProcessIsolation {
    async fn spawn(
        &self,
        _restrictions: &Restrictions,
        _trusted: &TrustedResources,
    ) -> Result<IsolatedWorker> {
        let (host_side, worker_side) = tokio::io::duplex(64 * 1024);
        let (worker_reader, worker_writer) = tokio::io::split(worker_side);
        let (host_reader, host_writer) = tokio::io::split(host_side);

        let task = tokio::spawn(run_worker(
            worker_reader,
            worker_writer,
            Arc::clone(&self.compiler),
            self.config.clone(),
        ));
        self.spawned.lock().push(task.abort_handle());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        Ok(IsolatedWorker {
            reader: Box::pin(host_reader),
            writer: Box::pin(host_writer),
            handle: Box::new(TaskHandle {
                id,
                task: Some(task),
            }),
        })
    }
}

struct TaskHandle {
    id: u64,
    task: Option<JoinHandle<Result<()>>>,
}

#[async_trait::async_trait]
impl IsolatedHandle for TaskHandle {
    fn id(&self) -> String {
        format!("in-process worker {}", self.id)
    }

    async fn wait(&mut self, grace: Duration) -> bool {
        let Some(task) = self.task.as_mut() else {
            return true;
        };
        match tokio::time::timeout(grace, task).await {
            Ok(result) => {
                if let Ok(Err(err)) = result {
                    debug!(%err, "in-process worker failed");
                }
                self.task = None;
                true
            }
            Err(_) => false,
        }
    }

    async fn terminate(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        Ok(())
    }
}
