use std::{path::PathBuf, time::Duration};

use tracing::info;

use crate::isolation::{Restrictions, TrustedResources};

pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SANDBOX_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_SANDBOX_ROOT: &str = "SandboxTemp";

/// Settings for an [`ExecutionHost`](crate::ExecutionHost).
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Worker binary started by process isolation.
    pub worker_executable: PathBuf,
    /// Extra arguments passed to the worker before the restriction options.
    pub worker_args: Vec<String>,
    /// Directory the worker runs in; created on demand.
    pub working_directory: PathBuf,
    /// Where per-sandbox channel sockets are created.
    pub socket_directory: PathBuf,
    pub startup_timeout: Duration,
    pub sandbox_startup_timeout: Duration,
    pub shutdown_grace: Duration,
    pub restrictions: Restrictions,
    pub trusted: TrustedResources,
}

impl HostConfig {
    pub fn new(worker_executable: impl Into<PathBuf>) -> Self {
        let temp = std::env::temp_dir();
        Self {
            worker_executable: worker_executable.into(),
            worker_args: Vec::new(),
            working_directory: temp.join("sandy"),
            socket_directory: temp,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            sandbox_startup_timeout: DEFAULT_SANDBOX_STARTUP_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            restrictions: Restrictions::default(),
            trusted: TrustedResources::default(),
        }
    }

    /// Like [`HostConfig::new`], with overrides from `SANDY_*` variables.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env(worker_executable: impl Into<PathBuf>) -> Self {
        let mut config = Self::new(worker_executable);

        let (working_directory, working_directory_source) = env_path("SANDY_WORKING_DIR")
            .map_or((config.working_directory.clone(), "default"), |p| (p, "env"));
        let (socket_directory, socket_directory_source) = env_path("SANDY_SOCKET_DIR")
            .map_or((config.socket_directory.clone(), "default"), |p| (p, "env"));
        let (startup_timeout, startup_timeout_source) =
            env_millis("SANDY_STARTUP_TIMEOUT_MS", DEFAULT_STARTUP_TIMEOUT);
        let (sandbox_startup_timeout, sandbox_startup_timeout_source) =
            env_millis("SANDY_SANDBOX_STARTUP_TIMEOUT_MS", DEFAULT_SANDBOX_STARTUP_TIMEOUT);
        let (shutdown_grace, shutdown_grace_source) =
            env_millis("SANDY_SHUTDOWN_GRACE_MS", DEFAULT_SHUTDOWN_GRACE);

        info!(
            worker_executable = %config.worker_executable.display(),
            working_directory = %working_directory.display(),
            working_directory_source,
            socket_directory = %socket_directory.display(),
            socket_directory_source,
            startup_timeout_ms = startup_timeout.as_millis(),
            startup_timeout_source,
            sandbox_startup_timeout_ms = sandbox_startup_timeout.as_millis(),
            sandbox_startup_timeout_source,
            shutdown_grace_ms = shutdown_grace.as_millis(),
            shutdown_grace_source,
            "Resolved execution host configuration"
        );

        config.working_directory = working_directory;
        config.socket_directory = socket_directory;
        config.startup_timeout = startup_timeout;
        config.sandbox_startup_timeout = sandbox_startup_timeout;
        config.shutdown_grace = shutdown_grace;
        config
    }

    #[must_use]
    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = dir.into();
        self
    }

    #[must_use]
    pub fn socket_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_directory = dir.into();
        self
    }

    #[must_use]
    pub fn worker_arg(mut self, arg: impl Into<String>) -> Self {
        self.worker_args.push(arg.into());
        self
    }

    #[must_use]
    pub const fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn sandbox_startup_timeout(mut self, timeout: Duration) -> Self {
        self.sandbox_startup_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    #[must_use]
    pub fn restrictions(mut self, restrictions: Restrictions) -> Self {
        self.restrictions = restrictions;
        self
    }

    #[must_use]
    pub fn trusted(mut self, trusted: TrustedResources) -> Self {
        self.trusted = trusted;
        self
    }
}

/// Settings for the worker side.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Parent of the per-sandbox working directories.
    pub sandbox_root: PathBuf,
    /// Paths guests are allowed to read.
    pub readable_paths: Vec<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            sandbox_root: PathBuf::from(DEFAULT_SANDBOX_ROOT),
            readable_paths: Vec::new(),
        }
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
}

fn env_millis(name: &str, default: Duration) -> (Duration, &'static str) {
    std::env::var(name).map_or((default, "default"), |raw| parse_millis(name, &raw, default))
}

fn parse_millis(name: &str, raw: &str, default: Duration) -> (Duration, &'static str) {
    match raw.trim().parse::<u64>() {
        Ok(0) => {
            tracing::warn!(%raw, "Zero {name}; falling back to default");
            (default, "default_invalid_env")
        }
        Ok(ms) => (Duration::from_millis(ms), "env"),
        Err(err) => {
            tracing::warn!(%raw, ?err, "Invalid {name}; falling back to default");
            (default, "default_invalid_env")
        }
    }
}
