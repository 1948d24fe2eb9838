use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, anyhow, bail};
use sandy::{WorkerConfig, config::DEFAULT_SANDBOX_ROOT, worker::run_worker};
use tokio::net::unix::pipe;

mod catalog;
mod logging;

const DEBUGGER_WAIT_SECS: u64 = 3;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Command line of the worker process. Every flag is `--key=value` or a bare
/// `--switch`.
#[derive(Debug, Default, PartialEq, Eq)]
struct Options {
    sandbox_path: Option<PathBuf>,
    rx_pipe: Option<PathBuf>,
    tx_pipe: Option<PathBuf>,
    max_memory: Option<u64>,
    max_open_files: Option<u64>,
    max_cpu_seconds: Option<u64>,
    trusted_paths: Vec<PathBuf>,
    /// Forwarded by the host and logged; isolation of the network is left to
    /// the deployment.
    no_network: bool,
    /// Pause before serving. Keep it below the host's startup timeout or the
    /// host gives up on the worker first.
    wait_for_debugger: Option<Duration>,
}

impl Options {
    fn parse(args: impl IntoIterator<Item = String>) -> anyhow::Result<Self> {
        let mut options = Self::default();
        for arg in args {
            let (key, value) = match arg.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (arg.as_str(), None),
            };
            let value = || value.ok_or_else(|| anyhow!("{key} needs a value"));
            let number = || -> anyhow::Result<u64> {
                let raw = value()?;
                raw.parse()
                    .with_context(|| format!("{key} expects a number, got `{raw}`"))
            };
            match key {
                "--sandbox-path" => options.sandbox_path = Some(value()?.into()),
                "--rx-pipe" => options.rx_pipe = Some(value()?.into()),
                "--tx-pipe" => options.tx_pipe = Some(value()?.into()),
                "--max-memory" => options.max_memory = Some(number()?),
                "--max-open-files" => options.max_open_files = Some(number()?),
                "--max-cpu-seconds" => options.max_cpu_seconds = Some(number()?),
                "--trusted-path" => options.trusted_paths.push(value()?.into()),
                "--no-network" => options.no_network = true,
                "--wait-for-debugger" => {
                    let secs = if arg.contains('=') {
                        number()?
                    } else {
                        DEBUGGER_WAIT_SECS
                    };
                    options.wait_for_debugger = Some(Duration::from_secs(secs));
                }
                other => bail!("unknown argument `{other}`"),
            }
        }
        Ok(options)
    }

    fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            sandbox_root: self
                .sandbox_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SANDBOX_ROOT)),
            readable_paths: self.trusted_paths.clone(),
        }
    }
}

fn apply_limits(options: &Options) -> anyhow::Result<()> {
    let limits = [
        (rlimit::Resource::AS, options.max_memory, "memory"),
        (rlimit::Resource::NOFILE, options.max_open_files, "open files"),
        (rlimit::Resource::CPU, options.max_cpu_seconds, "cpu time"),
    ];
    for (resource, limit, what) in limits {
        if let Some(limit) = limit {
            rlimit::setrlimit(resource, limit, limit)
                .with_context(|| format!("failed to limit {what} to {limit}"))?;
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    logging::init_tracing()?;
    let options = Options::parse(std::env::args().skip(1))?;
    apply_limits(&options)?;
    if options.no_network {
        tracing::info!("network access disabled by host; enforcement is up to the deployment");
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(options))
}

async fn async_main(options: Options) -> anyhow::Result<()> {
    if let Some(wait) = options.wait_for_debugger {
        tracing::info!(pid = std::process::id(), ?wait, "waiting for debugger");
        tokio::time::sleep(wait).await;
    }

    let config = options.worker_config();
    let compiler = Arc::new(catalog::compiler(config.readable_paths.clone()));
    match (&options.rx_pipe, &options.tx_pipe) {
        (Some(rx), Some(tx)) => {
            let reader = pipe::OpenOptions::new()
                .open_receiver(rx)
                .with_context(|| format!("failed to open {}", rx.display()))?;
            let writer = pipe::OpenOptions::new()
                .open_sender(tx)
                .with_context(|| format!("failed to open {}", tx.display()))?;
            run_worker(reader, writer, compiler, config).await?;
        }
        (None, None) => {
            run_worker(tokio::io::stdin(), tokio::io::stdout(), compiler, config).await?;
        }
        _ => bail!("--rx-pipe and --tx-pipe must be given together"),
    }
    Ok(())
}
