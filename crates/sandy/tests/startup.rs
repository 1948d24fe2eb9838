use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use sandy::{
    Error, ExecutionHost, HostConfig, IsolationPrimitive, Restrictions, TrustedResources,
    isolation::{IsolatedHandle, IsolatedWorker},
    protocol::NOTIFY_STARTED,
    rpc::{Message, codec},
};
use serde_json::Value;
use tokio::{
    io::{AsyncWriteExt, DuplexStream},
    time::timeout,
};

/// A worker that never answers; with `announce` it still signals readiness.
#[derive(Default)]
struct Silent {
    announce: bool,
    spawned: AtomicUsize,
    terminated: Arc<AtomicUsize>,
}

struct SilentHandle {
    _peer: DuplexStream,
    terminated: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl IsolatedHandle for SilentHandle {
    fn id(&self) -> String {
        "silent".into()
    }

    async fn wait(&mut self, _grace: Duration) -> bool {
        false
    }

    async fn terminate(&mut self) -> sandy::Result<()> {
        self.terminated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait::async_trait]
impl IsolationPrimitive for Silent {
    async fn spawn(
        &self,
        _restrictions: &Restrictions,
        _trusted: &TrustedResources,
    ) -> sandy::Result<IsolatedWorker> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let (ours, mut peer) = tokio::io::duplex(64 * 1024);
        if self.announce {
            let started = codec::encode(&Message::notification(NOTIFY_STARTED, Value::Null))
                .map_err(|err| sandy::Error::internal(err.to_string()))?;
            peer.write_all(started.as_bytes()).await?;
        }
        let (reader, writer) = tokio::io::split(ours);
        Ok(IsolatedWorker {
            reader: Box::pin(reader),
            writer: Box::pin(writer),
            handle: Box::new(SilentHandle {
                _peer: peer,
                terminated: Arc::clone(&self.terminated),
            }),
        })
    }
}

#[tokio::test]
async fn silent_worker_fails_startup_once_and_is_terminated() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let isolation = Arc::new(Silent::default());
    let config = HostConfig::new("silent")
        .working_directory(dir.path().join("work"))
        .socket_directory(dir.path().join("sockets"))
        .startup_timeout(Duration::from_millis(100));
    let host = ExecutionHost::new(config, Arc::clone(&isolation) as Arc<dyn IsolationPrimitive>);

    let err = host.create_sandbox("first").await.expect_err("never ready");
    assert!(matches!(err, Error::Startup(ref reason) if reason.contains("readiness")), "{err}");
    assert_eq!(isolation.terminated.load(Ordering::SeqCst), 1);

    let err = host.create_sandbox("second").await.expect_err("failure is cached");
    assert!(matches!(err, Error::Startup(_)), "{err}");
    assert_eq!(isolation.spawned.load(Ordering::SeqCst), 1);
    assert_eq!(host.sandbox_count(), 0);

    host.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn missing_worker_executable_is_a_startup_failure() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = HostConfig::new(dir.path().join("no-such-worker"))
        .working_directory(dir.path().join("work"))
        .socket_directory(dir.path().join("sockets"));
    let host = ExecutionHost::process(config);

    let err = host.create_sandbox("first").await.expect_err("cannot spawn");
    assert_eq!(err.kind(), sandy::ErrorKind::StartupFailure);

    host.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unanswered_sandbox_creation_times_out_and_shutdown_proceeds() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let isolation = Arc::new(Silent {
        announce: true,
        ..Silent::default()
    });
    let config = HostConfig::new("mute")
        .working_directory(dir.path().join("work"))
        .socket_directory(dir.path().join("sockets"))
        .sandbox_startup_timeout(Duration::from_millis(200))
        .shutdown_grace(Duration::from_millis(100));
    let host = ExecutionHost::new(config, Arc::clone(&isolation) as Arc<dyn IsolationPrimitive>);

    let err = timeout(Duration::from_secs(3), host.create_sandbox("first"))
        .await
        .context("create_sandbox hung")?
        .expect_err("worker never answers");
    assert!(matches!(err, Error::Startup(ref reason) if reason.contains("did not create")), "{err}");

    let create = host.create_sandbox("second");
    let shutdown = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        host.shutdown().await;
    };
    let (created, ()) = timeout(Duration::from_secs(3), async { tokio::join!(create, shutdown) })
        .await
        .context("shutdown wedged behind an unanswered create")?;
    assert!(matches!(created, Err(Error::Startup(_))), "{created:?}");

    assert_eq!(host.sandbox_count(), 0);
    assert_eq!(isolation.spawned.load(Ordering::SeqCst), 1);
    let leftover = std::fs::read_dir(dir.path().join("sockets"))?.count();
    assert_eq!(leftover, 0, "socket files were not released");
    Ok(())
}
