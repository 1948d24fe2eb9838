use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::warn;

use crate::{error::Result, rpc::Endpoint};

/// Something acquired while bringing a sandbox or worker up.
#[async_trait::async_trait]
pub trait Resource: Send + 'static {
    fn describe(&self) -> String;

    async fn release(self: Box<Self>) -> Result<()>;
}

/// Resources released in reverse order of acquisition.
///
/// Release failures are logged and do not stop the remaining releases.
#[derive(Default)]
pub struct ResourceStack {
    items: Mutex<Vec<Box<dyn Resource>>>,
}

impl ResourceStack {
    pub fn push(&self, resource: impl Resource) {
        self.items.lock().push(Box::new(resource));
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub async fn release_all(&self) {
        loop {
            let next = self.items.lock().pop();
            let Some(resource) = next else {
                break;
            };
            let what = resource.describe();
            if let Err(err) = resource.release().await {
                warn!(resource = %what, %err, "failed to release resource");
            }
        }
    }
}

/// A filesystem entry removed on release; a missing entry is not an error.
pub struct OwnedPath {
    path: PathBuf,
    directory: bool,
}

impl OwnedPath {
    pub const fn file(path: PathBuf) -> Self {
        Self {
            path,
            directory: false,
        }
    }

    pub const fn directory(path: PathBuf) -> Self {
        Self {
            path,
            directory: true,
        }
    }
}

#[async_trait::async_trait]
impl Resource for OwnedPath {
    fn describe(&self) -> String {
        format!("path {}", self.path.display())
    }

    async fn release(self: Box<Self>) -> Result<()> {
        let removed = if self.directory {
            tokio::fs::remove_dir_all(&self.path).await
        } else {
            tokio::fs::remove_file(&self.path).await
        };
        match removed {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl Resource for Endpoint {
    fn describe(&self) -> String {
        format!("channel {}", self.label())
    }

    async fn release(self: Box<Self>) -> Result<()> {
        self.close().await;
        Ok(())
    }
}

/// Any value whose release is simply being dropped.
pub struct Held<T>(pub &'static str, pub T);

#[async_trait::async_trait]
impl<T: Send + 'static> Resource for Held<T> {
    fn describe(&self) -> String {
        self.0.to_string()
    }

    async fn release(self: Box<Self>) -> Result<()> {
        drop(self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::Error;

    struct Recorded {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl Resource for Recorded {
        fn describe(&self) -> String {
            self.name.to_string()
        }

        async fn release(self: Box<Self>) -> Result<()> {
            self.log.lock().push(self.name);
            if self.fail {
                Err(Error::internal("release failed"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn releases_in_reverse_order_despite_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stack = ResourceStack::default();
        for (name, fail) in [("socket", false), ("listener", true), ("channel", false)] {
            stack.push(Recorded {
                name,
                log: Arc::clone(&log),
                fail,
            });
        }
        assert_eq!(stack.len(), 3);

        stack.release_all().await;
        assert!(stack.is_empty());
        assert_eq!(*log.lock(), ["channel", "listener", "socket"]);
    }

    #[tokio::test]
    async fn owned_paths_tolerate_missing_entries() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("sandy.sock");
        tokio::fs::write(&file, b"").await?;

        let stack = ResourceStack::default();
        stack.push(OwnedPath::file(file.clone()));
        stack.push(OwnedPath::file(dir.path().join("never-created")));
        stack.release_all().await;

        assert!(!file.exists());
        Ok(())
    }
}
