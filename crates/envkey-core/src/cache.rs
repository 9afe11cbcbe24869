//! Per-ENVKEY disk cache of raw encrypted response bodies.
//!
//! Bodies are written through on every successful fetch and read back when
//! the network is unreachable. Files hold ciphertext only, but are still
//! created `0600` under a `0700` directory.
//!
//! Writes can be scheduled in the background while decryption proceeds;
//! [`Cache::flush`] waits for scheduled writes to land. Write errors are
//! logged and dropped, never surfaced through the completion signal.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::warn;

use crate::defaults;
use crate::error::{Error, Result};

/// Disk cache rooted at a single directory.
#[derive(Clone)]
pub struct Cache {
    dir: PathBuf,
    scheduled: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Cache {
    /// Open (creating if needed) a cache at `dir`, or at the default
    /// location under the home directory.
    pub fn new(dir: Option<&Path>) -> Result<Self> {
        let dir = match dir {
            Some(dir) => dir.to_path_buf(),
            None => default_dir().ok_or_else(|| {
                Error::CacheMiss("cannot resolve home directory".to_string())
            })?,
        };

        std::fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        }

        Ok(Cache {
            dir,
            scheduled: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    /// Read the cached body for an ENVKEY id part.
    pub async fn read(&self, id: &str) -> Result<Vec<u8>> {
        tokio::fs::read(self.path(id))
            .await
            .map_err(|e| Error::CacheMiss(e.to_string()))
    }

    /// Write a body synchronously with respect to the caller.
    pub async fn write(&self, id: &str, body: &[u8]) -> Result<()> {
        let path = self.path(id);
        tokio::fs::write(&path, body).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        Ok(())
    }

    /// Schedule a background write. Pair with [`Cache::flush`] to wait for
    /// it; errors are logged and dropped.
    pub fn schedule_write(&self, id: &str, body: Vec<u8>) {
        let cache = self.clone();
        let id = id.to_string();
        let handle = tokio::spawn(async move {
            if let Err(err) = cache.write(&id, &body).await {
                warn!(id = %id, error = %err, "cache write failed");
            }
        });
        if let Ok(mut scheduled) = self.scheduled.lock() {
            scheduled.push(handle);
        }
    }

    /// Delete the cached body for an id. Missing files are fine.
    pub async fn delete(&self, id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Wait for every scheduled write to complete.
    pub async fn flush(&self) {
        let handles = match self.scheduled.lock() {
            Ok(mut scheduled) => scheduled.drain(..).collect::<Vec<_>>(),
            Err(_) => return,
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// `$HOME/.envkey/cache`.
pub fn default_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(defaults::ENVKEY_DIR).join(defaults::CACHE_DIR))
}
