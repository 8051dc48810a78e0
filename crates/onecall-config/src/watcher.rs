//! Reload-on-change for the configuration file.
//!
//! Filesystem events are debounced, then the file is parsed again. A file
//! that fails to parse or validate is ignored and subscribers keep the last
//! good configuration. Consumers react to [`watch::Receiver::changed`] by
//! rebuilding whatever they derive from the config (the registry table,
//! aliases, snippets, validator policy).
//!
//! Requires the `config-watch` feature.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};

use crate::{ConfigError, OnecallConfig};

/// Quiet period after the last filesystem event before reloading.
const DEBOUNCE: Duration = Duration::from_millis(200);

/// Watches one config file and publishes every valid revision.
pub struct ConfigWatcher {
    path: PathBuf,
    tx: watch::Sender<Arc<OnecallConfig>>,
}

impl ConfigWatcher {
    /// Load the file once and prepare to watch it.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let config = OnecallConfig::from_file_with_env(&path)?;
        let (tx, _rx) = watch::channel(Arc::new(config));
        Ok(Self { path, tx })
    }

    /// A receiver yielding each accepted revision.
    pub fn subscribe(&self) -> watch::Receiver<Arc<OnecallConfig>> {
        self.tx.subscribe()
    }

    /// The last accepted configuration.
    pub fn current(&self) -> Arc<OnecallConfig> {
        self.tx.borrow().clone()
    }

    /// Spawn the watch task. It runs until aborted. The watcher stays
    /// usable for manual [`reload()`](Self::reload) calls.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                tracing::error!(error = %e, path = %self.path.display(), "config watcher stopped");
            }
        })
    }

    /// Parse the file again and publish it if valid.
    ///
    /// Returns whether a new revision was published.
    pub fn reload(&self) -> bool {
        match OnecallConfig::from_file_with_env(&self.path) {
            Ok(config) => {
                tracing::info!(path = %self.path.display(), "config reloaded");
                self.tx.send_replace(Arc::new(config));
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "config reload rejected, keeping previous config");
                false
            }
        }
    }

    async fn run(&self) -> Result<(), ConfigError> {
        let (event_tx, mut event_rx) = mpsc::channel::<()>(16);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            let relevant = res.is_ok_and(|event| {
                matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                )
            });
            if relevant {
                let _ = event_tx.blocking_send(());
            }
        })
        .map_err(|e| ConfigError::Invalid(format!("cannot create file watcher: {e}")))?;

        // Editors that save by rename replace the inode, so watch the directory
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| ConfigError::Invalid(format!("cannot watch {}: {e}", dir.display())))?;
        tracing::info!(path = %self.path.display(), "watching config file");

        while event_rx.recv().await.is_some() {
            tokio::time::sleep(DEBOUNCE).await;
            while event_rx.try_recv().is_ok() {}
            self.reload();
        }
        Ok(())
    }
}
