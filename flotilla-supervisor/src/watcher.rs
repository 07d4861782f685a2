use notify::RecursiveMode;
use notify_debouncer_mini::{DebouncedEvent, DebouncedEventKind, new_debouncer};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigDocument, ConfigSource};
use crate::errors::{Result, SupervisorError};

/// Window in which back-to-back writes (editor save patterns) are coalesced
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Watches one config file and reports when its parsed contents change.
///
/// The parent directory is watched rather than the file itself, so editors
/// that save by renaming a new file into place are still noticed.
pub struct ConfigWatcher {
    path: PathBuf,
    dir: PathBuf,
    debounce: Duration,
    prev: ConfigDocument,
}

impl ConfigWatcher {
    /// `prev` is the document the supervisor is currently running with
    pub fn new(path: &Path, prev: ConfigDocument) -> Result<Self> {
        let file_name = path
            .file_name()
            .ok_or_else(|| SupervisorError::Watcher(format!("not a file: {}", path.display())))?;
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let dir = parent.canonicalize().map_err(|e| {
            SupervisorError::Watcher(format!("cannot watch {}: {}", parent.display(), e))
        })?;
        Ok(Self {
            path: dir.join(file_name),
            dir,
            debounce: DEFAULT_DEBOUNCE,
            prev,
        })
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True if any event in the batch touches the watched file
    fn touches_config(&self, events: &[DebouncedEvent]) -> bool {
        events
            .iter()
            .any(|e| e.kind == DebouncedEventKind::Any && e.path == self.path)
    }

    /// Re-read the file. Returns the new document only if it parses and
    /// differs from the last one seen.
    fn reload(&mut self) -> Option<ConfigDocument> {
        let next = match ConfigDocument::load(&ConfigSource::Path(self.path.clone())) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "error reloading config file; ignoring");
                return None;
            }
        };
        if next.same_as(&self.prev) {
            debug!(path = %self.path.display(), "config file rewritten without changes");
            return None;
        }
        self.prev = next.clone();
        Some(next)
    }

    /// Watch until `cancel` fires, calling `on_change` with every new
    /// version of the document.
    pub fn spawn<F>(mut self, cancel: CancellationToken, mut on_change: F) -> Result<tokio::task::JoinHandle<()>>
    where
        F: FnMut(ConfigDocument) + Send + 'static,
    {
        let (watcher_tx, watcher_rx) = std_mpsc::channel();
        let mut debouncer = new_debouncer(self.debounce, watcher_tx)
            .map_err(|e| SupervisorError::Watcher(e.to_string()))?;
        debouncer
            .watcher()
            .watch(&self.dir, RecursiveMode::NonRecursive)
            .map_err(|e| SupervisorError::Watcher(format!("{}: {}", self.dir.display(), e)))?;

        let (event_tx, mut event_rx) = mpsc::channel::<Vec<DebouncedEvent>>(32);
        tokio::task::spawn_blocking(move || {
            loop {
                match watcher_rx.recv() {
                    Ok(Ok(events)) => {
                        if event_tx.blocking_send(events).is_err() {
                            break;
                        }
                    }
                    Ok(Err(error)) => warn!(error = ?error, "config watcher error"),
                    Err(_) => break,
                }
            }
        });

        info!(path = %self.path.display(), "watching config file for changes");
        Ok(tokio::spawn(async move {
            loop {
                let events = tokio::select! {
                    _ = cancel.cancelled() => break,
                    events = event_rx.recv() => match events {
                        Some(events) => events,
                        None => break,
                    },
                };
                if !self.touches_config(&events) {
                    continue;
                }
                if let Some(doc) = self.reload() {
                    info!(path = %self.path.display(), "config file changed");
                    on_change(doc);
                }
            }
            // Dropping the debouncer closes its sender, which ends the
            // forwarding thread.
            drop(debouncer);
        }))
    }
}
