use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Watches a local vault mount for disappearance (unmount, ejection, or a
/// move into the trash). The drive watcher suspends on disconnect and kicks
/// a fresh smart scan on reconnect.
#[derive(Debug)]
pub struct VaultMonitor {
    root: PathBuf,
    connected_tx: watch::Sender<bool>,
}

impl VaultMonitor {
    #[must_use]
    pub fn new(root: PathBuf) -> (Self, watch::Receiver<bool>) {
        let (connected_tx, connected_rx) = watch::channel(true);
        (Self { root, connected_tx }, connected_rx)
    }

    fn is_available(&self) -> bool {
        if !self.root.exists() {
            return false;
        }
        // A vault dragged to the trash still "exists" but must be treated
        // as gone.
        !self.root.components().any(|c| matches!(c.as_os_str().to_str(), Some(".Trash" | ".Trashes")))
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(POLL_INTERVAL);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = interval.tick() => {
                    let available = self.is_available();
                    self.connected_tx.send_if_modified(|current| {
                        if *current == available {
                            false
                        } else {
                            if available {
                                tracing::info!(root = %self.root.display(), "Vault reconnected");
                            } else {
                                tracing::warn!(root = %self.root.display(), "Vault disconnected");
                            }
                            *current = available;
                            true
                        }
                    });
                }
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("Vault monitor shutting down...");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_root_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, rx) = VaultMonitor::new(dir.path().join("vault"));
        assert!(!monitor.is_available());
        assert!(*rx.borrow());

        std::fs::create_dir_all(dir.path().join("vault")).unwrap();
        assert!(monitor.is_available());
    }

    #[test]
    fn trashed_root_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let trashed = dir.path().join(".Trash").join("vault");
        std::fs::create_dir_all(&trashed).unwrap();
        let (monitor, _rx) = VaultMonitor::new(trashed);
        assert!(!monitor.is_available());
    }
}
