//! Serial device hotplug source
//!
//! Watches a directory of device entries (by default the stable
//! `/dev/serial/by-path` links) with notify's poll watcher and reports
//! entries appearing and disappearing. Every notification triggers a rescan
//! that is diffed against the known set, so each path is reported once per
//! appearance no matter how many raw events the watcher produced.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{PollWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use vtytousb_utils::{GatewayError, Result};

use crate::manager::DeviceEvent;

/// Default poll interval
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Reports device entries under one directory
#[derive(Debug, Clone)]
pub struct DeviceWatcher {
    dir: PathBuf,
    interval: Duration,
    known: BTreeSet<String>,
}

impl DeviceWatcher {
    pub fn new(dir: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            interval,
            known: BTreeSet::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Send events until `cancel` fires or the receiver goes away
    ///
    /// Entries present at start are reported as added. If the directory
    /// does not exist, or disappears, all known entries are reported as
    /// removed and the watcher waits for it to come back.
    pub async fn run(
        mut self,
        tx: mpsc::UnboundedSender<DeviceEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        tracing::info!(dir = %self.dir.display(), "Watching for serial devices");

        loop {
            if !self.wait_for_dir(&cancel).await {
                return Ok(());
            }

            let (fs_tx, mut fs_rx) = mpsc::unbounded_channel();
            let mut watcher = PollWatcher::new(
                move |result: notify::Result<notify::Event>| {
                    let _ = fs_tx.send(result);
                },
                notify::Config::default().with_poll_interval(self.interval),
            )
            .map_err(|e| GatewayError::internal(format!("Failed to create device watcher: {}", e)))?;
            watcher
                .watch(&self.dir, RecursiveMode::NonRecursive)
                .map_err(|e| {
                    GatewayError::internal(format!("Failed to watch {}: {}", self.dir.display(), e))
                })?;

            if !self.rescan(&tx) {
                return Ok(());
            }

            // Runs until the directory disappears
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    event = fs_rx.recv() => match event {
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(dir = %self.dir.display(), error = %e, "Device watch error");
                        }
                        None => break,
                    },
                }
                if !self.rescan(&tx) {
                    return Ok(());
                }
                if !self.dir.is_dir() {
                    tracing::info!(dir = %self.dir.display(), "Device directory removed");
                    break;
                }
            }
            drop(watcher);
        }
    }

    /// Returns false if cancelled
    async fn wait_for_dir(&self, cancel: &CancellationToken) -> bool {
        let mut logged = false;
        while !self.dir.is_dir() {
            if !logged {
                tracing::info!(dir = %self.dir.display(), "Device directory missing, waiting for it");
                logged = true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        !cancel.is_cancelled()
    }

    /// Diff the directory against the known set and report changes
    ///
    /// Returns false once the receiver is gone.
    fn rescan(&mut self, tx: &mpsc::UnboundedSender<DeviceEvent>) -> bool {
        let current = list_entries(&self.dir);

        for path in self.known.difference(&current) {
            if tx.send(DeviceEvent::Removed(path.clone())).is_err() {
                return false;
            }
        }
        for path in current.difference(&self.known) {
            if tx.send(DeviceEvent::Added(path.clone())).is_err() {
                return false;
            }
        }
        self.known = current;
        true
    }
}

/// Full paths of the entries in `dir`; empty if it cannot be read
fn list_entries(dir: &Path) -> BTreeSet<String> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path().to_string_lossy().into_owned())
            .collect(),
        Err(_) => BTreeSet::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn next(rx: &mut mpsc::UnboundedReceiver<DeviceEvent>) -> DeviceEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn path_str(p: &Path) -> String {
        p.to_string_lossy().into_owned()
    }

    #[test]
    fn test_rescan_diffs_known_set() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        std::fs::write(&a, "").unwrap();
        let mut watcher = DeviceWatcher::new(dir.path(), POLL_INTERVAL);
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(watcher.rescan(&tx));
        assert_eq!(rx.try_recv().unwrap(), DeviceEvent::Added(path_str(&a)));

        // Nothing changed, nothing reported
        assert!(watcher.rescan(&tx));
        assert!(rx.try_recv().is_err());

        std::fs::remove_file(&a).unwrap();
        assert!(watcher.rescan(&tx));
        assert_eq!(rx.try_recv().unwrap(), DeviceEvent::Removed(path_str(&a)));
    }

    #[test]
    fn test_rescan_stops_when_receiver_gone() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a"), "").unwrap();
        let mut watcher = DeviceWatcher::new(dir.path(), POLL_INTERVAL);
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        assert!(!watcher.rescan(&tx));
    }

    #[tokio::test]
    async fn test_reports_existing_then_changes() {
        let dir = tempdir().unwrap();
        let existing = dir.path().join("pci-0-port0");
        std::fs::write(&existing, "").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            DeviceWatcher::new(dir.path(), Duration::from_millis(50)).run(tx, cancel.clone()),
        );

        assert_eq!(next(&mut rx).await, DeviceEvent::Added(path_str(&existing)));

        let plugged = dir.path().join("pci-0-port1");
        std::fs::write(&plugged, "").unwrap();
        assert_eq!(next(&mut rx).await, DeviceEvent::Added(path_str(&plugged)));

        std::fs::remove_file(&existing).unwrap();
        assert_eq!(next(&mut rx).await, DeviceEvent::Removed(path_str(&existing)));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_waits_for_missing_dir() {
        let root = tempdir().unwrap();
        let dir = root.path().join("by-path");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            DeviceWatcher::new(&dir, Duration::from_millis(50)).run(tx, cancel.clone()),
        );
        tokio::time::sleep(Duration::from_millis(150)).await;

        std::fs::create_dir(&dir).unwrap();
        let dev = dir.join("usb-0");
        std::fs::write(&dev, "").unwrap();
        assert_eq!(next(&mut rx).await, DeviceEvent::Added(path_str(&dev)));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
