//! File watcher for configuration hot-reload

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, FileIdMap};
use tokio::sync::mpsc;

use vtytousb_utils::{GatewayError, Result};

/// Quiet period before a burst of file events is reported
pub const DEBOUNCE: Duration = Duration::from_millis(200);

/// Watches one config file for external edits
///
/// The parent directory is watched so that deletes and editor
/// rename-into-place saves are seen. One notification is sent per debounced
/// batch that touches the file.
pub struct ConfigFileWatcher {
    path: PathBuf,
    /// Debouncer handle (kept alive)
    _debouncer: Debouncer<RecommendedWatcher, FileIdMap>,
}

impl ConfigFileWatcher {
    /// Start watching `path`; notifications arrive on the returned receiver
    pub fn new(path: &Path, debounce: Duration) -> Result<(Self, mpsc::UnboundedReceiver<()>)> {
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| GatewayError::config(format!("{} has no parent dir", path.display())))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| GatewayError::config(format!("{} has no file name", path.display())))?;

        let (tx, rx) = mpsc::unbounded_channel();

        let watched = path.to_path_buf();
        let mut debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    if events.iter().any(|e| Self::is_config_change(&e.event, &file_name)) {
                        let _ = tx.send(());
                    }
                }
                Err(errors) => {
                    tracing::error!(path = %watched.display(), "Config watch error: {:?}", errors);
                }
            }
        })
        .map_err(|e| GatewayError::config(format!("Failed to create watcher: {}", e)))?;

        debouncer
            .watcher()
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| GatewayError::config(format!("Failed to watch {}: {}", dir.display(), e)))?;

        tracing::debug!(path = %path.display(), "Config watcher started");

        Ok((
            Self {
                path: path.to_path_buf(),
                _debouncer: debouncer,
            },
            rx,
        ))
    }

    /// The watched file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if an event touches the watched file
    fn is_config_change(event: &Event, file_name: &OsString) -> bool {
        matches!(
            event.kind,
            EventKind::Any | EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) && event
            .paths
            .iter()
            .any(|p| p.file_name().map(|n| n == file_name.as_os_str()).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modify(path: &str) -> Event {
        Event {
            kind: EventKind::Modify(notify::event::ModifyKind::Data(
                notify::event::DataChange::Content,
            )),
            paths: vec![PathBuf::from(path)],
            attrs: Default::default(),
        }
    }

    #[test]
    fn test_is_config_change() {
        let name = OsString::from("ttyUSB0.json");
        assert!(ConfigFileWatcher::is_config_change(
            &modify("/data/serials/ttyUSB0.json"),
            &name
        ));
    }

    #[test]
    fn test_other_file_ignored() {
        let name = OsString::from("ttyUSB0.json");
        assert!(!ConfigFileWatcher::is_config_change(
            &modify("/data/serials/ttyUSB1.json"),
            &name
        ));
    }

    #[test]
    fn test_remove_is_change() {
        let event = Event {
            kind: EventKind::Remove(notify::event::RemoveKind::File),
            paths: vec![PathBuf::from("/data/config.json")],
            attrs: Default::default(),
        };
        assert!(ConfigFileWatcher::is_config_change(
            &event,
            &OsString::from("config.json")
        ));
    }

    #[test]
    fn test_access_ignored() {
        let event = Event {
            kind: EventKind::Access(notify::event::AccessKind::Read),
            paths: vec![PathBuf::from("/data/config.json")],
            attrs: Default::default(),
        };
        assert!(!ConfigFileWatcher::is_config_change(
            &event,
            &OsString::from("config.json")
        ));
    }

    #[tokio::test]
    async fn test_watcher_reports_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{}").unwrap();

        let (_watcher, mut rx) = ConfigFileWatcher::new(&path, Duration::from_millis(50)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(&path, "{ }").unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(matches!(got, Ok(Some(()))));
    }
}
