//! Persisted, hot-reloadable configuration values
//!
//! A [`ConfigStore`] owns one JSON file. The current value is held in an
//! [`ArcSwap`] for lock-free reads. Program writes update memory first,
//! emit a change event, then queue the disk write on the store task. The
//! store task also applies external edits reported by the file watcher.
//!
//! Feedback suppression: a program write replaces the in-memory value
//! before the file changes, so when the watcher reports that write the
//! reparsed file equals the current value and is ignored. Only content that
//! differs from the current value counts as an external edit.
//!
//! There is no locking against other processes writing the same file. An
//! external edit racing a queued program write can be overwritten by it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use vtytousb_utils::{GatewayError, Result};

use super::loader::ConfigLoader;
use super::schema::ConfigSchema;
use super::watcher::{ConfigFileWatcher, DEBOUNCE};
use crate::events::Emitter;

/// Delay before re-reading a file that failed to parse
pub const RETRY_DELAY: Duration = Duration::from_secs(10);

/// Builds the default value; the flag is true when the file is being
/// created for the first time
pub type Defaults<T> = Arc<dyn Fn(bool) -> T + Send + Sync>;

/// Events emitted by a [`ConfigStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreEvent {
    Change,
}

/// Payload of [`StoreEvent::Change`]
#[derive(Debug)]
pub struct Change<T> {
    pub current: Arc<T>,
    pub previous: Arc<T>,
}

impl<T> Clone for Change<T> {
    fn clone(&self) -> Self {
        Self {
            current: Arc::clone(&self.current),
            previous: Arc::clone(&self.previous),
        }
    }
}

/// Timing knobs for a store
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    pub debounce: Duration,
    pub retry_delay: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            debounce: DEBOUNCE,
            retry_delay: RETRY_DELAY,
        }
    }
}

enum Command<T> {
    Persist(Arc<T>),
    Flush(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

struct Shared<T> {
    path: PathBuf,
    data: ArcSwap<T>,
    previous: ArcSwap<T>,
    /// Serializes compare-and-replace of `data`
    write_lock: Mutex<()>,
    /// Program writes queued but not yet on disk
    pending: AtomicUsize,
    events: Emitter<StoreEvent, Change<T>>,
    defaults: Defaults<T>,
}

/// Typed, file-backed configuration value with change notification
pub struct ConfigStore<T: ConfigSchema> {
    shared: Arc<Shared<T>>,
    cmd_tx: mpsc::UnboundedSender<Command<T>>,
    created_new: bool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: ConfigSchema> ConfigStore<T> {
    /// Open the store at `path` with default timings
    pub async fn open(path: impl Into<PathBuf>, defaults: Defaults<T>) -> Result<Self> {
        Self::open_with(path, defaults, StoreOptions::default()).await
    }

    /// Open the store at `path`
    ///
    /// Creates the file from `defaults(true)` if it does not exist, then
    /// waits until the file parses and validates. A broken file is retried
    /// every `retry_delay`, or sooner when it changes, for as long as it
    /// takes.
    pub async fn open_with(
        path: impl Into<PathBuf>,
        defaults: Defaults<T>,
        options: StoreOptions,
    ) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| GatewayError::FileWrite {
                    path: dir.to_path_buf(),
                    source: e,
                })?;
        }

        let created_new = !tokio::fs::try_exists(&path).await.unwrap_or(false);
        if created_new {
            let mut value = defaults(true);
            if let Err(e) = value.validate() {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Default config failed validation, using empty value"
                );
                value = T::default();
            }
            ConfigLoader::save(&path, &value).await?;
            tracing::debug!(path = %path.display(), "Wrote default config");
        }

        let (watcher, mut fs_rx) = ConfigFileWatcher::new(&path, options.debounce)?;

        let initial = loop {
            match ConfigLoader::load_from_path(&path, &defaults(false)).await {
                Ok(value) => break value,
                Err(e) => {
                    tracing::error!(
                        path = %path.display(),
                        error = %e,
                        "Failed to load config, retrying in {:?}",
                        options.retry_delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(options.retry_delay) => {}
                        _ = fs_rx.recv() => {}
                    }
                }
            }
        };

        let initial = Arc::new(initial);
        let shared = Arc::new(Shared {
            path,
            data: ArcSwap::new(Arc::clone(&initial)),
            previous: ArcSwap::new(initial),
            write_lock: Mutex::new(()),
            pending: AtomicUsize::new(0),
            events: Emitter::new(),
            defaults,
        });

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_store(
            Arc::clone(&shared),
            watcher,
            fs_rx,
            cmd_rx,
            options.retry_delay,
        ));

        Ok(Self {
            shared,
            cmd_tx,
            created_new,
            task: Mutex::new(Some(task)),
        })
    }

    /// Current value
    pub fn get(&self) -> Arc<T> {
        self.shared.data.load_full()
    }

    /// Value before the most recent change
    pub fn previous(&self) -> Arc<T> {
        self.shared.previous.load_full()
    }

    /// True if the file did not exist and was created from defaults
    pub fn created_new(&self) -> bool {
        self.created_new
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Change notifications
    pub fn events(&self) -> &Emitter<StoreEvent, Change<T>> {
        &self.shared.events
    }

    /// Replace the value
    ///
    /// Returns `Ok(false)` without touching disk or emitting if `value`
    /// equals the current value. Otherwise emits one change event and
    /// queues the disk write.
    pub fn write(&self, value: T) -> Result<bool> {
        self.update(|current| *current = value)
    }

    /// Modify a copy of the current value and write it back
    pub fn update(&self, f: impl FnOnce(&mut T)) -> Result<bool> {
        let change = {
            let _guard = self.shared.write_lock.lock();
            let old = self.shared.data.load_full();
            let mut next = (*old).clone();
            f(&mut next);
            if next == *old {
                return Ok(false);
            }
            next.validate().map_err(|message| GatewayError::ConfigInvalid {
                path: self.shared.path.clone(),
                message,
            })?;

            let next = Arc::new(next);
            self.shared.previous.store(Arc::clone(&old));
            self.shared.data.store(Arc::clone(&next));
            self.shared.pending.fetch_add(1, Ordering::SeqCst);
            if self.cmd_tx.send(Command::Persist(Arc::clone(&next))).is_err() {
                self.shared.pending.fetch_sub(1, Ordering::SeqCst);
                tracing::warn!(path = %self.shared.path.display(), "Config store closed, change not persisted");
            }
            Change {
                current: next,
                previous: old,
            }
        };

        self.shared.events.emit(StoreEvent::Change, &change);
        Ok(true)
    }

    /// Wait until every queued write has reached disk
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Finish queued writes and stop watching the file
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Close(tx)).is_ok() {
            let _ = rx.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Defaults with no side effects
    pub fn defaults(&self) -> T {
        (self.shared.defaults)(false)
    }
}

impl<T: ConfigSchema> std::fmt::Debug for ConfigStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("path", &self.shared.path)
            .field("created_new", &self.created_new)
            .finish()
    }
}

async fn run_store<T: ConfigSchema>(
    shared: Arc<Shared<T>>,
    _watcher: ConfigFileWatcher,
    mut fs_rx: mpsc::UnboundedReceiver<()>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command<T>>,
    retry_delay: Duration,
) {
    let mut retry_at: Option<Instant> = None;

    loop {
        let deadline = retry_at;
        let retry_sleep = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Persist(value)) => {
                    if let Err(e) = ConfigLoader::save(&shared.path, value.as_ref()).await {
                        tracing::error!(path = %shared.path.display(), error = %e, "Failed to persist config");
                    }
                    shared.pending.fetch_sub(1, Ordering::SeqCst);
                }
                Some(Command::Flush(done)) => {
                    let _ = done.send(());
                }
                Some(Command::Close(done)) => {
                    let _ = done.send(());
                    break;
                }
                None => break,
            },

            Some(()) = fs_rx.recv() => {
                retry_at = None;
                if let Err(e) = reload(&shared).await {
                    tracing::error!(
                        path = %shared.path.display(),
                        error = %e,
                        "Failed to reload config, retrying in {:?}",
                        retry_delay
                    );
                    retry_at = Some(Instant::now() + retry_delay);
                }
            }

            _ = retry_sleep => {
                retry_at = None;
                if let Err(e) = reload(&shared).await {
                    tracing::error!(
                        path = %shared.path.display(),
                        error = %e,
                        "Failed to reload config, retrying in {:?}",
                        retry_delay
                    );
                    retry_at = Some(Instant::now() + retry_delay);
                }
            }
        }
    }

    tracing::debug!(path = %shared.path.display(), "Config store stopped");
}

/// Apply the on-disk state to memory
async fn reload<T: ConfigSchema>(shared: &Shared<T>) -> Result<()> {
    if !tokio::fs::try_exists(&shared.path).await.unwrap_or(false) {
        tracing::info!(path = %shared.path.display(), "Config file removed, restoring it");
        let current = shared.data.load_full();
        return ConfigLoader::save(&shared.path, current.as_ref()).await;
    }

    let parsed = ConfigLoader::load_from_path(&shared.path, &(shared.defaults)(false)).await?;

    let change = {
        let _guard = shared.write_lock.lock();
        // A queued program write will land on disk after this read and
        // produce its own event
        if shared.pending.load(Ordering::SeqCst) > 0 {
            return Ok(());
        }
        let current = shared.data.load_full();
        if parsed == *current {
            return Ok(());
        }
        let parsed = Arc::new(parsed);
        shared.previous.store(Arc::clone(&current));
        shared.data.store(Arc::clone(&parsed));
        Change {
            current: parsed,
            previous: current,
        }
    };

    tracing::debug!(path = %shared.path.display(), "Config changed on disk");
    shared.events.emit(StoreEvent::Change, &change);
    Ok(())
}
