//! The side of a bridge that VTY connections talk to
//!
//! A [`BridgeLink`] carries the bridge's data bus, its rolling output cache
//! and its client count. Device output is published as [`BusEvent::Data`];
//! client input is sent as [`BusEvent::Write`] and picked up by the bridge
//! task, which owns the device.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::{AppConfig, BridgeConfig, ConfigStore};
use crate::events::{handler, Emitter, EventSubscriber};
use crate::vty::render_banner;

use super::cache::SerialCache;

/// Events on a bridge's data bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusEvent {
    /// Bytes read from the device
    Data,
    /// Bytes to write to the device
    Write,
}

pub type Bus = Emitter<BusEvent, Bytes>;

/// Device output chunks queued per client before it counts as stalled
pub const CLIENT_BACKLOG: usize = 1024;

/// Output feed for one attached client
pub struct ClientOutput {
    /// Banner followed by cached history; send before anything else
    pub banner: Vec<u8>,
    /// Device output published after the banner was taken
    ///
    /// Closes once [`CLIENT_BACKLOG`] chunks are waiting; the connection
    /// should be dropped when `recv` returns `None`.
    pub rx: mpsc::Receiver<Bytes>,
    /// Holds the bus registration; drop to stop the feed
    pub subscription: EventSubscriber<BusEvent, Bytes>,
}

/// Shared per-device state used by VTY connections
pub struct BridgeLink {
    id: String,
    path: String,
    bus: Bus,
    cache: Mutex<SerialCache>,
    clients: AtomicUsize,
    config: Arc<ConfigStore<BridgeConfig>>,
    app_config: Arc<ConfigStore<AppConfig>>,
}

impl BridgeLink {
    pub fn new(
        id: impl Into<String>,
        path: impl Into<String>,
        config: Arc<ConfigStore<BridgeConfig>>,
        app_config: Arc<ConfigStore<AppConfig>>,
    ) -> Self {
        let limit = app_config.get().max_serial_cache;
        Self {
            id: id.into(),
            path: path.into(),
            bus: Bus::new(),
            cache: Mutex::new(SerialCache::new(limit)),
            clients: AtomicUsize::new(0),
            config,
            app_config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Current device settings
    pub fn config(&self) -> Arc<BridgeConfig> {
        self.config.get()
    }

    /// The device's config store
    pub fn config_store(&self) -> &Arc<ConfigStore<BridgeConfig>> {
        &self.config
    }

    /// Current gateway settings
    pub fn app_config(&self) -> Arc<AppConfig> {
        self.app_config.get()
    }

    /// Number of attached clients across both VTYs
    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    /// Count a client as attached until the guard drops
    pub fn attach(self: &Arc<Self>) -> ClientGuard {
        let count = self.clients.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(bridge = %self.id, clients = count, "Client attached");
        ClientGuard {
            link: Arc::clone(self),
        }
    }

    /// Take the banner and subscribe to device output in one step
    ///
    /// Bytes published before the call are in the banner's history;
    /// bytes published after it arrive on the feed. None are lost or
    /// repeated, unless the client falls [`CLIENT_BACKLOG`] chunks behind
    /// and the feed is cut.
    pub fn open_output(&self) -> ClientOutput {
        let (tx, rx) = mpsc::channel(CLIENT_BACKLOG);
        let sender = Mutex::new(Some(tx));
        let id = self.id.clone();
        let cache = self.cache.lock();
        let banner = render_banner(&self.id, &cache.snapshot(), self.client_count());
        let subscription = EventSubscriber::new(&self.bus);
        subscription.on(
            BusEvent::Data,
            handler(move |data: &Bytes| {
                let mut sender = sender.lock();
                let Some(tx) = sender.as_ref() else {
                    return;
                };
                match tx.try_send(data.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(bridge = %id, "Client output backlog full, disconnecting client");
                        *sender = None;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        *sender = None;
                    }
                }
            }),
        );
        drop(cache);

        ClientOutput {
            banner,
            rx,
            subscription,
        }
    }

    /// Record device output and fan it out to attached clients
    pub fn publish(&self, data: Bytes) {
        let mut cache = self.cache.lock();
        cache.push(&data);
        self.bus.emit(BusEvent::Data, &data);
    }

    /// Queue client input for the device
    pub fn send_to_device(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.bus.emit(BusEvent::Write, &data);
    }

    /// Change the cache cap, trimming right away
    pub fn set_cache_limit(&self, limit: usize) {
        self.cache.lock().set_limit(limit);
    }

    pub fn cache_limit(&self) -> usize {
        self.cache.lock().limit()
    }

    /// Copy of the cached device output
    pub fn cache_snapshot(&self) -> Vec<u8> {
        self.cache.lock().snapshot()
    }
}

impl std::fmt::Debug for BridgeLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeLink")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("clients", &self.client_count())
            .finish()
    }
}

/// Keeps a client counted on its bridge
pub struct ClientGuard {
    link: Arc<BridgeLink>,
}

impl ClientGuard {
    pub fn link(&self) -> &Arc<BridgeLink> {
        &self.link
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        let count = self.link.clients.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        tracing::debug!(bridge = %self.link.id, clients = count, "Client detached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Defaults, StoreOptions};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn link(dir: &TempDir) -> Arc<BridgeLink> {
        let options = StoreOptions {
            debounce: Duration::from_millis(50),
            retry_delay: Duration::from_millis(200),
        };
        let app_defaults: Defaults<AppConfig> = Arc::new(|_| AppConfig {
            max_serial_cache: 16,
            ..AppConfig::default()
        });
        let app = Arc::new(
            ConfigStore::open_with(dir.path().join("config.json"), app_defaults, options)
                .await
                .unwrap(),
        );
        let bridge_defaults: Defaults<BridgeConfig> =
            Arc::new(|_| BridgeConfig::from_app(&AppConfig::default()));
        let config = Arc::new(
            ConfigStore::open_with(dir.path().join("dev.json"), bridge_defaults, options)
                .await
                .unwrap(),
        );
        Arc::new(BridgeLink::new("dev", "/dev/serial/by-path/dev", config, app))
    }

    #[tokio::test]
    async fn test_attach_counts_clients() {
        let dir = tempfile::tempdir().unwrap();
        let link = link(&dir).await;

        let a = link.attach();
        let b = link.attach();
        assert_eq!(link.client_count(), 2);
        drop(a);
        assert_eq!(link.client_count(), 1);
        drop(b);
        assert_eq!(link.client_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_caches_and_fans_out() {
        let dir = tempfile::tempdir().unwrap();
        let link = link(&dir).await;

        link.publish(Bytes::from_static(b"boot "));
        let _guard = link.attach();
        let mut output = link.open_output();
        assert!(output.banner.ends_with(b"boot "));

        link.publish(Bytes::from_static(b"login: "));
        assert_eq!(output.rx.recv().await.unwrap(), Bytes::from_static(b"login: "));
        assert_eq!(link.cache_snapshot(), b"boot login: ");
    }

    #[tokio::test]
    async fn test_dropping_subscription_stops_feed() {
        let dir = tempfile::tempdir().unwrap();
        let link = link(&dir).await;

        let output = link.open_output();
        assert_eq!(link.bus().listener_count(BusEvent::Data), 1);
        drop(output.subscription);
        assert_eq!(link.bus().listener_count(BusEvent::Data), 0);
    }

    #[tokio::test]
    async fn test_stalled_client_feed_is_cut() {
        let dir = tempfile::tempdir().unwrap();
        let link = link(&dir).await;

        let mut slow = link.open_output();
        let mut fast = link.open_output();
        for i in 0..=CLIENT_BACKLOG {
            link.publish(Bytes::from(format!("{}\n", i)));
            assert!(fast.rx.recv().await.is_some());
        }

        // Everything queued before the overflow still drains, then the feed ends
        let mut drained = 0;
        while slow.rx.recv().await.is_some() {
            drained += 1;
        }
        assert_eq!(drained, CLIENT_BACKLOG);

        // Other clients keep receiving
        link.publish(Bytes::from_static(b"still here"));
        assert_eq!(fast.rx.recv().await.unwrap(), Bytes::from_static(b"still here"));
    }

    #[tokio::test]
    async fn test_cache_uses_app_limit() {
        let dir = tempfile::tempdir().unwrap();
        let link = link(&dir).await;
        assert_eq!(link.cache_limit(), 16);

        link.publish(Bytes::from_static(b"0123456789abcdefXYZ"));
        assert_eq!(link.cache_snapshot(), b"3456789abcdefXYZ");

        link.set_cache_limit(4);
        assert_eq!(link.cache_snapshot(), b"fXYZ");
    }

    #[tokio::test]
    async fn test_send_to_device_emits_write() {
        let dir = tempfile::tempdir().unwrap();
        let link = link(&dir).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = EventSubscriber::new(link.bus());
        sub.on(
            BusEvent::Write,
            handler(move |data: &Bytes| {
                let _ = tx.send(data.clone());
            }),
        );

        link.send_to_device(Bytes::new());
        link.send_to_device(Bytes::from_static(b"ls\r"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"ls\r"));
        assert!(rx.try_recv().is_err());
    }
}
