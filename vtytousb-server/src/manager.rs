//! Bridge manager
//!
//! Keeps one bridge per device path and reacts to hotplug notifications.
//! Bridges that close on their own (device unplugged mid-read, open
//! failure) are reaped from the map when their teardown finishes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bridge::{Bridge, BridgeHandle};
use crate::config::{AppConfig, Change, StoreEvent};
use crate::context::GatewayContext;
use crate::events::{handler, EventSubscriber};

/// Hotplug notification for one device path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Added(String),
    Removed(String),
}

/// Owns every bridge in the process
pub struct BridgeManager {
    ctx: Arc<GatewayContext>,
    bridges: HashMap<String, BridgeHandle>,
    /// Removed bridges still tearing down, by path
    closing: HashMap<String, BridgeHandle>,
    closed_tx: mpsc::UnboundedSender<(String, u64)>,
    closed_rx: mpsc::UnboundedReceiver<(String, u64)>,
    _app_sub: EventSubscriber<StoreEvent, Change<AppConfig>>,
}

impl BridgeManager {
    pub fn new(ctx: Arc<GatewayContext>) -> Self {
        let app_sub = EventSubscriber::new(ctx.app_config.events());
        app_sub.on(
            StoreEvent::Change,
            handler(|_: &Change<AppConfig>| {
                tracing::info!("Applied new app config.");
            }),
        );

        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        Self {
            ctx,
            bridges: HashMap::new(),
            closing: HashMap::new(),
            closed_tx,
            closed_rx,
            _app_sub: app_sub,
        }
    }

    pub fn context(&self) -> &Arc<GatewayContext> {
        &self.ctx
    }

    /// Start a bridge for a newly seen device
    ///
    /// A bridge already registered for `path` is closed first, and the new
    /// one waits for its teardown.
    pub fn add(&mut self, path: impl Into<String>) -> &BridgeHandle {
        let path = path.into();
        tracing::info!(%path, "Port {} added.", path);

        if let Some(previous) = self.bridges.remove(&path) {
            previous.close();
            self.closing.insert(path.clone(), previous);
        }
        let after = self.closing.get(&path).map(|h| h.watch_status());

        let handle = Bridge::spawn(Arc::clone(&self.ctx), path.clone(), after);
        self.watch_close(&handle);
        self.bridges.entry(path).or_insert(handle)
    }

    /// Close the bridge for a device that went away
    pub fn remove(&mut self, path: &str) -> bool {
        tracing::info!(%path, "Port {} removed.", path);
        match self.bridges.remove(path) {
            Some(handle) => {
                handle.close();
                self.closing.insert(path.to_string(), handle);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, path: &str) -> Option<&BridgeHandle> {
        self.bridges.get(path)
    }

    /// Paths with a registered bridge
    pub fn paths(&self) -> Vec<String> {
        self.bridges.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }

    /// Smallest port `>= min` not held by a listener in this process
    ///
    /// Advisory only; the port is not reserved.
    pub fn next_free_port(&self, min: u16) -> Option<u16> {
        self.ctx.ports.next_free_port(min)
    }

    /// Process hotplug events until `cancel` fires or the source ends,
    /// then close every bridge
    pub async fn run(&mut self, mut events: mpsc::UnboundedReceiver<DeviceEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(DeviceEvent::Added(path)) => {
                        self.add(path);
                    }
                    Some(DeviceEvent::Removed(path)) => {
                        self.remove(&path);
                    }
                    None => break,
                },
                Some((path, instance)) = self.closed_rx.recv() => self.reap(&path, instance),
            }
        }
        self.shutdown().await;
    }

    /// Close every bridge and wait for all of them
    pub async fn shutdown(&mut self) {
        let handles: Vec<BridgeHandle> = self
            .bridges
            .drain()
            .chain(self.closing.drain())
            .map(|(_, h)| h)
            .collect();
        for handle in &handles {
            handle.close();
        }
        for handle in &handles {
            handle.closed().await;
        }
        tracing::info!(count = handles.len(), "All bridges closed");
    }

    /// Drop a finished bridge from whichever map still holds it
    fn reap(&mut self, path: &str, instance: u64) {
        if self.bridges.get(path).map(|h| h.instance()) == Some(instance) {
            self.bridges.remove(path);
            tracing::debug!(%path, "Reaped bridge that closed on its own");
        }
        if self.closing.get(path).map(|h| h.instance()) == Some(instance) {
            self.closing.remove(path);
        }
    }

    fn watch_close(&self, handle: &BridgeHandle) {
        let tx = self.closed_tx.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            handle.closed().await;
            let _ = tx.send((handle.path().to_string(), handle.instance()));
        });
    }
}

impl std::fmt::Debug for BridgeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeManager")
            .field("bridges", &self.bridges.len())
            .field("closing", &self.closing.len())
            .finish()
    }
}
