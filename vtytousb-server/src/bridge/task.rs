//! Bridge actor
//!
//! One task per device. It owns the device connection, both listeners and
//! the device's config store, and is driven by a command channel fed from
//! the device reader, the data bus and config change events. Nothing else
//! touches that state, so no locks are needed around it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use vtytousb_utils::{paths, GatewayError, Result};

use super::link::{BridgeLink, BusEvent};
use super::sanitize_id;
use crate::config::{AppConfig, BridgeConfig, Change, ConfigStore, Defaults, StoreEvent};
use crate::context::GatewayContext;
use crate::device::DeviceStream;
use crate::events::{handler, EventSubscriber};
use crate::vty::ssh::SshProtocol;
use crate::vty::telnet::TelnetProtocol;
use crate::vty::{Vty, VtyKind, VtyProtocol};

const READ_BUF: usize = 4096;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Waiting for config or the device
    Starting,
    Running,
    Closed,
}

/// A listener as currently configured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VtyStatus {
    pub port: u16,
    pub listening: bool,
}

/// Snapshot published on every state or config transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeStatus {
    pub state: BridgeState,
    pub baud_rate: u32,
    /// `None` when the port is 0
    pub telnet: Option<VtyStatus>,
    pub ssh: Option<VtyStatus>,
}

impl BridgeStatus {
    fn starting() -> Self {
        Self {
            state: BridgeState::Starting,
            baud_rate: 0,
            telnet: None,
            ssh: None,
        }
    }
}

enum Command {
    DeviceData { generation: u64, data: Bytes },
    DeviceClosed { generation: u64, reason: String },
    Write(Bytes),
    ConfigChanged(Arc<BridgeConfig>),
    AppChanged(Arc<AppConfig>),
}

/// Handle to a running bridge
#[derive(Clone)]
pub struct BridgeHandle {
    instance: u64,
    id: String,
    path: String,
    cancel: CancellationToken,
    status: watch::Receiver<BridgeStatus>,
    link: Arc<OnceLock<Arc<BridgeLink>>>,
}

impl BridgeHandle {
    /// Unique per spawned bridge, even for the same path
    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Ask the bridge to tear down
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Wait until teardown has finished
    pub async fn closed(&self) {
        let mut rx = self.status.clone();
        let _ = rx.wait_for(|s| s.state == BridgeState::Closed).await;
    }

    pub fn is_closed(&self) -> bool {
        self.status.borrow().state == BridgeState::Closed
    }

    pub fn status(&self) -> BridgeStatus {
        self.status.borrow().clone()
    }

    /// Receiver for status transitions
    pub fn watch_status(&self) -> watch::Receiver<BridgeStatus> {
        self.status.clone()
    }

    /// The VTY-facing half, once the config has loaded
    pub fn link(&self) -> Option<Arc<BridgeLink>> {
        self.link.get().cloned()
    }
}

impl std::fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandle")
            .field("instance", &self.instance)
            .field("id", &self.id)
            .field("path", &self.path)
            .field("state", &self.status.borrow().state)
            .finish()
    }
}

struct DeviceConnection {
    writer: WriteHalf<DeviceStream>,
    reader: JoinHandle<()>,
}

/// Per-device actor state
pub struct Bridge {
    ctx: Arc<GatewayContext>,
    link: Arc<BridgeLink>,
    config: Arc<ConfigStore<BridgeConfig>>,
    /// What the device and listeners are actually running with
    applied: BridgeConfig,
    device: Option<DeviceConnection>,
    /// Bumped on every device open; stale reader messages are ignored
    generation: u64,
    telnet: Option<Vty>,
    ssh: Option<Vty>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    status_tx: watch::Sender<BridgeStatus>,
    config_sub: EventSubscriber<StoreEvent, Change<BridgeConfig>>,
    app_sub: EventSubscriber<StoreEvent, Change<AppConfig>>,
    bus_sub: EventSubscriber<BusEvent, Bytes>,
}

impl Bridge {
    /// Start a bridge for the device at `path`
    ///
    /// If `after` is given the bridge waits for that status to reach
    /// [`BridgeState::Closed`] before touching config or device, so a
    /// replaced bridge for the same device has released both.
    pub fn spawn(
        ctx: Arc<GatewayContext>,
        path: impl Into<String>,
        after: Option<watch::Receiver<BridgeStatus>>,
    ) -> BridgeHandle {
        let path = path.into();
        let id = sanitize_id(&path);
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(BridgeStatus::starting());
        let link_slot = Arc::new(OnceLock::new());

        let handle = BridgeHandle {
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            id: id.clone(),
            path: path.clone(),
            cancel: cancel.clone(),
            status: status_rx,
            link: Arc::clone(&link_slot),
        };

        tokio::spawn(run(ctx, id, path, after, cancel, status_tx, link_slot));
        handle
    }

    fn subscribe(&self) {
        let tx = self.cmd_tx.clone();
        self.config_sub.on(
            StoreEvent::Change,
            handler(move |change: &Change<BridgeConfig>| {
                let _ = tx.send(Command::ConfigChanged(Arc::clone(&change.current)));
            }),
        );

        let tx = self.cmd_tx.clone();
        self.app_sub.on(
            StoreEvent::Change,
            handler(move |change: &Change<AppConfig>| {
                let _ = tx.send(Command::AppChanged(Arc::clone(&change.current)));
            }),
        );

        let tx = self.cmd_tx.clone();
        self.bus_sub.on(
            BusEvent::Write,
            handler(move |data: &Bytes| {
                let _ = tx.send(Command::Write(data.clone()));
            }),
        );
    }

    async fn start(&mut self) -> Result<()> {
        let config = self.config.get();
        self.open_device(config.baud_rate).await?;
        self.telnet = self.start_vty(VtyKind::Telnet, config.telnet_port).await;
        self.ssh = self.start_vty(VtyKind::Ssh, config.ssh_port).await;
        self.applied = (*config).clone();
        self.publish_status(BridgeState::Running);
        tracing::info!(
            bridge = %self.link.id(),
            path = %self.link.path(),
            baud_rate = config.baud_rate,
            "Bridge running"
        );
        Ok(())
    }

    async fn run_loop(&mut self) {
        loop {
            let cmd = tokio::select! {
                _ = self.cancel.cancelled() => break,
                cmd = self.cmd_rx.recv() => cmd,
            };
            let Some(cmd) = cmd else { break };

            match cmd {
                Command::DeviceData { generation, data } if generation == self.generation => {
                    self.link.publish(data);
                }
                Command::DeviceClosed { generation, reason } if generation == self.generation => {
                    tracing::info!(bridge = %self.link.id(), %reason, "Serial disconnected: {}", self.link.id());
                    break;
                }
                Command::DeviceData { .. } | Command::DeviceClosed { .. } => {}
                Command::Write(data) => {
                    if let Err(e) = self.write_device(&data).await {
                        tracing::error!(bridge = %self.link.id(), error = %e, "Serial write failed");
                        break;
                    }
                }
                Command::ConfigChanged(desired) => {
                    if let Err(e) = self.apply_config(&desired).await {
                        tracing::error!(bridge = %self.link.id(), error = %e, "Failed to apply config");
                        break;
                    }
                }
                Command::AppChanged(app) => self.apply_app_config(&app),
            }
        }
    }

    /// Bring the device and listeners in line with `desired`
    async fn apply_config(&mut self, desired: &BridgeConfig) -> Result<()> {
        if desired.baud_rate != self.applied.baud_rate {
            tracing::info!(
                bridge = %self.link.id(),
                from = self.applied.baud_rate,
                to = desired.baud_rate,
                "Baud rate changed, reopening device"
            );
            self.close_device().await;
            self.open_device(desired.baud_rate).await?;
            self.applied.baud_rate = desired.baud_rate;
        }

        let telnet_changed = desired.telnet_port != self.applied.telnet_port;
        let ssh_changed = desired.ssh_port != self.applied.ssh_port;

        // Stop both first so a swap of the two ports does not collide
        if telnet_changed {
            if let Some(vty) = self.telnet.take() {
                vty.stop().await;
            }
        }
        if ssh_changed {
            if let Some(vty) = self.ssh.take() {
                vty.stop().await;
            }
        }
        if telnet_changed {
            let port = self.assign_port(VtyKind::Telnet, desired.telnet_port);
            self.telnet = self.start_vty(VtyKind::Telnet, port).await;
            self.applied.telnet_port = port;
        }
        if ssh_changed {
            let port = self.assign_port(VtyKind::Ssh, desired.ssh_port);
            self.ssh = self.start_vty(VtyKind::Ssh, port).await;
            self.applied.ssh_port = port;
        }

        self.applied = BridgeConfig {
            telnet_port: self.applied.telnet_port,
            ssh_port: self.applied.ssh_port,
            baud_rate: self.applied.baud_rate,
            ..desired.clone()
        };

        if self.applied.telnet_port != desired.telnet_port || self.applied.ssh_port != desired.ssh_port
        {
            let (telnet_port, ssh_port) = (self.applied.telnet_port, self.applied.ssh_port);
            if let Err(e) = self.config.update(|c| {
                c.telnet_port = telnet_port;
                c.ssh_port = ssh_port;
            }) {
                tracing::warn!(bridge = %self.link.id(), error = %e, "Could not persist reassigned port");
            }
        }

        self.publish_status(BridgeState::Running);
        tracing::info!(bridge = %self.link.id(), "Applied config for bridge {}.", self.link.id());
        Ok(())
    }

    fn apply_app_config(&mut self, app: &AppConfig) {
        if app.max_serial_cache != self.link.cache_limit() {
            self.link.set_cache_limit(app.max_serial_cache);
            tracing::debug!(
                bridge = %self.link.id(),
                limit = app.max_serial_cache,
                "Serial cache limit updated"
            );
        }
    }

    /// Pick a free port for a live port change
    fn assign_port(&self, kind: VtyKind, requested: u16) -> u16 {
        if requested == 0 || !self.ctx.ports.is_used(requested) {
            return requested;
        }
        match self.ctx.ports.next_free_port(requested) {
            Some(port) => {
                tracing::warn!(
                    bridge = %self.link.id(),
                    requested,
                    assigned = port,
                    "Port {} in use, {} moved to {}",
                    requested,
                    kind,
                    port
                );
                port
            }
            None => requested,
        }
    }

    async fn start_vty(&mut self, kind: VtyKind, port: u16) -> Option<Vty> {
        if port == 0 {
            return None;
        }
        let protocol: Arc<dyn VtyProtocol> = match kind {
            VtyKind::Telnet => Arc::new(TelnetProtocol),
            VtyKind::Ssh => Arc::new(SshProtocol::new(Arc::clone(&self.ctx.ssh_config))),
        };
        Some(Vty::start(Arc::clone(&self.ctx), protocol, Arc::clone(&self.link), port).await)
    }

    async fn open_device(&mut self, baud_rate: u32) -> Result<()> {
        let stream = self.ctx.connector.open(self.link.path(), baud_rate).await?;
        self.generation += 1;
        let generation = self.generation;
        let (reader, writer) = tokio::io::split(stream);
        let reader = tokio::spawn(read_device(reader, generation, self.cmd_tx.clone()));
        self.device = Some(DeviceConnection { writer, reader });
        tracing::debug!(bridge = %self.link.id(), baud_rate, generation, "Device opened");
        Ok(())
    }

    /// Close the device fully before it can be opened again
    async fn close_device(&mut self) {
        if let Some(device) = self.device.take() {
            device.reader.abort();
            let _ = device.reader.await;
            let mut writer = device.writer;
            let _ = writer.shutdown().await;
        }
    }

    async fn write_device(&mut self, data: &[u8]) -> Result<()> {
        let path = self.link.path().to_string();
        if let Some(device) = self.device.as_mut() {
            device
                .writer
                .write_all(data)
                .await
                .map_err(|e| GatewayError::device(path, e.to_string()))?;
        }
        Ok(())
    }

    fn publish_status(&self, state: BridgeState) {
        let vty_status = |vty: &Option<Vty>| {
            vty.as_ref().map(|v| VtyStatus {
                port: v.port(),
                listening: v.listening(),
            })
        };
        self.status_tx.send_replace(BridgeStatus {
            state,
            baud_rate: self.applied.baud_rate,
            telnet: vty_status(&self.telnet),
            ssh: vty_status(&self.ssh),
        });
    }

    async fn teardown(&mut self) {
        self.config_sub.off_all();
        self.app_sub.off_all();
        self.bus_sub.off_all();

        self.close_device().await;
        if let Some(vty) = self.telnet.take() {
            vty.stop().await;
        }
        if let Some(vty) = self.ssh.take() {
            vty.stop().await;
        }
        self.config.close().await;

        self.publish_status(BridgeState::Closed);
        tracing::info!(bridge = %self.link.id(), path = %self.link.path(), "Bridge closed");
    }
}

async fn run(
    ctx: Arc<GatewayContext>,
    id: String,
    path: String,
    after: Option<watch::Receiver<BridgeStatus>>,
    cancel: CancellationToken,
    status_tx: watch::Sender<BridgeStatus>,
    link_slot: Arc<OnceLock<Arc<BridgeLink>>>,
) {
    let closed = |status_tx: &watch::Sender<BridgeStatus>| {
        status_tx.send_modify(|s| s.state = BridgeState::Closed);
    };

    if let Some(mut previous) = after {
        tokio::select! {
            _ = previous.wait_for(|s| s.state == BridgeState::Closed) => {}
            _ = cancel.cancelled() => {
                closed(&status_tx);
                return;
            }
        }
    }

    let store_path = paths::bridge_config_file(&ctx.serials_dir, &id);
    let defaults = bridge_defaults(Arc::clone(&ctx.app_config));
    let opened = tokio::select! {
        result = ConfigStore::open_with(store_path, defaults, ctx.store_options) => result,
        _ = cancel.cancelled() => {
            closed(&status_tx);
            return;
        }
    };
    let config = match opened {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(bridge = %id, error = %e, "Failed to open bridge config");
            closed(&status_tx);
            return;
        }
    };

    let link = Arc::new(BridgeLink::new(
        id,
        path,
        Arc::clone(&config),
        Arc::clone(&ctx.app_config),
    ));
    let _ = link_slot.set(Arc::clone(&link));

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let mut bridge = Bridge {
        config_sub: EventSubscriber::new(config.events()),
        app_sub: EventSubscriber::new(ctx.app_config.events()),
        bus_sub: EventSubscriber::new(link.bus()),
        ctx,
        link,
        config,
        applied: BridgeConfig::default(),
        device: None,
        generation: 0,
        telnet: None,
        ssh: None,
        cmd_tx,
        cmd_rx,
        cancel,
        status_tx,
    };
    bridge.subscribe();

    match bridge.start().await {
        Ok(()) => bridge.run_loop().await,
        Err(e) => {
            tracing::error!(bridge = %bridge.link.id(), error = %e, "Failed to open serial device");
        }
    }
    bridge.teardown().await;
}

/// Defaults for a device config
///
/// A brand-new file takes the next ports from the app counters and advances
/// them. A port missing from an existing file means that listener is off,
/// since the counters may already have handed the same number out.
fn bridge_defaults(app: Arc<ConfigStore<AppConfig>>) -> Defaults<BridgeConfig> {
    Arc::new(move |is_new| {
        if !is_new {
            return BridgeConfig {
                telnet_port: 0,
                ssh_port: 0,
                ..BridgeConfig::from_app(&app.get())
            };
        }
        let mut allocated = None;
        let result = app.update(|current| {
            allocated = Some(BridgeConfig::from_app(current));
            current.advance_counters();
        });
        if let Err(e) = result {
            tracing::warn!(error = %e, "Could not advance port counters");
        }
        allocated.unwrap_or_else(|| BridgeConfig::from_app(&app.get()))
    })
}

async fn read_device(
    mut reader: ReadHalf<DeviceStream>,
    generation: u64,
    tx: mpsc::UnboundedSender<Command>,
) {
    let mut buf = vec![0u8; READ_BUF];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = tx.send(Command::DeviceClosed {
                    generation,
                    reason: "end of stream".into(),
                });
                break;
            }
            Ok(n) => {
                let data = Bytes::copy_from_slice(&buf[..n]);
                if tx.send(Command::DeviceData { generation, data }).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(Command::DeviceClosed {
                    generation,
                    reason: e.to_string(),
                });
                break;
            }
        }
    }
}
