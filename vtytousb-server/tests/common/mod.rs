//! Shared helpers for gateway integration tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tempfile::TempDir;

use vtytousb_server::bridge::{BridgeHandle, BridgeState};
use vtytousb_server::config::{AppConfig, ConfigStore, Defaults, StoreOptions};
use vtytousb_server::{GatewayContext, HostKey, LoopbackConnector};

pub fn options() -> StoreOptions {
    StoreOptions {
        debounce: Duration::from_millis(50),
        retry_delay: Duration::from_millis(300),
    }
}

pub fn host_key() -> &'static HostKey {
    static KEY: OnceLock<HostKey> = OnceLock::new();
    KEY.get_or_init(|| HostKey::generate(1024).unwrap())
}

/// An unused port whose successor is also unused
pub fn free_port() -> u16 {
    static HANDED_OUT: OnceLock<Mutex<HashSet<u16>>> = OnceLock::new();
    let handed_out = HANDED_OUT.get_or_init(|| Mutex::new(HashSet::new()));
    loop {
        let listener = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let next = port.wrapping_add(1);
        let mut taken = handed_out.lock().unwrap();
        if !taken.contains(&port)
            && !taken.contains(&next)
            && std::net::TcpListener::bind(("0.0.0.0", next)).is_ok()
        {
            taken.insert(port);
            taken.insert(next);
            return port;
        }
    }
}

/// Gateway over a temp data dir, loopback devices and a temp device dir
pub struct Gateway {
    pub data: TempDir,
    pub devices: TempDir,
    pub ctx: Arc<GatewayContext>,
    pub connector: Arc<LoopbackConnector>,
}

impl Gateway {
    /// Counters start at fresh free ports so parallel tests do not collide
    pub async fn new() -> Self {
        let (telnet, ssh) = (free_port(), free_port());
        let data = tempfile::tempdir().unwrap();
        let devices = tempfile::tempdir().unwrap();

        let defaults: Defaults<AppConfig> = Arc::new(move |_| AppConfig {
            next_port_telnet: telnet,
            next_port_ssh: ssh,
            ..AppConfig::default()
        });
        let app = ConfigStore::open_with(data.path().join("config.json"), defaults, options())
            .await
            .unwrap();
        let connector = Arc::new(LoopbackConnector::new());
        let ctx = GatewayContext::new(
            Arc::new(app),
            connector.clone(),
            host_key(),
            data.path().join("serials"),
        )
        .unwrap()
        .with_store_options(options());

        Self {
            data,
            devices,
            ctx: Arc::new(ctx),
            connector,
        }
    }

    pub fn counters(&self) -> (u16, u16) {
        let app = self.ctx.app_config.get();
        (app.next_port_telnet, app.next_port_ssh)
    }

    /// Create a device entry in the watched directory
    pub fn plug(&self, name: &str) -> String {
        let path = self.devices.path().join(name);
        std::fs::write(&path, "").unwrap();
        path.to_string_lossy().into_owned()
    }

    pub fn unplug(&self, name: &str) {
        std::fs::remove_file(self.devices.path().join(name)).unwrap();
    }

    pub fn bridge_file(&self, id: &str) -> PathBuf {
        self.ctx.serials_dir.join(format!("{}.json", id))
    }
}

pub async fn running(handle: &BridgeHandle) {
    let mut rx = handle.watch_status();
    tokio::time::timeout(
        Duration::from_secs(10),
        rx.wait_for(|s| s.state == BridgeState::Running),
    )
    .await
    .unwrap()
    .unwrap();
}

/// Poll `cond` for up to five seconds
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cond()
}
