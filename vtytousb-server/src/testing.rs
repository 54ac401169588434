//! Shared fixtures for unit tests

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;

use crate::bridge::{BridgeHandle, BridgeLink};
use crate::config::{AppConfig, BridgeConfig, ConfigStore, Defaults, StoreOptions};
use crate::context::GatewayContext;
use crate::device::LoopbackConnector;
use crate::vty::host_key::HostKey;

/// Small key; generation time dominates otherwise
pub fn host_key() -> &'static HostKey {
    static KEY: OnceLock<HostKey> = OnceLock::new();
    KEY.get_or_init(|| HostKey::generate(1024).unwrap())
}

/// A port that was free a moment ago and has not been handed out before
pub fn free_port() -> u16 {
    static HANDED_OUT: OnceLock<Mutex<HashSet<u16>>> = OnceLock::new();
    let handed_out = HANDED_OUT.get_or_init(|| Mutex::new(HashSet::new()));
    loop {
        let listener = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        // Keep port + 1 clear too; counters advance by one per device
        let mut taken = handed_out.lock();
        if !taken.contains(&port) && !taken.contains(&port.wrapping_add(1)) {
            taken.insert(port);
            taken.insert(port.wrapping_add(1));
            return port;
        }
    }
}

pub fn fast_options() -> StoreOptions {
    StoreOptions {
        debounce: Duration::from_millis(50),
        retry_delay: Duration::from_millis(300),
    }
}

/// Poll `cond` for up to five seconds
pub async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cond()
}

/// Context over a temp data dir and loopback devices
pub struct TestEnv {
    pub dir: TempDir,
    pub ctx: Arc<GatewayContext>,
    pub connector: Arc<LoopbackConnector>,
}

impl TestEnv {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let app_defaults: Defaults<AppConfig> = Arc::new(|_| AppConfig::default());
        let app = ConfigStore::open_with(dir.path().join("config.json"), app_defaults, fast_options())
            .await
            .unwrap();
        let connector = Arc::new(LoopbackConnector::new());
        let ctx = GatewayContext::new(
            Arc::new(app),
            connector.clone(),
            host_key(),
            dir.path().join("serials"),
        )
        .unwrap()
        .with_store_options(fast_options());

        Self {
            dir,
            ctx: Arc::new(ctx),
            connector,
        }
    }

    pub fn serials_dir(&self) -> PathBuf {
        self.ctx.serials_dir.clone()
    }

    /// A link over a fresh device config, without a running bridge
    pub async fn link(&self, id: &str) -> Arc<BridgeLink> {
        let defaults: Defaults<BridgeConfig> =
            Arc::new(|_| BridgeConfig::from_app(&AppConfig::default()));
        let store = ConfigStore::open_with(
            self.serials_dir().join(format!("{}.json", id)),
            defaults,
            fast_options(),
        )
        .await
        .unwrap();
        Arc::new(BridgeLink::new(
            id,
            format!("/dev/{}", id),
            Arc::new(store),
            Arc::clone(&self.ctx.app_config),
        ))
    }

    pub fn counters(&self) -> (u16, u16) {
        let app = self.ctx.app_config.get();
        (app.next_port_telnet, app.next_port_ssh)
    }

    pub fn set_counters(&self, telnet: u16, ssh: u16) {
        self.ctx
            .app_config
            .update(|c| {
                c.next_port_telnet = telnet;
                c.next_port_ssh = ssh;
            })
            .unwrap();
    }

    /// Pre-create a device config file
    pub fn write_bridge_config(&self, id: &str, telnet_port: u16, ssh_port: u16, baud_rate: u32) {
        let config = BridgeConfig {
            telnet_port,
            ssh_port,
            baud_rate,
            ..BridgeConfig::from_app(&AppConfig::default())
        };
        std::fs::create_dir_all(self.serials_dir()).unwrap();
        std::fs::write(
            self.serials_dir().join(format!("{}.json", id)),
            serde_json::to_string_pretty(&config).unwrap(),
        )
        .unwrap();
    }

    /// Program-write the running bridge's config
    pub async fn bridge_store_update(&self, handle: &BridgeHandle, f: impl FnOnce(&mut BridgeConfig)) {
        let link = handle.link().unwrap();
        link.config_store().update(f).unwrap();
        link.config_store().flush().await;
    }
}
