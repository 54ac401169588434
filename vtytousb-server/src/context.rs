//! Process-wide state shared by every bridge
//!
//! Built once at startup and passed down as `Arc<GatewayContext>`.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use vtytousb_utils::Result;

use crate::config::{AppConfig, ConfigStore, StoreOptions};
use crate::device::SerialConnector;
use crate::vty::host_key::HostKey;
use crate::vty::ssh;

/// Ports currently bound by listeners in this process
///
/// Only guards against collisions between our own listeners; other
/// processes are not consulted.
#[derive(Debug, Default)]
pub struct PortRegistry {
    used: Mutex<HashSet<u16>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `port`; false if it is already claimed
    pub fn reserve(&self, port: u16) -> bool {
        self.used.lock().insert(port)
    }

    /// Give `port` back; false if it was not claimed
    pub fn release(&self, port: u16) -> bool {
        self.used.lock().remove(&port)
    }

    pub fn is_used(&self, port: u16) -> bool {
        self.used.lock().contains(&port)
    }

    /// Smallest unclaimed port `>= min`
    ///
    /// Does not claim it. Two callers that do not reserve in between can
    /// be handed the same port.
    pub fn next_free_port(&self, min: u16) -> Option<u16> {
        let used = self.used.lock();
        (min.max(1)..=u16::MAX).find(|p| !used.contains(p))
    }

    pub fn len(&self) -> usize {
        self.used.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.lock().is_empty()
    }
}

/// Shared gateway context
pub struct GatewayContext {
    pub app_config: Arc<ConfigStore<AppConfig>>,
    pub ports: PortRegistry,
    pub connector: Arc<dyn SerialConnector>,
    pub ssh_config: Arc<russh::server::Config>,
    /// Where per-device config files live
    pub serials_dir: PathBuf,
    /// Timings for per-device config stores
    pub store_options: StoreOptions,
}

impl GatewayContext {
    pub fn new(
        app_config: Arc<ConfigStore<AppConfig>>,
        connector: Arc<dyn SerialConnector>,
        host_key: &HostKey,
        serials_dir: PathBuf,
    ) -> Result<Self> {
        Ok(Self {
            app_config,
            ports: PortRegistry::new(),
            connector,
            ssh_config: Arc::new(ssh::server_config(host_key)?),
            serials_dir,
            store_options: StoreOptions::default(),
        })
    }

    /// Override per-device store timings
    pub fn with_store_options(mut self, options: StoreOptions) -> Self {
        self.store_options = options;
        self
    }
}

impl std::fmt::Debug for GatewayContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayContext")
            .field("serials_dir", &self.serials_dir)
            .field("ports", &self.ports)
            .finish_non_exhaustive()
    }
}
