//! Configuration schema structs

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Validation rules a configuration value must satisfy before it is accepted
pub trait Validate {
    fn validate(&self) -> Result<(), String>;
}

/// Marker for types a [`super::ConfigStore`] can hold
pub trait ConfigSchema:
    Validate + Serialize + DeserializeOwned + Clone + PartialEq + Default + Send + Sync + 'static
{
}

impl<T> ConfigSchema for T where
    T: Validate
        + Serialize
        + DeserializeOwned
        + Clone
        + PartialEq
        + Default
        + Send
        + Sync
        + 'static
{
}

/// Gateway-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Telnet port handed to the next newly seen device
    pub next_port_telnet: u16,
    /// SSH port handed to the next newly seen device
    pub next_port_ssh: u16,
    /// Baud rate for newly seen devices
    pub default_baud_rate: u32,
    /// Bytes of device output kept per bridge for late joiners
    pub max_serial_cache: usize,
    /// Password for the `root` SSH user; empty disables SSH auth
    pub ssh_root_password: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            next_port_telnet: 5000,
            next_port_ssh: 6000,
            default_baud_rate: 9600,
            max_serial_cache: 1000,
            ssh_root_password: "vtytousb".into(),
        }
    }
}

impl Validate for AppConfig {
    fn validate(&self) -> Result<(), String> {
        if self.next_port_telnet == 0 {
            return Err("nextPortTelnet must be between 1 and 65535".into());
        }
        if self.next_port_ssh == 0 {
            return Err("nextPortSsh must be between 1 and 65535".into());
        }
        if self.default_baud_rate == 0 {
            return Err("defaultBaudRate must be greater than 0".into());
        }
        Ok(())
    }
}

impl AppConfig {
    /// Advance both allocation counters past the ports just handed out
    pub fn advance_counters(&mut self) {
        self.next_port_telnet = self.next_port_telnet.saturating_add(1);
        self.next_port_ssh = self.next_port_ssh.saturating_add(1);
    }
}

/// Per-device settings
///
/// `Default` is the empty value: zero ports and no credentials. Real
/// defaults depend on the app counters and come from [`BridgeConfig::from_app`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// SSH listener port, 0 disables
    pub ssh_port: u16,
    /// Telnet listener port, 0 disables
    pub telnet_port: u16,
    pub baud_rate: u32,
    pub ssh_user: String,
    pub ssh_password: String,
}

impl BridgeConfig {
    /// Defaults for a device seen for the first time
    pub fn from_app(app: &AppConfig) -> Self {
        Self {
            ssh_port: app.next_port_ssh,
            telnet_port: app.next_port_telnet,
            baud_rate: app.default_baud_rate,
            ssh_user: "user".into(),
            ssh_password: "vtytousb".into(),
        }
    }
}

impl Validate for BridgeConfig {
    fn validate(&self) -> Result<(), String> {
        if self.baud_rate == 0 {
            return Err("baudRate must be greater than 0".into());
        }
        if self.telnet_port != 0 && self.telnet_port == self.ssh_port {
            return Err(format!(
                "telnetPort and sshPort must differ (both are {})",
                self.telnet_port
            ));
        }
        Ok(())
    }
}
