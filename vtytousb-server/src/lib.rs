//! vtytousb server library
//!
//! Exposes each hot-plugged serial device over a Telnet and an SSH listener.
//! A [`BridgeManager`] keeps one bridge per device path; each bridge owns the
//! device connection, its persisted per-device settings and the two
//! listeners, and applies settings edits made on disk without a restart.

pub mod bridge;
pub mod config;
pub mod context;
pub mod device;
pub mod events;
pub mod hotplug;
pub mod manager;
pub mod vty;

#[cfg(test)]
mod testing;

pub use bridge::{sanitize_id, Bridge, BridgeHandle, BridgeLink, BridgeState, BridgeStatus};
pub use config::{AppConfig, BridgeConfig, ConfigStore};
pub use context::{GatewayContext, PortRegistry};
pub use device::{LoopbackConnector, SerialConnector, TokioSerialConnector};
pub use events::{Emitter, EventSubscriber};
pub use hotplug::DeviceWatcher;
pub use manager::{BridgeManager, DeviceEvent};
pub use vty::host_key::HostKey;
