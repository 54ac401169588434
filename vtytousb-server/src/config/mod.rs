//! Configuration management for the gateway
//!
//! Typed JSON configuration files with validation, default materialization
//! and hot-reload. [`ConfigStore`] is generic and backs both the app-wide
//! settings and each device's settings.

mod loader;
mod schema;
mod store;
mod watcher;

pub use loader::ConfigLoader;
pub use schema::{AppConfig, BridgeConfig, ConfigSchema, Validate};
pub use store::{Change, ConfigStore, Defaults, StoreEvent, StoreOptions, RETRY_DELAY};
pub use watcher::{ConfigFileWatcher, DEBOUNCE};
