//! Path utilities for vtytousb
//!
//! All persistent state lives under one data directory: the app config,
//! one config file per serial device, the SSH host key and the logs.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;

/// Application identifier for XDG directories
const APP_NAME: &str = "vtytousb";

/// Environment variable overriding the data directory
pub const DATA_DIR_ENV: &str = "VTYTOUSB_DATA_DIR";

/// Environment variable overriding the watched device directory
pub const DEVICE_DIR_ENV: &str = "VTYTOUSB_DEVICE_DIR";

/// Stable-by-path serial device entries on Linux
pub const DEFAULT_DEVICE_DIR: &str = "/dev/serial/by-path";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", APP_NAME)
}

/// Get the data directory
///
/// Location: `$VTYTOUSB_DATA_DIR`, else `$XDG_DATA_HOME/vtytousb`
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    project_dirs()
        .map(|p| p.data_local_dir().to_path_buf())
        .unwrap_or_else(fallback_data_dir)
}

/// Get the app config file path
///
/// Location: `<data>/config.json`
pub fn app_config_file() -> PathBuf {
    data_dir().join("config.json")
}

/// Get the directory holding one config file per serial device
///
/// Location: `<data>/serials`
pub fn serials_dir() -> PathBuf {
    data_dir().join("serials")
}

/// Get the config file for a device id inside `serials_dir`
pub fn bridge_config_file(serials_dir: &Path, id: &str) -> PathBuf {
    serials_dir.join(format!("{}.json", id))
}

/// Get the SSH host key file path
///
/// Location: `<data>/ssh_key.json`
pub fn ssh_key_file() -> PathBuf {
    data_dir().join("ssh_key.json")
}

/// Get the log directory
///
/// Location: `<data>/log`
pub fn log_dir() -> PathBuf {
    data_dir().join("log")
}

/// Get the directory watched for hot-plugged serial devices
pub fn device_dir() -> PathBuf {
    std::env::var(DEVICE_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_DEVICE_DIR))
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Ensure all required directories exist
pub fn ensure_all_dirs() -> std::io::Result<()> {
    ensure_dir(&data_dir())?;
    ensure_dir(&serials_dir())?;
    ensure_dir(&log_dir())?;
    Ok(())
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

fn fallback_data_dir() -> PathBuf {
    home_dir().join(".local").join("share").join(APP_NAME)
}
