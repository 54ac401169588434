//! Per-device bridges
//!
//! A bridge ties one serial device to its Telnet and SSH listeners. The
//! [`Bridge`] actor owns the device and the listeners; VTY connections only
//! see the [`BridgeLink`].

mod cache;
mod link;
mod task;

use lazy_static::lazy_static;
use regex::Regex;

pub use cache::SerialCache;
pub use link::{BridgeLink, Bus, BusEvent, ClientGuard, ClientOutput, CLIENT_BACKLOG};
pub use task::{Bridge, BridgeHandle, BridgeState, BridgeStatus, VtyStatus};

lazy_static! {
    static ref UNSAFE_ID_CHARS: Regex = Regex::new(r"[^A-Za-z0-9._-]").unwrap();
}

/// Filesystem-safe id for a device path
///
/// Derived from the last path component, so the same physical port keeps
/// its id (and its config file) across reconnects.
pub fn sanitize_id(path: &str) -> String {
    let base = path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    let id = UNSAFE_ID_CHARS.replace_all(base, "_").into_owned();
    match id.as_str() {
        "" | "." | ".." => format!("device{}", id.replace('.', "_")),
        _ => id,
    }
}
