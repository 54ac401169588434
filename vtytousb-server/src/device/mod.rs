//! Serial device connections
//!
//! Bridges open devices through a [`SerialConnector`] so the transport can
//! be swapped: real ports use [`TokioSerialConnector`], tests use
//! [`LoopbackConnector`].

mod loopback;
mod serial;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use vtytousb_utils::Result;

pub use loopback::{LoopbackConnector, LoopbackDevice};
pub use serial::TokioSerialConnector;

/// A bidirectional byte stream to a device
pub trait DeviceIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> DeviceIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Opened device connection
pub type DeviceStream = Box<dyn DeviceIo>;

/// Opens device connections
#[async_trait]
pub trait SerialConnector: Send + Sync {
    /// Open `path` at `baud_rate`
    async fn open(&self, path: &str, baud_rate: u32) -> Result<DeviceStream>;
}
