//! In-memory devices
//!
//! Every open creates a duplex pipe. The gateway keeps one end; the other
//! end is handed to whoever holds the connector, which can then play the
//! part of the device.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use vtytousb_utils::{GatewayError, Result};

use super::{DeviceStream, SerialConnector};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Device side of an opened loopback connection
#[derive(Debug)]
pub struct LoopbackDevice {
    pub path: String,
    pub baud_rate: u32,
    pub stream: DuplexStream,
}

/// Connector backed by in-memory pipes
#[derive(Debug)]
pub struct LoopbackConnector {
    opens: Mutex<Vec<(String, u32)>>,
    failing: Mutex<HashSet<String>>,
    tx: mpsc::UnboundedSender<LoopbackDevice>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<LoopbackDevice>>,
}

impl Default for LoopbackConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackConnector {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            opens: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Every successful `(path, baud_rate)` open so far
    pub fn opens(&self) -> Vec<(String, u32)> {
        self.opens.lock().clone()
    }

    /// Number of successful opens of `path`
    pub fn open_count(&self, path: &str) -> usize {
        self.opens.lock().iter().filter(|(p, _)| p == path).count()
    }

    /// Make future opens of `path` fail
    pub fn fail_path(&self, path: impl Into<String>) {
        self.failing.lock().insert(path.into());
    }

    /// Wait for the next opened device
    pub async fn next_device(&self) -> Option<LoopbackDevice> {
        self.rx.lock().await.recv().await
    }
}

#[async_trait]
impl SerialConnector for LoopbackConnector {
    async fn open(&self, path: &str, baud_rate: u32) -> Result<DeviceStream> {
        if self.failing.lock().contains(path) {
            return Err(GatewayError::device(path, "No such file or directory"));
        }

        let (gateway_end, device_end) = tokio::io::duplex(PIPE_CAPACITY);
        self.opens.lock().push((path.to_string(), baud_rate));
        let _ = self.tx.send(LoopbackDevice {
            path: path.to_string(),
            baud_rate,
            stream: device_end,
        });
        Ok(Box::new(gateway_end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_loopback_round_trip() {
        let connector = LoopbackConnector::new();
        let mut gateway = connector.open("/dev/ttyUSB0", 9600).await.unwrap();
        let mut device = connector.next_device().await.unwrap();
        assert_eq!(device.path, "/dev/ttyUSB0");
        assert_eq!(device.baud_rate, 9600);

        gateway.write_all(b"AT\r").await.unwrap();
        let mut buf = [0u8; 3];
        device.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"AT\r");

        device.stream.write_all(b"OK").await.unwrap();
        let mut buf = [0u8; 2];
        gateway.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"OK");
    }

    #[tokio::test]
    async fn test_loopback_records_opens() {
        let connector = LoopbackConnector::new();
        connector.open("/dev/a", 9600).await.unwrap();
        connector.open("/dev/a", 115200).await.unwrap();
        connector.open("/dev/b", 9600).await.unwrap();

        assert_eq!(connector.open_count("/dev/a"), 2);
        assert_eq!(connector.opens()[1], ("/dev/a".to_string(), 115200));
    }

    #[tokio::test]
    async fn test_loopback_failing_path() {
        let connector = LoopbackConnector::new();
        connector.fail_path("/dev/broken");
        assert!(connector.open("/dev/broken", 9600).await.is_err());
        assert_eq!(connector.open_count("/dev/broken"), 0);
    }

    #[tokio::test]
    async fn test_device_hangup_reaches_gateway() {
        let connector = LoopbackConnector::new();
        let mut gateway = connector.open("/dev/a", 9600).await.unwrap();
        drop(connector.next_device().await.unwrap());

        let mut buf = [0u8; 8];
        assert_eq!(gateway.read(&mut buf).await.unwrap(), 0);
    }
}
