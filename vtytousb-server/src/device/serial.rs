//! Real serial ports via tokio-serial

use async_trait::async_trait;
use tokio_serial::SerialPortBuilderExt;

use vtytousb_utils::{GatewayError, Result};

use super::{DeviceStream, SerialConnector};

/// Opens serial ports as 8N1 with no flow control
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSerialConnector;

#[async_trait]
impl SerialConnector for TokioSerialConnector {
    async fn open(&self, path: &str, baud_rate: u32) -> Result<DeviceStream> {
        let stream = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| GatewayError::device(path, e.to_string()))?;

        tracing::debug!(path, baud_rate, "Serial port opened");
        Ok(Box::new(stream))
    }
}
