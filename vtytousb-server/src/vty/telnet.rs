//! Raw Telnet front-end
//!
//! No option negotiation state machine: the server announces a fixed set of
//! options up front and treats everything the client sends afterwards as
//! terminal input.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use vtytousb_utils::Result;

use super::{Inbound, VtyKind, VtyProtocol, CTRL_D};
use crate::bridge::{BridgeLink, ClientOutput};

/// Interpret As Command
pub const IAC: u8 = 0xFF;

/// Sent to every client on connect, in this order:
/// WILL ECHO, WILL SUPPRESS-GO-AHEAD, DONT TERMINAL-TYPE, DONT NAWS,
/// DO LINEMODE, SE
pub const NEGOTIATION: [u8; 17] = [
    IAC, 0xFB, 0x01, //
    IAC, 0xFB, 0x03, //
    IAC, 0xFE, 0x18, //
    IAC, 0xFE, 0x1F, //
    IAC, 0xFD, 0x22, //
    IAC, 0xF0,
];

const READ_BUF: usize = 4096;

#[derive(Debug, Default, Clone, Copy)]
pub struct TelnetProtocol;

#[async_trait]
impl VtyProtocol for TelnetProtocol {
    fn kind(&self) -> VtyKind {
        VtyKind::Telnet
    }

    fn inbound(&self, data: &[u8]) -> Inbound {
        // Clients pad CR with NUL
        let filtered: Vec<u8> = data.iter().copied().filter(|b| *b != 0x00).collect();
        match filtered.as_slice() {
            [] => Inbound::Skip,
            [CTRL_D] => Inbound::Hangup,
            _ => Inbound::Forward(Bytes::from(filtered)),
        }
    }

    fn outbound(&self, data: &Bytes) -> Bytes {
        if !data.contains(&IAC) {
            return data.clone();
        }
        // A stray 0xFF from the device would start a command on the client
        Bytes::from(data.iter().copied().filter(|b| *b != IAC).collect::<Vec<u8>>())
    }

    async fn serve(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        link: Arc<BridgeLink>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let _client = link.attach();
        let ClientOutput {
            banner,
            mut rx,
            subscription,
        } = link.open_output();

        let (mut reader, mut writer) = stream.into_split();
        writer.write_all(&NEGOTIATION).await?;
        writer.write_all(&banner).await?;

        let mut buf = [0u8; READ_BUF];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                read = reader.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        break;
                    }
                    match self.inbound(&buf[..n]) {
                        Inbound::Forward(data) => link.send_to_device(data),
                        Inbound::Hangup => {
                            tracing::debug!(bridge = %link.id(), %peer, "Telnet client sent Ctrl-D");
                            break;
                        }
                        Inbound::Skip => {}
                    }
                }
                data = rx.recv() => {
                    let Some(data) = data else {
                        tracing::info!(bridge = %link.id(), %peer, "Dropping stalled Telnet client");
                        break;
                    };
                    let out = self.outbound(&data);
                    if !out.is_empty() {
                        writer.write_all(&out).await?;
                    }
                }
            }
        }

        drop(subscription);
        let _ = writer.shutdown().await;
        Ok(())
    }
}
