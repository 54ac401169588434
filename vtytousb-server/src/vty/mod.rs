//! Network front-ends for a bridge
//!
//! A [`Vty`] owns one TCP port: it claims the port in the process-wide
//! registry, runs the accept loop, and releases the port when stopped. What
//! happens on each accepted connection is up to its [`VtyProtocol`], either
//! [`telnet::TelnetProtocol`] or [`ssh::SshProtocol`].

pub mod host_key;
pub mod ssh;
pub mod telnet;

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use vtytousb_utils::{GatewayError, Result};

use crate::bridge::BridgeLink;
use crate::context::GatewayContext;

/// End-of-transmission, sent by Ctrl-D
pub const CTRL_D: u8 = 0x04;

/// Which protocol a VTY speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VtyKind {
    Telnet,
    Ssh,
}

impl fmt::Display for VtyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Telnet => f.write_str("TelnetVty"),
            Self::Ssh => f.write_str("SshVty"),
        }
    }
}

/// What to do with a chunk of client input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Send these bytes to the device
    Forward(Bytes),
    /// The client asked to disconnect
    Hangup,
    /// Nothing left after filtering
    Skip,
}

/// Per-connection protocol behaviour
#[async_trait]
pub trait VtyProtocol: Send + Sync {
    fn kind(&self) -> VtyKind;

    /// Translate client bytes into device input
    fn inbound(&self, data: &[u8]) -> Inbound;

    /// Translate device output into client bytes
    fn outbound(&self, data: &Bytes) -> Bytes;

    /// Run one accepted connection until the client leaves or `cancel` fires
    async fn serve(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        link: Arc<BridgeLink>,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Connection banner: device id, history size and a shared-port warning,
/// followed by the cached history itself
pub fn render_banner(id: &str, cache: &[u8], clients: usize) -> Vec<u8> {
    let mut text = format!("Connected to serial port {}.\n", id);
    if !cache.is_empty() {
        text.push_str(&format!("Showing previous {} bytes of output.\n", cache.len()));
    }
    if clients > 1 {
        text.push_str(&format!(
            "\nWarning: There are now {} clients connected to this port.\n",
            clients
        ));
    }

    let mut banner = text.replace('\n', "\r\n").into_bytes();
    banner.extend_from_slice(cache);
    banner
}

/// A listener for one bridge on one port
pub struct Vty {
    kind: VtyKind,
    port: u16,
    bridge_id: String,
    listening: bool,
    /// True while this instance holds `port` in the registry
    reserved: bool,
    ctx: Arc<GatewayContext>,
    cancel: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

impl Vty {
    /// Claim `port` and start accepting connections
    ///
    /// If another listener in this process already holds the port the
    /// returned instance does not listen; the same goes for an OS-level bind
    /// failure. Both cases are logged, not returned as errors.
    pub async fn start(
        ctx: Arc<GatewayContext>,
        protocol: Arc<dyn VtyProtocol>,
        link: Arc<BridgeLink>,
        port: u16,
    ) -> Self {
        let kind = protocol.kind();
        let mut vty = Self {
            kind,
            port,
            bridge_id: link.id().to_string(),
            listening: false,
            reserved: false,
            ctx: Arc::clone(&ctx),
            cancel: CancellationToken::new(),
            accept_task: None,
        };

        if !ctx.ports.reserve(port) {
            tracing::warn!(
                bridge = %vty.bridge_id,
                port,
                "{} not listening: port {} is already in use by this process",
                kind,
                port
            );
            return vty;
        }
        vty.reserved = true;

        match Self::bind(port).await {
            Ok(listener) => {
                vty.listening = true;
                vty.accept_task = Some(tokio::spawn(accept_loop(
                    listener,
                    protocol,
                    link,
                    vty.cancel.clone(),
                )));
                tracing::info!(bridge = %vty.bridge_id, port, "{} opened port {} -> {}", kind, port, vty.bridge_id);
            }
            Err(e) => {
                tracing::error!(bridge = %vty.bridge_id, port, error = %e, "{} not listening", kind);
            }
        }
        vty
    }

    async fn bind(port: u16) -> Result<TcpListener> {
        TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map_err(|e| GatewayError::Bind { port, source: e })
    }

    pub fn kind(&self) -> VtyKind {
        self.kind
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// False if the port collided or could not be bound
    pub fn listening(&self) -> bool {
        self.listening
    }

    /// Stop accepting, drop every connection and release the port
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        self.release();
        tracing::info!(bridge = %self.bridge_id, port = self.port, "{} closed port {}.", self.kind, self.port);
    }

    fn release(&mut self) {
        if self.reserved {
            self.ctx.ports.release(self.port);
            self.reserved = false;
        }
    }
}

impl Drop for Vty {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.release();
    }
}

impl fmt::Debug for Vty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vty")
            .field("kind", &self.kind)
            .field("port", &self.port)
            .field("bridge", &self.bridge_id)
            .field("listening", &self.listening)
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    protocol: Arc<dyn VtyProtocol>,
    link: Arc<BridgeLink>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        tracing::info!(bridge = %link.id(), %peer, "{} client connected", protocol.kind());
                        let protocol = Arc::clone(&protocol);
                        let link = Arc::clone(&link);
                        let child = cancel.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = protocol.serve(stream, peer, Arc::clone(&link), child).await {
                                tracing::debug!(bridge = %link.id(), %peer, error = %e, "Connection ended with error");
                            }
                            tracing::info!(bridge = %link.id(), %peer, "{} client disconnected", protocol.kind());
                        });
                    }
                    Err(e) => {
                        tracing::error!(bridge = %link.id(), error = %e, "Accept error");
                    }
                }
            }
        }
    }
}
