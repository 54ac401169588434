//! SSH front-end
//!
//! Each accepted TCP connection runs its own russh server session. Only
//! shell channels are bridged; every shell channel is one attached client.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodSet};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use vtytousb_utils::{GatewayError, Result};

use super::host_key::HostKey;
use super::{Inbound, VtyKind, VtyProtocol, CTRL_D};
use crate::bridge::{BridgeLink, BusEvent, ClientGuard, ClientOutput};
use crate::config::{AppConfig, BridgeConfig};
use crate::events::EventSubscriber;

/// User that authenticates with the gateway-wide root password
pub const ROOT_USER: &str = "root";

/// Server settings shared by every SSH listener
pub fn server_config(host_key: &HostKey) -> Result<server::Config> {
    Ok(server::Config {
        keys: vec![host_key.to_key_pair()?],
        methods: MethodSet::PASSWORD | MethodSet::NONE,
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::ZERO),
        ..Default::default()
    })
}

/// One authentication attempt as presented by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAttempt<'a> {
    None { user: &'a str },
    Password { user: &'a str, password: &'a str },
}

/// Decide an authentication attempt
///
/// An empty root password or an empty device password opens the port to
/// anyone. Otherwise only a password matching `root`/root password or the
/// device's own user/password is accepted.
pub fn authorize(app: &AppConfig, bridge: &BridgeConfig, attempt: AuthAttempt<'_>) -> bool {
    if app.ssh_root_password.is_empty() || bridge.ssh_password.is_empty() {
        return true;
    }
    match attempt {
        AuthAttempt::None { .. } => false,
        AuthAttempt::Password { user, password } => {
            (user == ROOT_USER && password == app.ssh_root_password)
                || (user == bridge.ssh_user && password == bridge.ssh_password)
        }
    }
}

/// SSH protocol bound to the process host key
#[derive(Clone)]
pub struct SshProtocol {
    config: Arc<server::Config>,
}

impl SshProtocol {
    pub fn new(config: Arc<server::Config>) -> Self {
        Self { config }
    }
}

impl std::fmt::Debug for SshProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshProtocol").finish_non_exhaustive()
    }
}

#[async_trait]
impl VtyProtocol for SshProtocol {
    fn kind(&self) -> VtyKind {
        VtyKind::Ssh
    }

    fn inbound(&self, data: &[u8]) -> Inbound {
        match data {
            [] => Inbound::Skip,
            [CTRL_D] => Inbound::Hangup,
            _ => Inbound::Forward(Bytes::copy_from_slice(data)),
        }
    }

    fn outbound(&self, data: &Bytes) -> Bytes {
        data.clone()
    }

    async fn serve(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        link: Arc<BridgeLink>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let handler = SshConnection::new(self.clone(), link, peer);
        let session = server::run_stream(Arc::clone(&self.config), stream, handler)
            .await
            .map_err(|e| GatewayError::ssh(e.to_string()))?;

        tokio::select! {
            result = session => result.map_err(|e| GatewayError::ssh(e.to_string())),
            _ = cancel.cancelled() => Ok(()),
        }
    }
}

/// A bridged shell channel
struct ShellChannel {
    _client: ClientGuard,
    _subscription: EventSubscriber<BusEvent, Bytes>,
    forwarder: JoinHandle<()>,
}

impl Drop for ShellChannel {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// russh handler for one TCP connection
struct SshConnection {
    protocol: SshProtocol,
    link: Arc<BridgeLink>,
    peer: SocketAddr,
    shells: HashMap<ChannelId, ShellChannel>,
}

impl SshConnection {
    fn new(protocol: SshProtocol, link: Arc<BridgeLink>, peer: SocketAddr) -> Self {
        Self {
            protocol,
            link,
            peer,
            shells: HashMap::new(),
        }
    }

    fn decide(&self, attempt: AuthAttempt<'_>) -> Auth {
        let app = self.link.app_config();
        let bridge = self.link.config();
        if authorize(&app, &bridge, attempt) {
            tracing::debug!(bridge = %self.link.id(), peer = %self.peer, "SSH auth accepted");
            Auth::Accept
        } else {
            tracing::debug!(bridge = %self.link.id(), peer = %self.peer, "SSH auth rejected");
            Auth::Reject {
                proceed_with_methods: Some(MethodSet::PASSWORD),
            }
        }
    }
}

#[async_trait]
impl server::Handler for SshConnection {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> std::result::Result<Auth, Self::Error> {
        Ok(self.decide(AuthAttempt::None { user }))
    }

    async fn auth_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> std::result::Result<Auth, Self::Error> {
        Ok(self.decide(AuthAttempt::Password { user, password }))
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        session.channel_success(channel);
        if self.shells.contains_key(&channel) {
            return Ok(());
        }

        let client = self.link.attach();
        let ClientOutput {
            banner,
            mut rx,
            subscription,
        } = self.link.open_output();
        session.data(channel, CryptoVec::from_slice(&banner));

        let handle = session.handle();
        let protocol = self.protocol.clone();
        let bridge = self.link.id().to_string();
        let peer = self.peer;
        let forwarder = tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                let out = protocol.outbound(&data);
                if handle.data(channel, CryptoVec::from_slice(&out)).await.is_err() {
                    return;
                }
            }
            // Feed cut for falling behind
            tracing::info!(%bridge, %peer, "Closing stalled SSH channel");
            let _ = handle.close(channel).await;
        });

        self.shells.insert(
            channel,
            ShellChannel {
                _client: client,
                _subscription: subscription,
                forwarder,
            },
        );
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if !self.shells.contains_key(&channel) {
            return Ok(());
        }
        match self.protocol.inbound(data) {
            Inbound::Forward(bytes) => self.link.send_to_device(bytes),
            Inbound::Hangup => {
                tracing::debug!(bridge = %self.link.id(), peer = %self.peer, "SSH client sent Ctrl-D");
                self.shells.remove(&channel);
                session.eof(channel);
                session.close(channel);
            }
            Inbound::Skip => {}
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        self.shells.remove(&channel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configs(root: &str, user: &str, password: &str) -> (AppConfig, BridgeConfig) {
        let app = AppConfig {
            ssh_root_password: root.into(),
            ..AppConfig::default()
        };
        let bridge = BridgeConfig {
            ssh_user: user.into(),
            ssh_password: password.into(),
            ..BridgeConfig::from_app(&app)
        };
        (app, bridge)
    }

    // ==================== Authorization Tests ====================

    #[test]
    fn test_root_password_accepted() {
        let (app, bridge) = configs("rootpw", "user", "userpw");
        assert!(authorize(
            &app,
            &bridge,
            AuthAttempt::Password {
                user: "root",
                password: "rootpw"
            }
        ));
    }

    #[test]
    fn test_bridge_user_accepted() {
        let (app, bridge) = configs("rootpw", "admin", "userpw");
        assert!(authorize(
            &app,
            &bridge,
            AuthAttempt::Password {
                user: "admin",
                password: "userpw"
            }
        ));
    }

    #[test]
    fn test_mismatched_pairs_rejected() {
        let (app, bridge) = configs("rootpw", "admin", "userpw");
        for (user, password) in [
            ("root", "userpw"),
            ("admin", "rootpw"),
            ("admin", ""),
            ("someone", "userpw"),
        ] {
            assert!(
                !authorize(&app, &bridge, AuthAttempt::Password { user, password }),
                "{}:{} should be rejected",
                user,
                password
            );
        }
    }

    #[test]
    fn test_none_rejected_when_protected() {
        let (app, bridge) = configs("rootpw", "admin", "userpw");
        assert!(!authorize(&app, &bridge, AuthAttempt::None { user: "root" }));
    }

    #[test]
    fn test_empty_root_password_opens_access() {
        let (app, bridge) = configs("", "admin", "userpw");
        assert!(authorize(&app, &bridge, AuthAttempt::None { user: "anyone" }));
        assert!(authorize(
            &app,
            &bridge,
            AuthAttempt::Password {
                user: "x",
                password: "y"
            }
        ));
    }

    #[test]
    fn test_empty_bridge_password_opens_access() {
        let (app, bridge) = configs("rootpw", "admin", "");
        assert!(authorize(&app, &bridge, AuthAttempt::None { user: "anyone" }));
    }

    // ==================== Filter Tests ====================

    fn protocol() -> SshProtocol {
        SshProtocol::new(Arc::new(server::Config::default()))
    }

    #[test]
    fn test_inbound_passes_nul() {
        assert_eq!(
            protocol().inbound(b"a\0b"),
            Inbound::Forward(Bytes::from_static(b"a\0b"))
        );
    }

    #[test]
    fn test_inbound_ctrl_d_hangs_up() {
        assert_eq!(protocol().inbound(&[CTRL_D]), Inbound::Hangup);
        assert_eq!(protocol().inbound(&[]), Inbound::Skip);
    }

    #[test]
    fn test_outbound_unfiltered() {
        let data = Bytes::from_static(&[0xFF, 0x00, b'x']);
        assert_eq!(protocol().outbound(&data), data);
    }

    #[test]
    fn test_server_config_offers_password_and_none() {
        let key = crate::testing::host_key();
        let config = server_config(key).unwrap();
        assert!(config.methods.contains(MethodSet::PASSWORD));
        assert!(config.methods.contains(MethodSet::NONE));
        assert_eq!(config.keys.len(), 1);
    }
}
