//! The game-connection phase of a session.
//!
//! Once the hidden client's public endpoint is known, the relay impersonates
//! both ends of the hole-punch: `public_socket_for_client` speaks to the
//! upstream server and the true remote peer, while `fake_remote_player_socket`
//! plays the remote peer towards the hidden client. The fake socket's public
//! endpoint is what gets written into forwarded `connect` packets, so the
//! client punches towards us instead of towards the unreachable remote.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::packet::{self, MalformedPacket, SessionKey};
use crate::proxy::ProxyHandle;
use crate::public_address::PublicAddress;

/// Buffer for game-plane receives.
///
/// Deliberately smaller than the 1024 bytes used on the NatNeg plane; game
/// traffic is tiny and a full buffer is logged as possibly truncated.
const RECV_BUFFER_SIZE: usize = 512;

const MAILBOX_SIZE: usize = 64;

pub(crate) enum Message {
    /// A game-plane packet from the hidden client, to be forwarded upstream.
    PacketToServer { payload: Vec<u8> },
    /// A packet the upstream server sent to the session's communication
    /// socket; `communication_endpoint` is the client's reply-to address on
    /// the proxy's well-known socket.
    CommunicationPacketFromServer {
        payload: Vec<u8>,
        communication_endpoint: SocketAddr,
    },
}

/// Mailbox of a running game connection.
///
/// Deliberately does not abort the task on drop: the connection is kept alive
/// by its own idle timer and keeps relaying after the initial phase is gone.
pub(crate) struct GameConnectionHandle {
    client_public_address: SocketAddr,
    messages: mpsc::Sender<Message>,
}

impl GameConnectionHandle {
    pub(crate) fn spawn(
        key: SessionKey,
        server: SocketAddr,
        client_public_address: SocketAddr,
        idle_timeout: Duration,
        proxy: ProxyHandle,
        public_address: Arc<PublicAddress>,
    ) -> Self {
        let (messages, mailbox) = mpsc::channel(MAILBOX_SIZE);

        tokio::spawn(async move {
            if let Err(e) = run(
                key,
                server,
                client_public_address,
                idle_timeout,
                proxy,
                public_address,
                mailbox,
            )
            .await
            {
                tracing::warn!(%key, "Game connection failed: {e:#}");
            }
        });

        Self {
            client_public_address,
            messages,
        }
    }

    pub(crate) fn client_public_address(&self) -> SocketAddr {
        self.client_public_address
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.messages.is_closed()
    }

    /// Posts `message` to the connection's strand; `false` if the connection
    /// is dead or its mailbox is full (UDP semantics, the datagram is lost).
    pub(crate) fn post(&self, message: Message) -> bool {
        self.messages.try_send(message).is_ok()
    }
}

struct GameConnection {
    key: SessionKey,
    server: SocketAddr,
    /// Fixed at creation; the dispatcher compares packet sources against it.
    client_public_address: SocketAddr,
    /// Where relayed peer traffic is actually sent; follows NAT rebinding.
    client_real_address: SocketAddr,
    /// The true remote peer, learned from `connect` packets and overwritten
    /// if real traffic shows up from elsewhere.
    remote_player: Option<SocketAddr>,
    public_socket_for_client: UdpSocket,
    fake_remote_player_socket: UdpSocket,
    proxy: ProxyHandle,
    public_address: Arc<PublicAddress>,
}

#[allow(clippy::too_many_arguments)]
async fn run(
    key: SessionKey,
    server: SocketAddr,
    client_public_address: SocketAddr,
    idle_timeout: Duration,
    proxy: ProxyHandle,
    public_address: Arc<PublicAddress>,
    mut mailbox: mpsc::Receiver<Message>,
) -> Result<()> {
    let public_socket_for_client = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .context("Failed to bind game-plane socket")?;
    let fake_remote_player_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .context("Failed to bind fake remote player socket")?;

    tracing::info!(%key, client = %client_public_address, "New game connection");

    let mut session = GameConnection {
        key,
        server,
        client_public_address,
        client_real_address: client_public_address,
        remote_player: None,
        public_socket_for_client,
        fake_remote_player_socket,
        proxy,
        public_address,
    };

    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    // Not received on until the first address rewrite arms it for the
    // impending hole-punch.
    let mut fake_socket_armed = false;
    let mut mailbox_open = true;

    let mut public_buf = [0u8; RECV_BUFFER_SIZE];
    let mut fake_buf = [0u8; RECV_BUFFER_SIZE];

    loop {
        tokio::select! {
            () = idle.as_mut() => {
                tracing::info!(%key, "Timeout reached, closing game connection");
                return Ok(());
            }
            message = mailbox.recv(), if mailbox_open => {
                let Some(message) = message else {
                    // The initial phase died first; we keep relaying on our
                    // own timer.
                    mailbox_open = false;
                    continue;
                };

                match message {
                    Message::PacketToServer { payload } => {
                        session.handle_packet_to_server(&payload).await;
                    }
                    Message::CommunicationPacketFromServer { payload, communication_endpoint } => {
                        fake_socket_armed |= session
                            .handle_communication_packet_from_server(payload, communication_endpoint);
                    }
                }

                idle.as_mut().reset(Instant::now() + idle_timeout);
            }
            result = session.public_socket_for_client.recv_from(&mut public_buf) => {
                match result {
                    Ok((len, from)) => {
                        if len == public_buf.len() {
                            tracing::warn!(%key, "Received data may be truncated: {len}/{}", public_buf.len());
                        }

                        session.handle_public_socket_packet(&public_buf[..len], from).await;
                        idle.as_mut().reset(Instant::now() + idle_timeout);
                    }
                    Err(e) => tracing::error!(%key, "Receive on game-plane socket failed: {e}"),
                }
            }
            result = session.fake_remote_player_socket.recv_from(&mut fake_buf), if fake_socket_armed => {
                match result {
                    Ok((len, from)) => {
                        if len == fake_buf.len() {
                            tracing::warn!(%key, "Received data may be truncated: {len}/{}", fake_buf.len());
                        }

                        session.handle_fake_socket_packet(&fake_buf[..len], from).await;
                        idle.as_mut().reset(Instant::now() + idle_timeout);
                    }
                    Err(e) => tracing::error!(%key, "Receive on fake remote player socket failed: {e}"),
                }
            }
        }
    }
}

impl GameConnection {
    /// Game-plane traffic from the hidden client, sent onwards so the
    /// upstream sees our public game socket as its source.
    async fn handle_packet_to_server(&mut self, payload: &[u8]) {
        if !packet::is_natneg(payload) {
            tracing::warn!(key = %self.key, "Packet to server is not NatNeg, discarded");
            return;
        }

        tracing::debug!(key = %self.key, step = %packet::step(payload), "Forwarding game-plane packet to server");

        if let Err(e) = self
            .public_socket_for_client
            .send_to(payload, self.server)
            .await
        {
            tracing::error!(key = %self.key, "Failed to send to server: {e}");
        }
    }

    /// A server packet for the client's communication leg. If it embeds the
    /// remote peer's address we substitute our fake socket's public endpoint
    /// before passing it on; either way it leaves through the dispatcher so
    /// the client sees the proxy's well-known port as its source.
    ///
    /// Returns whether the fake socket should be armed.
    fn handle_communication_packet_from_server(
        &mut self,
        mut payload: Vec<u8>,
        communication_endpoint: SocketAddr,
    ) -> bool {
        let step = packet::step(&payload);
        let mut armed = false;

        if let Some(offset) = packet::address_offset(step) {
            let local_endpoint = match self.fake_remote_player_socket.local_addr() {
                Ok(local_endpoint) => local_endpoint,
                Err(e) => {
                    tracing::error!(key = %self.key, "Failed to read fake socket endpoint: {e}");
                    return false;
                }
            };
            let public_endpoint = self.public_address.to_public(local_endpoint);

            match rewrite_embedded_address(&mut payload, offset, public_endpoint) {
                Ok(remote_player) => {
                    self.remote_player = Some(remote_player);

                    tracing::debug!(
                        key = %self.key,
                        remote = %remote_player,
                        rewritten = %public_endpoint,
                        "Rewrote embedded remote player address"
                    );

                    // Arm the peer-impersonation socket for the impending
                    // hole-punch.
                    armed = true;
                }
                Err(e) => {
                    tracing::warn!(key = %self.key, %step, "Malformed packet, discarded: {e}");
                    return false;
                }
            }
        }

        self.proxy
            .send_from_proxy_socket(payload, communication_endpoint);

        armed
    }

    /// Traffic arriving on the public game socket: either a NatNeg reply from
    /// the server or a game packet from the remote peer.
    async fn handle_public_socket_packet(&mut self, payload: &[u8], from: SocketAddr) {
        if from == self.server {
            // The client only trusts the proxy's well-known port for server
            // traffic, so this must not leave through our game socket.
            self.proxy
                .send_from_proxy_socket(payload.to_vec(), self.client_public_address);
            return;
        }

        if self.remote_player != Some(from) {
            tracing::warn!(
                key = %self.key,
                old = ?self.remote_player,
                new = %from,
                "Updating remote player address"
            );
            self.remote_player = Some(from);
        }

        if let Err(e) = self
            .fake_remote_player_socket
            .send_to(payload, self.client_real_address)
            .await
        {
            tracing::error!(key = %self.key, "Failed to relay to client: {e}");
        }
    }

    /// Traffic from the hidden client to the impersonated remote peer.
    async fn handle_fake_socket_packet(&mut self, payload: &[u8], from: SocketAddr) {
        if from != self.client_real_address {
            tracing::warn!(
                key = %self.key,
                old = %self.client_real_address,
                new = %from,
                "Updating client address"
            );
            self.client_real_address = from;
        }

        let Some(remote_player) = self.remote_player else {
            tracing::warn!(key = %self.key, "Remote player not yet known, discarding datagram");
            return;
        };

        if let Err(e) = self
            .public_socket_for_client
            .send_to(payload, remote_player)
            .await
        {
            tracing::error!(key = %self.key, "Failed to relay to remote player: {e}");
        }
    }
}

/// Parses the remote player's embedded endpoint and overwrites it with
/// `public_endpoint` in place.
fn rewrite_embedded_address(
    payload: &mut [u8],
    offset: usize,
    public_endpoint: SocketAddrV4,
) -> Result<SocketAddr, MalformedPacket> {
    let (ip, port) = packet::parse_address(payload, offset)?;

    packet::rewrite_address(
        payload,
        offset,
        *public_endpoint.ip(),
        public_endpoint.port(),
    )?;

    Ok(SocketAddr::from((ip, port)))
}
