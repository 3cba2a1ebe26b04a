//! The rendezvous phase of a session.
//!
//! Created on the first packet bearing a new session key. Resolves the
//! upstream server, forwards the client's communication leg from a private
//! socket (so the upstream sees a source distinct from the client's
//! game-plane endpoint) and spawns the game connection once the client's
//! public endpoint is known.

use std::mem;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::ControlFlow;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::Config;
use crate::game_connection::{self, GameConnectionHandle};
use crate::packet::{self, SessionKey};
use crate::proxy::ProxyHandle;
use crate::public_address::PublicAddress;

/// Buffer for NatNeg-plane receives; twice the game-plane size.
const RECV_BUFFER_SIZE: usize = 1024;

const MAILBOX_SIZE: usize = 64;

pub(crate) enum Message {
    /// A packet for the upstream server arrived on the proxy socket.
    Packet { payload: Vec<u8>, from: SocketAddr },
    /// An `init` with sequence number 0 was seen: `client_public` is the
    /// client's public (game-plane) endpoint.
    PrepareGameConnection { client_public: SocketAddr },
}

/// Mailbox of a running initial phase, owned by the dispatcher's session map.
///
/// Dropping the handle aborts the task; a closed mailbox is the signal that
/// the session died on its own and the map entry can be replaced.
pub(crate) struct InitialPhaseHandle {
    messages: mpsc::Sender<Message>,
    task: JoinHandle<()>,
}

impl InitialPhaseHandle {
    pub(crate) fn spawn(
        key: SessionKey,
        config: Config,
        proxy: ProxyHandle,
        public_address: Arc<PublicAddress>,
    ) -> Self {
        let (messages, mailbox) = mpsc::channel(MAILBOX_SIZE);

        let task = tokio::spawn(async move {
            if let Err(e) = run(key, config, proxy, public_address, mailbox).await {
                tracing::warn!(%key, "Initial phase failed: {e:#}");
            }
        });

        Self { messages, task }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.messages.is_closed()
    }

    /// Posts `message` to the session's strand; `false` if the session is
    /// dead or its mailbox is full (UDP semantics, the datagram is lost).
    pub(crate) fn post(&self, message: Message) -> bool {
        self.messages.try_send(message).is_ok()
    }
}

impl Drop for InitialPhaseHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Packets can outpace both the resolver and the game connection; anything
/// that arrives too early is parked here and drained in arrival order.
enum Gate {
    Pending(Vec<(Vec<u8>, SocketAddr)>),
    Ready(GameConnectionHandle),
}

struct InitialPhase {
    key: SessionKey,
    config: Config,
    server: SocketAddr,
    /// The client's communication-leg endpoint, i.e. the reply-to address
    /// for packets the upstream sends to our communication socket.
    client_communication: Option<SocketAddr>,
    communication_socket: UdpSocket,
    game_connection: Gate,
    proxy: ProxyHandle,
    public_address: Arc<PublicAddress>,
}

async fn run(
    key: SessionKey,
    config: Config,
    proxy: ProxyHandle,
    public_address: Arc<PublicAddress>,
    mut mailbox: mpsc::Receiver<Message>,
) -> Result<()> {
    let idle_timeout = config.idle_timeout;
    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    // Everything posted to the mailbox while we resolve simply queues up;
    // it is drained in order once we enter the loop below.
    tracing::info!(%key, "Resolving server hostname `{}`", config.server_host);

    let server = match resolve_server(&config).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(%key, "Failed to resolve server hostname: {e:#}");

            // Stay registered until the idle timer reaps us, like any other
            // dead-end session.
            idle.as_mut().await;

            // Close the mailbox first so the dispatcher sees a dead session
            // when it processes the eviction.
            drop(mailbox);
            proxy.remove_session(key);
            return Ok(());
        }
    };

    tracing::info!(%key, %server, "Server hostname resolved");

    let communication_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .context("Failed to bind communication socket")?;

    let mut session = InitialPhase {
        key,
        config,
        server,
        client_communication: None,
        communication_socket,
        game_connection: Gate::Pending(Vec::new()),
        proxy,
        public_address,
    };

    let mut buf = [0u8; RECV_BUFFER_SIZE];

    loop {
        tokio::select! {
            () = idle.as_mut() => {
                tracing::info!(%key, "Idle timeout reached, closing session");
                break;
            }
            message = mailbox.recv() => {
                let Some(message) = message else {
                    // The dispatcher dropped us.
                    break;
                };

                if session.handle_message(message).await.is_break() {
                    break;
                }

                idle.as_mut().reset(Instant::now() + idle_timeout);
            }
            result = session.communication_socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, from)) => {
                        if len == buf.len() {
                            tracing::warn!(%key, "Received data may be truncated: {len}/{}", buf.len());
                        }

                        match session.handle_packet_from_server(&buf[..len], from) {
                            ControlFlow::Continue(extend) => {
                                if extend {
                                    idle.as_mut().reset(Instant::now() + idle_timeout);
                                }
                            }
                            ControlFlow::Break(()) => break,
                        }
                    }
                    Err(e) => tracing::error!(%key, "Receive on communication socket failed: {e}"),
                }
            }
        }
    }

    // Close the mailbox first so the dispatcher sees a dead session when it
    // processes the eviction.
    drop(mailbox);
    session.proxy.remove_session(key);

    Ok(())
}

async fn resolve_server(config: &Config) -> Result<SocketAddr> {
    let host = &config.server_host;
    let port = config.server_port;

    let server = tokio::net::lookup_host((host.as_str(), port))
        .await
        .with_context(|| format!("Failed to resolve `{host}:{port}`"))?
        .next()
        .with_context(|| format!("`{host}` resolved to no addresses"))?;

    Ok(server)
}

impl InitialPhase {
    async fn handle_message(&mut self, message: Message) -> ControlFlow<()> {
        match message {
            Message::Packet { payload, from } => self.handle_packet_to_server(payload, from).await,
            Message::PrepareGameConnection { client_public } => {
                self.prepare_game_connection(client_public).await
            }
        }
    }

    /// Creates the game connection unless one already exists, then drains
    /// every packet that queued up behind it.
    async fn prepare_game_connection(&mut self, client_public: SocketAddr) -> ControlFlow<()> {
        if let Gate::Ready(_) = &self.game_connection {
            return ControlFlow::Continue(());
        }

        let connection = GameConnectionHandle::spawn(
            self.key,
            self.server,
            client_public,
            self.config.idle_timeout,
            self.proxy.clone(),
            Arc::clone(&self.public_address),
        );

        let Gate::Pending(pending) =
            mem::replace(&mut self.game_connection, Gate::Ready(connection))
        else {
            return ControlFlow::Continue(());
        };

        for (payload, from) in pending {
            self.handle_packet_to_server(payload, from).await?;
        }

        ControlFlow::Continue(())
    }

    /// Routes a client packet: game-plane traffic goes to the game
    /// connection, everything else is the communication leg and is forwarded
    /// verbatim from our private socket.
    async fn handle_packet_to_server(
        &mut self,
        payload: Vec<u8>,
        from: SocketAddr,
    ) -> ControlFlow<()> {
        if !packet::is_natneg(&payload) {
            tracing::warn!(key = %self.key, "Packet to server is not NatNeg, discarded");
            return ControlFlow::Continue(());
        }

        match &mut self.game_connection {
            Gate::Pending(pending) => {
                tracing::debug!(key = %self.key, "No game connection yet, queueing packet");
                pending.push((payload, from));

                ControlFlow::Continue(())
            }
            Gate::Ready(connection) => {
                if connection.is_closed() {
                    tracing::warn!(key = %self.key, "Game connection expired, closing session");
                    return ControlFlow::Break(());
                }

                if from == connection.client_public_address() {
                    tracing::debug!(key = %self.key, %from, "Dispatching game-plane packet");

                    if !connection.post(game_connection::Message::PacketToServer { payload }) {
                        tracing::warn!(key = %self.key, "Game connection rejected packet, dropped");
                    }

                    return ControlFlow::Continue(());
                }

                tracing::debug!(key = %self.key, %from, "Updating client communication endpoint");
                self.client_communication = Some(from);

                if let Err(e) = self.communication_socket.send_to(&payload, self.server).await {
                    tracing::error!(key = %self.key, "Failed to send to server: {e}");
                }

                ControlFlow::Continue(())
            }
        }
    }

    /// A datagram on the communication socket. Only the resolved server may
    /// talk to us here; its packets are handed to the game connection, which
    /// owns the address rewriting.
    ///
    /// `Continue(true)` means the event counts towards liveness.
    fn handle_packet_from_server(
        &mut self,
        payload: &[u8],
        from: SocketAddr,
    ) -> ControlFlow<(), bool> {
        if from != self.server {
            tracing::warn!(key = %self.key, %from, "Packet is not from the server, discarded");
            return ControlFlow::Continue(false);
        }

        if !packet::is_natneg(payload) {
            tracing::warn!(key = %self.key, "Packet from server is not NatNeg, discarded");
            return ControlFlow::Continue(false);
        }

        let Gate::Ready(connection) = &self.game_connection else {
            tracing::warn!(key = %self.key, "Server spoke before the game connection exists, closing session");
            return ControlFlow::Break(());
        };

        if connection.is_closed() {
            tracing::warn!(key = %self.key, "Game connection expired, closing session");
            return ControlFlow::Break(());
        }

        let Some(communication_endpoint) = self.client_communication else {
            tracing::warn!(key = %self.key, "Client communication endpoint unknown, discarded");
            return ControlFlow::Continue(false);
        };

        let posted = connection.post(game_connection::Message::CommunicationPacketFromServer {
            payload: payload.to_vec(),
            communication_endpoint,
        });
        if !posted {
            tracing::warn!(key = %self.key, "Game connection rejected packet, dropped");
        }

        ControlFlow::Continue(true)
    }
}
