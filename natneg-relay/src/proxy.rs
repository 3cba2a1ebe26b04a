//! The dispatcher owning the server-facing UDP socket.
//!
//! All client traffic enters here, keyed by the session key embedded in each
//! packet, and every reply that must appear to come from the proxy's
//! well-known port leaves here. The dispatcher task is the only place that
//! touches the session map or writes to the socket.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::Level;

use crate::Config;
use crate::initial_phase::{self, InitialPhaseHandle};
use crate::packet::{self, INIT_SEQ_CLIENT_PUBLIC, INIT_SEQUENCE_NUMBER_OFFSET, SessionKey, Step};
use crate::public_address::PublicAddress;

/// Buffer for NatNeg-plane receives; twice the game-plane size.
const RECV_BUFFER_SIZE: usize = 1024;

/// Commands are small and sessions only produce them in response to
/// datagrams, so this never fills up under sane load; overflow is dropped
/// with a log, like any other UDP loss.
const COMMAND_CHANNEL_SIZE: usize = 1024;

pub(crate) enum Command {
    /// Send `payload` from the well-known socket.
    SendFromProxySocket {
        payload: Vec<u8>,
        recipient: SocketAddr,
    },
    /// Evict `key` from the session map; posted by a session at the end of
    /// its life.
    RemoveSession { key: SessionKey },
}

/// The sessions' way back into the dispatcher strand.
#[derive(Clone)]
pub(crate) struct ProxyHandle {
    commands: mpsc::Sender<Command>,
}

impl ProxyHandle {
    pub(crate) fn send_from_proxy_socket(&self, payload: Vec<u8>, recipient: SocketAddr) {
        self.post(Command::SendFromProxySocket { payload, recipient });
    }

    pub(crate) fn remove_session(&self, key: SessionKey) {
        self.post(Command::RemoveSession { key });
    }

    fn post(&self, command: Command) {
        if self.commands.try_send(command).is_err() {
            tracing::warn!("Dispatcher not accepting commands, dropped");
        }
    }
}

/// The NatNeg proxy dispatcher.
pub struct Proxy {
    socket: UdpSocket,
    sessions: HashMap<SessionKey, InitialPhaseHandle>,
    commands: mpsc::Receiver<Command>,
    handle: ProxyHandle,
    config: Config,
    public_address: Arc<PublicAddress>,
}

impl Proxy {
    pub async fn bind(config: Config, public_address: Arc<PublicAddress>) -> Result<Self> {
        let socket = UdpSocket::bind(config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", config.listen_addr))?;

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);

        Ok(Self {
            socket,
            sessions: HashMap::new(),
            commands: commands_rx,
            handle: ProxyHandle {
                commands: commands_tx,
            },
            config,
            public_address,
        })
    }

    /// The bound address of the well-known socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let addr = self.socket.local_addr()?;

        Ok(addr)
    }

    /// Runs the dispatcher until the process ends.
    pub async fn run(mut self) -> Result<Infallible> {
        let mut buf = [0u8; RECV_BUFFER_SIZE];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => {
                            if tracing::enabled!(target: "wire", Level::TRACE) {
                                let hex_bytes = hex::encode(&buf[..len]);
                                tracing::trace!(target: "wire", r#"Input::Client("{from}","{hex_bytes}")"#);
                            }

                            if len == buf.len() {
                                tracing::warn!("Received data may be truncated: {len}/{}", buf.len());
                            }

                            self.handle_packet_to_server(&buf[..len], from);
                        }
                        Err(e) => tracing::error!("Receive on proxy socket failed: {e}"),
                    }
                }
                Some(command) = self.commands.recv() => match command {
                    Command::SendFromProxySocket { payload, recipient } => {
                        if tracing::enabled!(target: "wire", Level::TRACE) {
                            let hex_bytes = hex::encode(&payload);
                            tracing::trace!(target: "wire", r#"Output::SendMessage("{recipient}","{hex_bytes}")"#);
                        }

                        if let Err(e) = self.socket.send_to(&payload, recipient).await {
                            tracing::error!(%recipient, "Failed to send from proxy socket: {e}");
                        }
                    }
                    Command::RemoveSession { key } => {
                        // The entry may already hold a replacement session;
                        // only reap it if it is actually dead.
                        if self.sessions.get(&key).is_some_and(|session| session.is_closed()) {
                            self.sessions.remove(&key);
                            tracing::info!(%key, "Session removed");
                        }
                    }
                },
            }
        }
    }

    fn handle_packet_to_server(&mut self, payload: &[u8], from: SocketAddr) {
        if !packet::is_natneg(payload) {
            tracing::warn!(%from, "Packet is not NatNeg, discarded");
            return;
        }

        let step = packet::step(payload);

        let key = match packet::session_key(payload) {
            Ok(Some(key)) => key,
            Ok(None) => {
                tracing::info!(%step, "Packet has no session key, discarded");
                return;
            }
            Err(e) => {
                tracing::warn!(%from, %step, "Malformed packet, discarded: {e}");
                return;
            }
        };

        let session = self.sessions.entry(key).or_insert_with(|| {
            tracing::info!(%key, "New session");

            InitialPhaseHandle::spawn(
                key,
                self.config.clone(),
                self.handle.clone(),
                Arc::clone(&self.public_address),
            )
        });

        if session.is_closed() {
            // The entry outlived its session; replace it.
            tracing::info!(%key, "Replacing dead session");

            *session = InitialPhaseHandle::spawn(
                key,
                self.config.clone(),
                self.handle.clone(),
                Arc::clone(&self.public_address),
            );
        }

        let mut posted = true;

        if step == Step::Init
            && payload.get(INIT_SEQUENCE_NUMBER_OFFSET) == Some(&INIT_SEQ_CLIENT_PUBLIC)
        {
            // The one moment at which the hidden client's public endpoint is
            // learned.
            tracing::info!(%key, client = %from, "Init from client public address");

            posted &= session.post(initial_phase::Message::PrepareGameConnection {
                client_public: from,
            });
        }

        posted &= session.post(initial_phase::Message::Packet {
            payload: payload.to_vec(),
            from,
        });

        if !posted {
            tracing::warn!(%key, "Session rejected packet, evicting");
            self.sessions.remove(&key);
        }
    }
}
