#![cfg_attr(test, allow(clippy::unwrap_used))]

mod game_connection;
mod initial_phase;

pub mod packet;
pub mod proxy;
pub mod public_address;

pub use packet::{MalformedPacket, NatNegId, PlayerId, SessionKey, Step};
pub use proxy::Proxy;
pub use public_address::PublicAddress;

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Hostname of the NatNeg rendezvous server we proxy for.
pub const DEFAULT_SERVER_HOST: &str = "natneg.server.cnc-online.net";

/// UDP port of the upstream server, also the default port we listen on.
pub const DEFAULT_PORT: u16 = 27901;

/// How long a session may sit without traffic before it is reaped.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Runtime settings of the proxy.
#[derive(Debug, Clone)]
pub struct Config {
    /// Where to bind the server-facing UDP socket.
    pub listen_addr: SocketAddr,
    /// Hostname of the upstream NatNeg server, resolved once per session.
    pub server_host: String,
    pub server_port: u16,
    pub idle_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            server_host: DEFAULT_SERVER_HOST.to_owned(),
            server_port: DEFAULT_PORT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}
