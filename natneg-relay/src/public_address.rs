//! Discovery of the proxy's externally visible IPv4 address.
//!
//! The address ends up inside rewritten NatNeg packets, so it has to be the
//! one remote peers can actually reach, not whatever we are bound to locally.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use parking_lot::Mutex;

/// Default "what is my IP" endpoint.
///
/// The response body is an IPv4 literal, possibly with trailing whitespace.
pub const DEFAULT_DISCOVERY_URL: &str = "http://api.ipify.org/";

const REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// The most recently observed public IPv4 address of this host.
///
/// Reads are address-sized and happen on every rewritten packet from any
/// session, so a plain mutex is enough; writes only show up once a minute.
#[derive(Debug)]
pub struct PublicAddress {
    current: Mutex<Ipv4Addr>,
}

impl Default for PublicAddress {
    fn default() -> Self {
        Self::new()
    }
}

impl PublicAddress {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(Ipv4Addr::UNSPECIFIED),
        }
    }

    pub fn current(&self) -> Ipv4Addr {
        *self.current.lock()
    }

    pub fn set(&self, address: Ipv4Addr) {
        *self.current.lock() = address;

        tracing::info!(%address, "Public address updated");
    }

    /// Rewrites `endpoint` so that its address is the public one; the port is
    /// preserved.
    pub fn to_public(&self, endpoint: SocketAddr) -> SocketAddrV4 {
        SocketAddrV4::new(self.current(), endpoint.port())
    }
}

/// Periodically refreshes `address` from the discovery endpoint.
///
/// Failures are recoverable: the previous value is retained and the next
/// attempt happens a minute later regardless.
pub async fn refresh_task(address: Arc<PublicAddress>, discovery_url: String) {
    let client = match reqwest::Client::builder().timeout(HTTP_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            tracing::error!("Failed to construct HTTP client: {e:#}");
            return;
        }
    };

    loop {
        match fetch_public_ip(&client, &discovery_url).await {
            Ok(ip) => address.set(ip),
            Err(e) => tracing::error!("Failed to refresh public address: {e:#}"),
        }

        tokio::time::sleep(REFRESH_INTERVAL).await;
    }
}

async fn fetch_public_ip(client: &reqwest::Client, url: &str) -> Result<Ipv4Addr> {
    let body = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to GET `{url}`"))?
        .text()
        .await
        .context("Failed to read response body")?;

    let ip = body
        .trim()
        .parse::<Ipv4Addr>()
        .with_context(|| format!("`{}` is not an IPv4 address", body.trim()))?;

    Ok(ip)
}
