//! Network module - Handles TCP/UDP communication between clients and the hub
//!
//! Provides:
//! - Stream and datagram listeners dispatching decoded messages
//! - Connection handles for writing back to a client on either transport
//! - A client for logging in, heartbeating and receiving notifications

mod server;
mod client;
mod connection;

pub use server::*;
pub use client::*;
pub use connection::*;

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Transport carrying the wire protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Reliable byte stream, one connection per client
    #[default]
    Tcp,
    /// Datagrams over one shared server socket
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
        }
    }
}

/// Fill in a host for addresses given as `:port`
pub fn with_default_host(addr: &str, host: &str) -> String {
    if addr.starts_with(':') {
        format!("{}{}", host, addr)
    } else {
        addr.to_string()
    }
}

/// Resolve an address string to a socket address
pub async fn resolve_addr(addr: &str) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let mut addrs = lookup_host(addr).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve address: {}", addr),
        )
    })
}
