//! Local proxy relay that reaches the internet through a phone.
//!
//! `tether-relay` accepts browser proxy connections on a loopback port and
//! carries each one through a forwarded TCP tunnel to a SOCKS5 proxy running
//! on the phone. The browser may speak SOCKS5 or HTTP; the upstream leg is
//! always SOCKS5.
//!
//! # Architecture
//!
//! ```text
//! Browser
//!    |
//!    | SOCKS5 or HTTP proxy protocol
//!    v
//! tether-relay (127.0.0.1:LISTEN_PORT)
//!    |
//!    +-- SOCKS5 session: greeting, CONNECT request, reply
//!    +-- HTTP session:   CONNECT tunnel or request-line rewrite
//!    |
//!    | SOCKS5 CONNECT
//!    v
//! Forwarded tunnel (127.0.0.1:TUNNEL_PORT)
//!    |
//!    v
//! Phone proxy (REMOTE_PORT) --> internet
//! ```
//!
//! # Components
//!
//! - [`RelayManager`]: Lifecycle owner (start/stop/restart, status, events)
//! - [`RelayServer`]: One bound listener plus its live connections
//! - [`socks5`]: RFC 1928 codec shared by both sides of the relay
//! - [`RelayEvent`]: Started/Stopped/Connection/Error notifications
//!
//! # Usage
//!
//! ```ignore
//! use tether_relay::{Protocol, RelayConfig, RelayManager};
//!
//! let manager = RelayManager::new();
//! let config = manager
//!     .start(RelayConfig::with_protocol(Protocol::Http))
//!     .await?;
//! println!("proxy at {}", config.proxy_url());
//! manager.stop().await?;
//! ```
//!
//! # Security Model
//!
//! - Binds to `127.0.0.1` only
//! - No client authentication; the loopback binding is the boundary

mod config;
mod connection;
mod events;
mod http;
mod manager;
mod server;
pub mod socks5;
mod socks_session;

pub use config::{
    Protocol, RelayConfig, UpstreamHandshake, DEFAULT_LISTEN_PORT, DEFAULT_REMOTE_PORT,
    DEFAULT_TUNNEL_PORT,
};
pub use events::{EventBus, RelayEvent, Subscription};
pub use manager::{RelayManager, RelayState, RelayStatus};
pub use server::{RelayHandle, RelayServer};
pub use socks5::TargetAddr;

use std::net::SocketAddr;

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can occur in relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Failed to bind the listener.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Could not reach the forwarded tunnel.
    #[error("Tunnel connection to {addr} failed: {source}")]
    TunnelConnect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The phone-side proxy answered CONNECT with a non-zero reply code.
    #[error("Upstream proxy rejected {target} with reply code {code}")]
    UpstreamRejected { target: TargetAddr, code: u8 },

    /// A bounded phase did not finish in time.
    #[error("Timed out during {0}")]
    Timeout(&'static str),

    /// Client sent something the relay cannot serve.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Malformed SOCKS5 request from the client.
    #[error(transparent)]
    Socks(#[from] socks5::RequestError),

    /// Unknown protocol name.
    #[error("Invalid protocol {0:?} (expected \"socks5\" or \"http\")")]
    InvalidProtocol(String),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Socket I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
pub(crate) mod test_support;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_error_display_bind() {
        let addr: SocketAddr = "127.0.0.1:7890".parse().unwrap();
        let err = RelayError::Bind {
            addr,
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(err.to_string().contains("127.0.0.1:7890"));
    }

    #[test]
    fn test_relay_error_display_rejected() {
        let err = RelayError::UpstreamRejected {
            target: TargetAddr::Domain("example.com".to_string(), 443),
            code: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("example.com:443"));
        assert!(msg.contains('5'));
    }

    #[test]
    fn test_relay_error_display_invalid_protocol() {
        let err = "ftp".parse::<Protocol>().unwrap_err();
        assert!(err.to_string().contains("ftp"));
    }
}
