//! Relay configuration.
//!
//! A [`RelayConfig`] is fixed for the lifetime of one relay run. Changing any
//! field means a full stop/start cycle through [`crate::RelayManager`].

use crate::RelayError;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

/// Default port the browser connects to.
pub const DEFAULT_LISTEN_PORT: u16 = 7890;

/// Default local port of the forwarded tunnel.
pub const DEFAULT_TUNNEL_PORT: u16 = 7891;

/// Default port of the proxy listening on the phone.
pub const DEFAULT_REMOTE_PORT: u16 = 7890;

/// Client-facing protocol spoken by the relay.
///
/// Both flavors speak SOCKS5 on the upstream leg.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// RFC 1928 SOCKS5, CONNECT only, no authentication.
    #[default]
    Socks5,
    /// HTTP proxying: absolute/relative-form requests plus `CONNECT`.
    Http,
}

impl Protocol {
    /// Lowercase name, also used as the proxy URL scheme.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Socks5 => "socks5",
            Protocol::Http => "http",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "socks5" => Ok(Protocol::Socks5),
            "http" => Ok(Protocol::Http),
            other => Err(RelayError::InvalidProtocol(other.to_string())),
        }
    }
}

/// How the relay opens a SOCKS5 session with the phone-side proxy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum UpstreamHandshake {
    /// Write the CONNECT request as the very first bytes, with no method
    /// negotiation. Proxies such as Clash accept this.
    #[default]
    Direct,
    /// Full RFC 1928 exchange: `[5,1,0]` greeting, expect `[5,0]`, then CONNECT.
    Negotiate,
}

impl UpstreamHandshake {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamHandshake::Direct => "direct",
            UpstreamHandshake::Negotiate => "negotiate",
        }
    }
}

impl fmt::Display for UpstreamHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpstreamHandshake {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(UpstreamHandshake::Direct),
            "negotiate" => Ok(UpstreamHandshake::Negotiate),
            other => Err(RelayError::Config(format!(
                "unknown upstream handshake {other:?} (expected \"direct\" or \"negotiate\")"
            ))),
        }
    }
}

/// Configuration for one relay run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// Port the relay listens on (loopback only). `0` lets the OS pick.
    /// Default: 7890
    pub listen_port: u16,

    /// Local port of the forwarded tunnel to the phone.
    /// Default: 7891
    pub tunnel_port: u16,

    /// Port of the proxy on the phone. Informational for the relay itself;
    /// the forwarding provider maps `tunnel_port` onto it.
    /// Default: 7890
    pub remote_port: u16,

    /// Client-facing protocol.
    /// Default: SOCKS5
    pub protocol: Protocol,

    /// Bound on connecting to the tunnel port plus the SOCKS5 reply.
    /// Default: 15 seconds
    pub handshake_timeout: Duration,

    /// Bound on receiving a complete HTTP request header block, or the
    /// SOCKS5 greeting plus CONNECT request.
    /// Default: 30 seconds
    pub header_timeout: Duration,

    /// Largest HTTP request header block accepted.
    /// Default: 64 KiB
    pub max_header_bytes: usize,

    /// Upstream SOCKS5 session setup.
    /// Default: [`UpstreamHandshake::Direct`]
    pub upstream_handshake: UpstreamHandshake,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            tunnel_port: DEFAULT_TUNNEL_PORT,
            remote_port: DEFAULT_REMOTE_PORT,
            protocol: Protocol::Socks5,
            handshake_timeout: Duration::from_secs(15),
            header_timeout: Duration::from_secs(30),
            max_header_bytes: 64 * 1024,
            upstream_handshake: UpstreamHandshake::Direct,
        }
    }
}

impl RelayConfig {
    /// Default config speaking the given protocol.
    pub fn with_protocol(protocol: Protocol) -> Self {
        Self {
            protocol,
            ..Default::default()
        }
    }

    /// Address the relay listener binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.listen_port))
    }

    /// Address of the forwarded tunnel.
    pub fn tunnel_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.tunnel_port))
    }

    /// Proxy URL handed to the browser, e.g. `socks5://127.0.0.1:7890`.
    pub fn proxy_url(&self) -> String {
        format!("{}://127.0.0.1:{}", self.protocol.as_str(), self.listen_port)
    }
}
