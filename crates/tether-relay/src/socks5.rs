//! SOCKS5 (RFC 1928) codec.
//!
//! Used in both directions: the relay reads greetings and requests from
//! browsers, and writes CONNECT requests to the phone-side proxy.
//!
//! ```text
//! request: +-----+-----+-----+------+----------+----------+
//!          | VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT |
//!          +-----+-----+-----+------+----------+----------+
//!          |  1  |  1  |  0  |  1   | variable |  2 (BE)  |
//!          +-----+-----+-----+------+----------+----------+
//! ```

use crate::{RelayError, UpstreamHandshake};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const VERSION: u8 = 0x05;
pub const NO_AUTH: u8 = 0x00;
pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const SUCCEEDED: u8 = 0x00;
pub const GENERAL_FAILURE: u8 = 0x01;
pub const CONNECTION_REFUSED: u8 = 0x05;
pub const COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Longest domain a single length byte can carry.
pub const MAX_DOMAIN_LEN: usize = 255;

/// Destination of a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    /// Build a target from a textual host, which may be an IPv4 literal, an
    /// IPv6 literal (bracketed or not), or a domain name.
    pub fn from_host_port(host: &str, port: u16) -> Result<Self, RequestError> {
        let bare = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Ok(TargetAddr::Ip(SocketAddr::new(ip, port)));
        }
        if bare.is_empty() || bare.len() > MAX_DOMAIN_LEN {
            return Err(RequestError::Domain);
        }
        Ok(TargetAddr::Domain(bare.to_string(), port))
    }

    /// Host part without port or brackets.
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ip(addr) => addr.ip().to_string(),
            TargetAddr::Domain(domain, _) => domain.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// Append `ATYP | ADDR | PORT` to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&addr.ip().octets());
            }
            TargetAddr::Ip(SocketAddr::V6(addr)) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&addr.ip().octets());
            }
            TargetAddr::Domain(domain, _) => {
                buf.push(ATYP_DOMAIN);
                // from_host_port and read_request both cap the length at 255
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
            }
        }
        buf.extend_from_slice(&self.port().to_be_bytes());
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{addr}"),
            TargetAddr::Domain(domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

/// Why a client greeting or request was refused.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("Unsupported SOCKS version: {0}")]
    Version(u8),

    #[error("Unsupported SOCKS5 command: {0} (only CONNECT supported)")]
    Command(u8),

    #[error("Unsupported SOCKS5 address type: {0}")]
    AddressType(u8),

    #[error("Invalid domain name in request")]
    Domain,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RequestError {
    /// Reply code owed to the client before closing, if any.
    pub fn reply_code(&self) -> Option<u8> {
        match self {
            RequestError::Command(_) => Some(COMMAND_NOT_SUPPORTED),
            RequestError::AddressType(_) => Some(ADDRESS_TYPE_NOT_SUPPORTED),
            RequestError::Domain => Some(GENERAL_FAILURE),
            RequestError::Version(_) | RequestError::Io(_) => None,
        }
    }
}

/// `[VER, REP, RSV, ATYP=1, 0.0.0.0, port 0]`.
///
/// The bound address is always zeroed; browsers ignore it.
pub fn reply(code: u8) -> [u8; 10] {
    [VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

/// Full CONNECT request frame for `target`.
pub fn connect_request(target: &TargetAddr) -> Vec<u8> {
    let mut frame = Vec::with_capacity(7 + MAX_DOMAIN_LEN);
    frame.extend_from_slice(&[VERSION, CMD_CONNECT, 0x00]);
    target.encode(&mut frame);
    frame
}

/// Read a client greeting `[VER, NMETHODS, METHODS...]`.
///
/// The offered methods are consumed and ignored; no-auth is always chosen.
pub async fn read_greeting<R>(reader: &mut R) -> Result<(), RequestError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 2];
    reader.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(RequestError::Version(head[0]));
    }
    let mut methods = vec![0u8; head[1] as usize];
    reader.read_exact(&mut methods).await?;
    Ok(())
}

/// Read a request frame and decode its destination.
///
/// Only the four header bytes are consumed before the command and address
/// type are validated.
pub async fn read_request<R>(reader: &mut R) -> Result<TargetAddr, RequestError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 4];
    reader.read_exact(&mut head).await?;
    let [version, command, _reserved, atyp] = head;
    if version != VERSION {
        return Err(RequestError::Version(version));
    }
    if command != CMD_CONNECT {
        return Err(RequestError::Command(command));
    }

    let target = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            reader.read_exact(&mut octets).await?;
            let port = reader.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(Ipv4Addr::from(octets).into(), port))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            reader.read_exact(&mut octets).await?;
            let port = reader.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(Ipv6Addr::from(octets).into(), port))
        }
        ATYP_DOMAIN => {
            let len = reader.read_u8().await? as usize;
            let mut raw = vec![0u8; len];
            reader.read_exact(&mut raw).await?;
            let port = reader.read_u16().await?;
            let domain = String::from_utf8(raw).map_err(|_| RequestError::Domain)?;
            if domain.is_empty() {
                return Err(RequestError::Domain);
            }
            TargetAddr::Domain(domain, port)
        }
        other => return Err(RequestError::AddressType(other)),
    };
    Ok(target)
}

/// Open a CONNECT session to `target` over an established upstream stream.
///
/// On success the stream is positioned at the first byte of tunnelled data.
///
/// # Errors
/// * `RelayError::UpstreamRejected` - The upstream replied with a non-zero code
/// * `RelayError::Protocol` - The upstream refused method negotiation
/// * `RelayError::Io` - The upstream closed or failed mid-handshake
pub async fn open_upstream<S>(
    stream: &mut S,
    target: &TargetAddr,
    mode: UpstreamHandshake,
) -> crate::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if mode == UpstreamHandshake::Negotiate {
        stream.write_all(&[VERSION, 0x01, NO_AUTH]).await?;
        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await?;
        if choice != [VERSION, NO_AUTH] {
            return Err(RelayError::Protocol(format!(
                "upstream refused no-auth negotiation: {choice:02x?}"
            )));
        }
    }

    stream.write_all(&connect_request(target)).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != SUCCEEDED {
        return Err(RelayError::UpstreamRejected {
            target: target.clone(),
            code: head[1],
        });
    }

    // Drain BND.ADDR/BND.PORT so no reply bytes leak into the tunnel.
    let remaining = match head[3] {
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => stream.read_u8().await? as usize + 2,
        _ => 4 + 2,
    };
    let mut bound = vec![0u8; remaining];
    stream.read_exact(&mut bound).await?;
    Ok(())
}
