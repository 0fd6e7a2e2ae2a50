//! HTTP proxy client sessions.
//!
//! One request per connection. The header block is accumulated up to the
//! first blank line, the target is resolved from it, and then the connection
//! becomes a raw byte pipe:
//!
//! - `CONNECT host:port` answers `200 Connection Established` once the
//!   upstream session is open.
//! - Any other allowed method is forwarded with its request line rewritten
//!   to origin-form (`GET /path?q HTTP/1.1`); the remaining header lines and
//!   any already-received body bytes follow verbatim.
//!
//! Keep-alive is not interpreted: a second request on the same connection
//! goes to the first request's target.

use crate::connection::{dial_upstream, splice};
use crate::server::RelayContext;
use crate::{RelayError, Result, TargetAddr};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use url::{Host, Url};

const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH"];

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Error statuses the relay answers with before closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    BadRequest,
    MethodNotAllowed,
    BadGateway,
}

impl Status {
    fn response(self) -> &'static [u8] {
        match self {
            Status::BadRequest => b"HTTP/1.1 400 Bad Request\r\n\r\n",
            Status::MethodNotAllowed => b"HTTP/1.1 405 Method Not Allowed\r\n\r\n",
            Status::BadGateway => b"HTTP/1.1 502 Bad Gateway\r\n\r\n",
        }
    }
}

/// A parsed proxy request.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ProxyRequest {
    /// `CONNECT` tunnel.
    Connect { target: TargetAddr },
    /// Plain request; `head` is the rewritten header block ending in a blank line.
    Forward { target: TargetAddr, head: Vec<u8> },
}

impl ProxyRequest {
    fn target(&self) -> &TargetAddr {
        match self {
            ProxyRequest::Connect { target } | ProxyRequest::Forward { target, .. } => target,
        }
    }
}

/// Outcome of accumulating a request header block.
#[derive(Debug)]
pub(crate) enum HeadRead {
    /// `buf[..end]` is the header block; `buf[end + 4..]` is early body data.
    Complete { buf: BytesMut, end: usize },
    /// The client closed before finishing the header block.
    Closed,
    /// The header block grew past the configured limit.
    TooLarge,
}

pub(crate) async fn handle_connection(mut client: TcpStream, ctx: &RelayContext) -> Result<()> {
    let config = &ctx.config;
    let head = tokio::time::timeout(
        config.header_timeout,
        read_head(&mut client, config.max_header_bytes),
    )
    .await
    .map_err(|_| RelayError::Timeout("request header"))??;

    let (buf, end) = match head {
        HeadRead::Complete { buf, end } => (buf, end),
        HeadRead::Closed => return Ok(()),
        HeadRead::TooLarge => {
            respond(&mut client, Status::BadRequest).await;
            return Err(RelayError::Protocol(format!(
                "request header exceeds {} bytes",
                config.max_header_bytes
            )));
        }
    };
    let early_body = &buf[end + HEADER_TERMINATOR.len()..];

    let request = match parse_request(&buf[..end]) {
        Ok(request) => request,
        Err(status) => {
            respond(&mut client, status).await;
            return Err(RelayError::Protocol(format!(
                "refused request: {}",
                String::from_utf8_lossy(status.response()).trim_end()
            )));
        }
    };
    let target = request.target().clone();
    debug!(dest = %target, connect = matches!(request, ProxyRequest::Connect { .. }), "HTTP proxy request");

    let mut upstream = match dial_upstream(config, &target).await {
        Ok(upstream) => upstream,
        Err(e) => {
            respond(&mut client, Status::BadGateway).await;
            return Err(e);
        }
    };

    match &request {
        ProxyRequest::Connect { .. } => {
            client.write_all(CONNECT_ESTABLISHED).await?;
        }
        ProxyRequest::Forward { head, .. } => {
            upstream.write_all(head).await?;
        }
    }
    if !early_body.is_empty() {
        upstream.write_all(early_body).await?;
    }
    ctx.events.connection(&target);

    let (sent, received) = splice(client, upstream).await?;
    debug!(dest = %target, sent, received, "HTTP session closed");
    Ok(())
}

/// Best-effort status reply followed by a close.
async fn respond(client: &mut TcpStream, status: Status) {
    client.write_all(status.response()).await.ok();
    client.shutdown().await.ok();
}

/// Accumulate bytes until the first `\r\n\r\n`.
///
/// The terminator search resumes where the previous pass left off, minus
/// three bytes in case it straddles two reads.
pub(crate) async fn read_head<R>(reader: &mut R, limit: usize) -> std::io::Result<HeadRead>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    let mut scanned = 0;
    loop {
        if let Some(pos) = find_terminator(&buf[scanned..]) {
            let end = scanned + pos;
            if end > limit {
                return Ok(HeadRead::TooLarge);
            }
            return Ok(HeadRead::Complete { buf, end });
        }
        if buf.len() > limit {
            return Ok(HeadRead::TooLarge);
        }
        scanned = buf.len().saturating_sub(HEADER_TERMINATOR.len() - 1);

        buf.reserve(4096);
        if reader.read_buf(&mut buf).await? == 0 {
            return Ok(HeadRead::Closed);
        }
    }
}

fn find_terminator(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

/// Parse a header block (without its trailing blank line).
pub(crate) fn parse_request(block: &[u8]) -> std::result::Result<ProxyRequest, Status> {
    let text = std::str::from_utf8(block).map_err(|_| Status::BadRequest)?;
    let (request_line, header_lines) = match text.find("\r\n") {
        Some(i) => text.split_at(i),
        None => (text, ""),
    };

    let mut parts = request_line.split(' ');
    let method = parts.next().filter(|m| !m.is_empty()).ok_or(Status::BadRequest)?;
    let uri = parts.next().filter(|u| !u.is_empty()).ok_or(Status::BadRequest)?;
    let version = parts.next().filter(|v| !v.is_empty()).ok_or(Status::BadRequest)?;

    if method == "CONNECT" {
        let target = parse_authority(uri, 443)?;
        return Ok(ProxyRequest::Connect { target });
    }
    if !ALLOWED_METHODS.contains(&method) {
        return Err(Status::MethodNotAllowed);
    }

    let (target, path) = if has_http_scheme(uri) {
        parse_absolute(uri)?
    } else {
        let host = host_header(header_lines).ok_or(Status::BadRequest)?;
        (parse_authority(host, 80)?, uri.to_string())
    };

    let mut head = Vec::with_capacity(block.len() + HEADER_TERMINATOR.len());
    head.extend_from_slice(format!("{method} {path} {version}").as_bytes());
    head.extend_from_slice(header_lines.as_bytes());
    head.extend_from_slice(HEADER_TERMINATOR);
    Ok(ProxyRequest::Forward { target, head })
}

fn has_http_scheme(uri: &str) -> bool {
    let lower = uri.get(..8).unwrap_or(uri).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Absolute-form URI to `(target, origin-form path)`.
fn parse_absolute(uri: &str) -> std::result::Result<(TargetAddr, String), Status> {
    let url = Url::parse(uri).map_err(|_| Status::BadRequest)?;
    let port = url.port_or_known_default().ok_or(Status::BadRequest)?;
    let target = match url.host().ok_or(Status::BadRequest)? {
        Host::Domain(domain) => {
            TargetAddr::from_host_port(domain, port).map_err(|_| Status::BadRequest)?
        }
        Host::Ipv4(ip) => TargetAddr::Ip((ip, port).into()),
        Host::Ipv6(ip) => TargetAddr::Ip((ip, port).into()),
    };

    let mut path = url.path().to_string();
    if path.is_empty() {
        path.push('/');
    }
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }
    Ok((target, path))
}

/// `host[:port]` or `[v6][:port]`. A missing, zero or unparsable port
/// falls back to `default_port`.
fn parse_authority(authority: &str, default_port: u16) -> std::result::Result<TargetAddr, Status> {
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let close = rest.find(']').ok_or(Status::BadRequest)?;
        let port = rest[close + 1..].strip_prefix(':');
        (&rest[..close], port)
    } else if authority.matches(':').count() > 1 {
        // Unbracketed IPv6 literal; no room for a port.
        (authority, None)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    let port = port
        .and_then(|p| p.trim().parse::<u16>().ok())
        .filter(|p| *p != 0)
        .unwrap_or(default_port);
    TargetAddr::from_host_port(host.trim(), port).map_err(|_| Status::BadRequest)
}

/// Value of the first `Host` header, matched case-insensitively.
fn host_header(header_lines: &str) -> Option<&str> {
    header_lines.split("\r\n").find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("host")
            .then(|| value.trim())
            .filter(|v| !v.is_empty())
    })
}
