//! SOCKS5 client sessions.
//!
//! The greeting and request together must arrive within `header_timeout`.
//!
//! ```text
//! GREETING --[5,0]--> REQUEST --dial--> CONNECTING --[5,0,...]--> RELAYING
//!     |                  |                  |
//!     v                  v                  v
//!   close         reply 1/7/8, close   reply 1 or upstream code, close
//! ```

use crate::connection::{dial_upstream, splice};
use crate::server::RelayContext;
use crate::socks5::{self, RequestError};
use crate::{RelayError, Result, TargetAddr};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

pub(crate) async fn handle_connection(mut client: TcpStream, ctx: &RelayContext) -> Result<()> {
    let deadline = ctx.config.header_timeout;
    let request = tokio::time::timeout(deadline, read_client_request(&mut client))
        .await
        .map_err(|_| RelayError::Timeout("SOCKS5 request"))?;
    let target = match request {
        Ok(target) => target,
        Err(e) => {
            if let Some(code) = e.reply_code() {
                reject(&mut client, code).await;
            }
            return Err(e.into());
        }
    };
    debug!(dest = %target, "SOCKS5 CONNECT");

    let upstream = match dial_upstream(&ctx.config, &target).await {
        Ok(upstream) => upstream,
        Err(e) => {
            reject(&mut client, failure_code(&e)).await;
            return Err(e);
        }
    };

    client.write_all(&socks5::reply(socks5::SUCCEEDED)).await?;
    ctx.events.connection(&target);

    let (sent, received) = splice(client, upstream).await?;
    debug!(dest = %target, sent, received, "SOCKS5 session closed");
    Ok(())
}

/// Greeting, method selection, then the CONNECT request.
async fn read_client_request(
    client: &mut TcpStream,
) -> std::result::Result<TargetAddr, RequestError> {
    socks5::read_greeting(client).await?;
    client.write_all(&[socks5::VERSION, socks5::NO_AUTH]).await?;
    socks5::read_request(client).await
}

/// Reply code to hand the client when the upstream leg fails.
fn failure_code(err: &RelayError) -> u8 {
    match err {
        RelayError::UpstreamRejected { code, .. } => *code,
        RelayError::Socks(e) => e.reply_code().unwrap_or(socks5::GENERAL_FAILURE),
        _ => socks5::GENERAL_FAILURE,
    }
}

/// Best-effort error reply followed by a close.
async fn reject(client: &mut TcpStream, code: u8) {
    client.write_all(&socks5::reply(code)).await.ok();
    client.shutdown().await.ok();
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::{get_free_port, read_n, read_until_close, StubProxy};
    use crate::{
        EventBus, Protocol, RelayConfig, RelayEvent, RelayHandle, RelayServer,
        UpstreamHandshake,
    };
    use std::time::Duration;

    fn relay_config(tunnel_port: u16, mode: UpstreamHandshake) -> RelayConfig {
        RelayConfig {
            listen_port: 0,
            tunnel_port,
            upstream_handshake: mode,
            handshake_timeout: Duration::from_millis(500),
            ..RelayConfig::with_protocol(Protocol::Socks5)
        }
    }

    async fn start_relay(tunnel_port: u16, mode: UpstreamHandshake) -> (RelayHandle, EventBus) {
        start_relay_with(relay_config(tunnel_port, mode)).await
    }

    async fn start_relay_with(config: RelayConfig) -> (RelayHandle, EventBus) {
        let events = EventBus::new();
        let handle = RelayServer::new(config, events.clone()).start().await.unwrap();
        (handle, events)
    }

    /// Poll until the relay tracks no live connections.
    async fn wait_for_idle(relay: &RelayHandle) -> bool {
        for _ in 0..50 {
            if relay.connection_count() == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn open_session(relay: &RelayHandle, phone: &mut StubProxy) -> (TcpStream, TcpStream) {
        let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();
        greet(&mut client).await;
        client
            .write_all(&[5, 1, 0, 1, 10, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        assert_eq!(read_n(&mut client, 10).await[1], 0);
        let (_, session) = phone.next_session().await;
        (client, session)
    }

    async fn greet(client: &mut TcpStream) {
        client.write_all(&[5, 1, 0]).await.unwrap();
        assert_eq!(read_n(client, 2).await, vec![5, 0]);
    }

    // ========================================================================
    // Success Path
    // ========================================================================

    #[tokio::test]
    async fn test_ipv4_connect_then_payload_verbatim() {
        let Some(mut phone) = StubProxy::start(UpstreamHandshake::Direct, 0).await else {
            return;
        };
        let (relay, _events) = start_relay(phone.port, UpstreamHandshake::Direct).await;
        let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();

        greet(&mut client).await;
        client
            .write_all(&[5, 1, 0, 1, 93, 184, 216, 34, 0, 80])
            .await
            .unwrap();
        assert_eq!(read_n(&mut client, 10).await, vec![5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);

        let (target, mut session) = phone.next_session().await;
        assert_eq!(target.to_string(), "93.184.216.34:80");

        client.write_all(b"hello").await.unwrap();
        assert_eq!(read_n(&mut session, 5).await, b"hello");

        session.write_all(b"world").await.unwrap();
        assert_eq!(read_n(&mut client, 5).await, b"world");

        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_domain_target_reaches_upstream_unchanged() {
        let Some(mut phone) = StubProxy::start(UpstreamHandshake::Direct, 0).await else {
            return;
        };
        let (relay, events) = start_relay(phone.port, UpstreamHandshake::Direct).await;
        let mut sub = events.subscribe();
        let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();

        greet(&mut client).await;
        let mut request = vec![5, 1, 0, 3, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&[0x01, 0xBB]);
        client.write_all(&request).await.unwrap();
        assert_eq!(read_n(&mut client, 10).await[1], 0);

        let (target, _session) = phone.next_session().await;
        assert_eq!(target.host(), "example.com");
        assert_eq!(target.port(), 443);

        let event = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap();
        assert_eq!(
            event,
            Some(RelayEvent::Connection {
                host: "example.com".to_string(),
                port: 443
            })
        );

        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_greeting_and_request_in_one_write() {
        let Some(mut phone) = StubProxy::start(UpstreamHandshake::Direct, 0).await else {
            return;
        };
        let (relay, _events) = start_relay(phone.port, UpstreamHandshake::Direct).await;
        let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();

        client
            .write_all(&[5, 1, 0, 5, 1, 0, 1, 10, 0, 0, 7, 0x1F, 0x90])
            .await
            .unwrap();
        assert_eq!(read_n(&mut client, 2).await, vec![5, 0]);
        assert_eq!(read_n(&mut client, 10).await[1], 0);

        let (target, _session) = phone.next_session().await;
        assert_eq!(target.to_string(), "10.0.0.7:8080");
        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_negotiate_mode_greets_upstream() {
        let Some(mut phone) = StubProxy::start(UpstreamHandshake::Negotiate, 0).await else {
            return;
        };
        let (relay, _events) = start_relay(phone.port, UpstreamHandshake::Negotiate).await;
        let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();

        greet(&mut client).await;
        client
            .write_all(&[5, 1, 0, 1, 127, 0, 0, 1, 0, 22])
            .await
            .unwrap();
        assert_eq!(read_n(&mut client, 10).await[1], 0);

        let (target, _session) = phone.next_session().await;
        assert_eq!(target.port(), 22);
        relay.shutdown().await.unwrap();
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    #[tokio::test]
    async fn test_upstream_close_ends_client_and_releases_connection() {
        let Some(mut phone) = StubProxy::start(UpstreamHandshake::Direct, 0).await else {
            return;
        };
        let (relay, _events) = start_relay(phone.port, UpstreamHandshake::Direct).await;
        let (mut client, mut session) = open_session(&relay, &mut phone).await;
        assert_eq!(relay.connection_count(), 1);

        session.write_all(b"bye").await.unwrap();
        drop(session);

        let tail = read_until_close(&mut client).await;
        assert_eq!(tail, b"bye");
        assert!(wait_for_idle(&relay).await, "connection still tracked");

        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_client_close_ends_upstream_and_releases_connection() {
        let Some(mut phone) = StubProxy::start(UpstreamHandshake::Direct, 0).await else {
            return;
        };
        let (relay, _events) = start_relay(phone.port, UpstreamHandshake::Direct).await;
        let (client, mut session) = open_session(&relay, &mut phone).await;

        drop(client);

        let tail = read_until_close(&mut session).await;
        assert!(tail.is_empty());
        assert!(wait_for_idle(&relay).await, "connection still tracked");

        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_client_is_closed_after_header_timeout() {
        let Some(tunnel_port) = get_free_port().await else {
            return;
        };
        let (relay, _events) = start_relay_with(RelayConfig {
            header_timeout: Duration::from_millis(200),
            ..relay_config(tunnel_port, UpstreamHandshake::Direct)
        })
        .await;
        let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();

        let received = read_until_close(&mut client).await;
        assert!(received.is_empty());
        assert!(wait_for_idle(&relay).await, "connection still tracked");

        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stalled_request_is_closed_after_header_timeout() {
        let Some(tunnel_port) = get_free_port().await else {
            return;
        };
        let (relay, _events) = start_relay_with(RelayConfig {
            header_timeout: Duration::from_millis(200),
            ..relay_config(tunnel_port, UpstreamHandshake::Direct)
        })
        .await;
        let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();

        greet(&mut client).await;
        client.write_all(&[5, 1, 0]).await.unwrap();
        let received = read_until_close(&mut client).await;
        assert!(received.is_empty());

        relay.shutdown().await.unwrap();
    }

    // ========================================================================
    // Rejections
    // ========================================================================

    #[tokio::test]
    async fn test_non_utf8_domain_gets_general_failure() {
        let Some(tunnel_port) = get_free_port().await else {
            return;
        };
        let (relay, _events) = start_relay(tunnel_port, UpstreamHandshake::Direct).await;
        let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();

        greet(&mut client).await;
        client
            .write_all(&[5, 1, 0, 3, 2, 0xC3, 0x28, 0x00, 0x50])
            .await
            .unwrap();
        let reply = read_until_close(&mut client).await;
        assert_eq!(reply, vec![5, 1, 0, 1, 0, 0, 0, 0, 0, 0]);

        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_command_gets_reply_7() {
        let Some(tunnel_port) = get_free_port().await else {
            return;
        };
        let (relay, _events) = start_relay(tunnel_port, UpstreamHandshake::Direct).await;
        let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();

        greet(&mut client).await;
        client.write_all(&[5, 2, 0, 1]).await.unwrap();
        let reply = read_until_close(&mut client).await;
        assert_eq!(reply, vec![5, 7, 0, 1, 0, 0, 0, 0, 0, 0]);

        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_atyp_gets_reply_8() {
        let Some(tunnel_port) = get_free_port().await else {
            return;
        };
        let (relay, _events) = start_relay(tunnel_port, UpstreamHandshake::Direct).await;
        let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();

        greet(&mut client).await;
        client.write_all(&[5, 1, 0, 9]).await.unwrap();
        let reply = read_until_close(&mut client).await;
        assert_eq!(reply, vec![5, 8, 0, 1, 0, 0, 0, 0, 0, 0]);

        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_version_closes_without_reply() {
        let Some(tunnel_port) = get_free_port().await else {
            return;
        };
        let (relay, _events) = start_relay(tunnel_port, UpstreamHandshake::Direct).await;
        let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();

        client.write_all(&[4, 1]).await.unwrap();
        assert!(read_until_close(&mut client).await.is_empty());

        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_tunnel_down_gets_general_failure() {
        let Some(tunnel_port) = get_free_port().await else {
            return;
        };
        let (relay, _events) = start_relay(tunnel_port, UpstreamHandshake::Direct).await;
        let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();

        greet(&mut client).await;
        client
            .write_all(&[5, 1, 0, 1, 93, 184, 216, 34, 0, 80])
            .await
            .unwrap();
        let reply = read_until_close(&mut client).await;
        assert_eq!(reply, vec![5, 1, 0, 1, 0, 0, 0, 0, 0, 0]);

        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_upstream_reply_code_is_relayed() {
        let Some(phone) = StubProxy::start(UpstreamHandshake::Direct, 5).await else {
            return;
        };
        let (relay, _events) = start_relay(phone.port, UpstreamHandshake::Direct).await;
        let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();

        greet(&mut client).await;
        client
            .write_all(&[5, 1, 0, 1, 10, 1, 2, 3, 0, 80])
            .await
            .unwrap();
        let reply = read_until_close(&mut client).await;
        assert_eq!(reply, vec![5, 5, 0, 1, 0, 0, 0, 0, 0, 0]);

        relay.shutdown().await.unwrap();
    }

    #[test]
    fn test_failure_code_mapping() {
        let rejected = RelayError::UpstreamRejected {
            target: crate::TargetAddr::Domain("x".to_string(), 1),
            code: 4,
        };
        assert_eq!(failure_code(&rejected), 4);
        assert_eq!(
            failure_code(&RelayError::Timeout("upstream handshake")),
            socks5::GENERAL_FAILURE
        );
    }
}
