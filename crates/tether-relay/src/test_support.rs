//! Socket helpers shared by the relay's unit tests.

#![allow(clippy::unwrap_used)]

use crate::{socks5, TargetAddr, UpstreamHandshake};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub(crate) async fn tcp_listener_or_skip(addr: &str) -> Option<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Some(listener),
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => None,
        Err(err) => panic!("Failed to bind TCP listener for test: {err}"),
    }
}

/// Get a free port by binding to port 0.
pub(crate) async fn get_free_port() -> Option<u16> {
    let listener = tcp_listener_or_skip("127.0.0.1:0").await?;
    Some(listener.local_addr().unwrap().port())
}

/// Connected loopback pair: `(connector, acceptor)`.
pub(crate) async fn socket_pair() -> Option<(TcpStream, TcpStream)> {
    let listener = tcp_listener_or_skip("127.0.0.1:0").await?;
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    Some((client.unwrap(), accepted.unwrap().0))
}

/// Phone-side SOCKS5 proxy stand-in.
///
/// Answers every CONNECT with `reply_code`. Accepted sessions are handed to
/// the test together with the decoded target.
pub(crate) struct StubProxy {
    pub port: u16,
    pub sessions: mpsc::UnboundedReceiver<(TargetAddr, TcpStream)>,
}

impl StubProxy {
    pub(crate) async fn start(mode: UpstreamHandshake, reply_code: u8) -> Option<Self> {
        let listener = tcp_listener_or_skip("127.0.0.1:0").await?;
        let port = listener.local_addr().unwrap().port();
        let (tx, sessions) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if mode == UpstreamHandshake::Negotiate {
                        let mut greeting = [0u8; 3];
                        socket.read_exact(&mut greeting).await.unwrap();
                        assert_eq!(greeting, [5, 1, 0]);
                        socket.write_all(&[5, 0]).await.unwrap();
                    }
                    let target = socks5::read_request(&mut socket).await.unwrap();
                    socket.write_all(&socks5::reply(reply_code)).await.unwrap();
                    if reply_code == socks5::SUCCEEDED {
                        let _ = tx.send((target, socket));
                    }
                });
            }
        });

        Some(Self { port, sessions })
    }

    /// Next accepted session, failing the test after two seconds.
    pub(crate) async fn next_session(&mut self) -> (TargetAddr, TcpStream) {
        tokio::time::timeout(std::time::Duration::from_secs(2), self.sessions.recv())
            .await
            .expect("stub proxy saw no session")
            .expect("stub proxy stopped")
    }
}

/// Read from `stream` until `n` bytes arrive.
pub(crate) async fn read_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    tokio::time::timeout(std::time::Duration::from_secs(2), stream.read_exact(&mut buf))
        .await
        .expect("timed out reading")
        .unwrap();
    buf
}

/// Read until the peer closes, or an error (RST) ends the stream.
pub(crate) async fn read_until_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let read = tokio::time::timeout(std::time::Duration::from_secs(3), stream.read(&mut buf))
            .await
            .expect("peer never closed");
        match read {
            Ok(0) | Err(_) => return out,
            Ok(n) => out.extend_from_slice(&buf[..n]),
        }
    }
}

pub(crate) fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}
