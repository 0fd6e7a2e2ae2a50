//! Per-connection plumbing shared by both client protocols.
//!
//! - [`ConnectionSet`] tracks every live connection task of one relay run so
//!   stop can tear them all down.
//! - [`dial_upstream`] opens a SOCKS5 session through the tunnel.
//! - [`splice`] pipes bytes both ways until either side finishes.

use crate::{socks5, RelayConfig, RelayError, Result, TargetAddr};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::AbortHandle;

const PUMP_BUFFER: usize = 16 * 1024;

/// Registry of live connection tasks.
///
/// A task is registered before it can finish and deregisters itself on exit,
/// whether it completed or was aborted.
pub(crate) struct ConnectionSet {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, AbortHandle>>,
}

impl ConnectionSet {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn `fut` as a tracked connection task.
    pub(crate) fn spawn<F>(self: &Arc<Self>, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registration = Registration {
            set: Arc::clone(self),
            id,
        };

        // Hold the lock across spawn so the exit hook cannot run before insert.
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let handle = tokio::spawn(async move {
            let _registration = registration;
            fut.await;
        });
        tasks.insert(id, handle.abort_handle());
    }

    /// Number of connections currently alive.
    pub(crate) fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Abort every live connection. Returns how many were aborted.
    pub(crate) fn close_all(&self) -> usize {
        let drained: Vec<AbortHandle> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &drained {
            handle.abort();
        }
        drained.len()
    }
}

/// Removes its task from the set when the task future is dropped.
struct Registration {
    set: Arc<ConnectionSet>,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.set
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

/// Connect to the tunnel and open a SOCKS5 session to `target`.
///
/// The whole exchange is bounded by `config.handshake_timeout`.
///
/// # Errors
/// * `RelayError::TunnelConnect` - Nothing is listening on the tunnel port
/// * `RelayError::UpstreamRejected` - The phone-side proxy refused the target
/// * `RelayError::Timeout` - No reply within the handshake timeout
pub(crate) async fn dial_upstream(config: &RelayConfig, target: &TargetAddr) -> Result<TcpStream> {
    let tunnel = config.tunnel_addr();
    let handshake = async {
        let mut upstream = TcpStream::connect(tunnel)
            .await
            .map_err(|e| RelayError::TunnelConnect {
                addr: tunnel,
                source: e,
            })?;
        upstream.set_nodelay(true).ok();
        socks5::open_upstream(&mut upstream, target, config.upstream_handshake).await?;
        Ok::<_, RelayError>(upstream)
    };

    match tokio::time::timeout(config.handshake_timeout, handshake).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::Timeout("upstream handshake")),
    }
}

/// Pipe bytes between `client` and `upstream` until either side finishes.
///
/// EOF or an error in one direction ends the whole session: both write
/// halves are shut down and all four halves dropped, so neither leg outlives
/// the other. Returns `(client_to_upstream, upstream_to_client)` byte counts.
pub(crate) async fn splice(client: TcpStream, upstream: TcpStream) -> Result<(u64, u64)> {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();
    let mut sent = 0u64;
    let mut received = 0u64;

    let result = tokio::select! {
        r = pump(&mut client_read, &mut upstream_write, &mut sent) => r,
        r = pump(&mut upstream_read, &mut client_write, &mut received) => r,
    };

    upstream_write.shutdown().await.ok();
    client_write.shutdown().await.ok();

    match result {
        Ok(()) => Ok((sent, received)),
        Err(e)
            if e.kind() == std::io::ErrorKind::ConnectionReset
                || e.kind() == std::io::ErrorKind::BrokenPipe =>
        {
            Ok((sent, received))
        }
        Err(e) => Err(e.into()),
    }
}

/// Copy until EOF, counting forwarded bytes into `count`.
async fn pump<R, W>(reader: &mut R, writer: &mut W, count: &mut u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PUMP_BUFFER];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *count += n as u64;
    }
}
