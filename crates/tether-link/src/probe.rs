//! Tunnel liveness check.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);

/// Whether something accepts TCP connections on `127.0.0.1:port` within
/// `timeout`. The probe connection is closed straight away.
pub async fn probe_tunnel(port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!(%addr, error = %e, "Tunnel probe refused");
            false
        }
        Err(_) => {
            debug!(%addr, "Tunnel probe timed out");
            false
        }
    }
}
