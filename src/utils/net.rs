//! Port discovery for control and data sockets.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::debug;

use crate::utils::error::{Error, Result};

/// Returns the first port at or above `start` that can currently be bound on
/// `host`. A `start` of `0` asks the operating system for an ephemeral port.
///
/// The port is released before returning, so another process may still win
/// the race; prefer [`bind_available`] when the caller binds immediately.
pub fn get_available_port(host: &str, start: u16) -> Result<u16> {
    for port in candidate_ports(start) {
        if let Ok(listener) = std::net::TcpListener::bind((host, port)) {
            return Ok(listener.local_addr()?.port());
        }
    }
    Err(Error::NoAvailablePort {
        host: host.to_string(),
        start,
    })
}

/// Binds a listener on the first available port at or above `start`.
pub async fn bind_available(host: &str, start: u16) -> Result<TcpListener> {
    for port in candidate_ports(start) {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => {
                debug!("bound listener on {}", listener.local_addr()?);
                return Ok(listener);
            }
            Err(e) if port == 0 => return Err(e.into()),
            Err(_) => continue,
        }
    }
    Err(Error::NoAvailablePort {
        host: host.to_string(),
        start,
    })
}

fn candidate_ports(start: u16) -> impl Iterator<Item = u16> {
    // port 0 is a single request for an ephemeral port, not a scan
    let end = if start == 0 { 0 } else { u16::MAX };
    start..=end
}

/// Resolves `host:port` to the first socket address it names.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{host}:{port} did not resolve to any address"),
            ))
        })
}
