//! TCP socket setup.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tracing::{debug, instrument};

use crate::config::EndpointConfig;
use crate::error::{ProtocolError, Result};

/// Pending connections the kernel queues for a listener
pub const LISTEN_BACKLOG: u32 = 1024;

/// Resolve `host:port` to its first address
pub async fn resolve(address: &str) -> Result<SocketAddr> {
    lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| ProtocolError::ConfigError(format!("Could not resolve {address}")))
}

fn socket_for(addr: &SocketAddr, buffer_size: usize) -> Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    let size = u32::try_from(buffer_size).unwrap_or(u32::MAX);
    socket.set_recv_buffer_size(size)?;
    socket.set_send_buffer_size(size)?;
    Ok(socket)
}

/// Bind and listen on the endpoint with its buffer sizes applied
#[instrument(skip(endpoint), fields(address = %endpoint.address()))]
pub async fn bind_listener(endpoint: &EndpointConfig) -> Result<TcpListener> {
    let addr = resolve(&endpoint.address()).await?;
    let socket = socket_for(&addr, endpoint.buffer_size())?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(LISTEN_BACKLOG)?;
    debug!(local = ?listener.local_addr().ok(), "TCP listener bound");
    Ok(listener)
}

/// Connect to `addr` within `timeout`
pub async fn connect(addr: SocketAddr, buffer_size: usize, timeout: Duration) -> Result<TcpStream> {
    let socket = socket_for(&addr, buffer_size)?;
    let stream = tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|_| ProtocolError::Timeout)??;
    stream.set_nodelay(true)?;
    Ok(stream)
}
