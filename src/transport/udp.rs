//! UDP socket setup and multicast membership.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::UdpSocket;
use tracing::{debug, instrument, warn};

use crate::config::{validate_multicast_group, EndpointConfig};
use crate::error::Result;
use crate::transport::tcp::resolve;

fn wildcard_for(ip: &IpAddr, port: u16) -> SocketAddr {
    match ip {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
    }
}

/// Bind the receiving socket for a listener.
///
/// Multicast endpoints bind the wildcard address on the configured port, join
/// the group and apply the TTL. The group is validated before anything is
/// bound.
#[instrument(skip(endpoint), fields(address = %endpoint.address()))]
pub async fn bind_receiver(endpoint: &EndpointConfig) -> Result<UdpSocket> {
    let Some(ttl) = endpoint.multicast_ttl() else {
        let addr = resolve(&endpoint.address()).await?;
        let socket = UdpSocket::bind(addr).await?;
        debug!(local = ?socket.local_addr().ok(), "UDP socket bound");
        return Ok(socket);
    };

    let group = validate_multicast_group(endpoint.host())?;
    let socket = UdpSocket::bind(wildcard_for(&group, endpoint.port())).await?;
    match group {
        IpAddr::V4(v4) => {
            socket.join_multicast_v4(v4, Ipv4Addr::UNSPECIFIED)?;
            socket.set_multicast_ttl_v4(ttl)?;
        }
        IpAddr::V6(v6) => {
            socket.join_multicast_v6(&v6, 0)?;
        }
    }
    debug!(%group, ttl, "Joined multicast group");
    Ok(socket)
}

/// Leave the multicast group joined by [`bind_receiver`], if any
pub fn leave_group(socket: &UdpSocket, endpoint: &EndpointConfig) {
    if !endpoint.is_multicast() {
        return;
    }
    let left = match validate_multicast_group(endpoint.host()) {
        Ok(IpAddr::V4(v4)) => socket.leave_multicast_v4(v4, Ipv4Addr::UNSPECIFIED),
        Ok(IpAddr::V6(v6)) => socket.leave_multicast_v6(&v6, 0),
        Err(_) => return,
    };
    if let Err(e) = left {
        warn!(error = %e, "Failed to leave multicast group");
    }
}

/// Ephemeral socket for a dialer plus the resolved target
pub async fn bind_sender(endpoint: &EndpointConfig) -> Result<(UdpSocket, SocketAddr)> {
    let target = resolve(&endpoint.address()).await?;
    let socket = UdpSocket::bind(wildcard_for(&target.ip(), 0)).await?;
    if let (Some(ttl), IpAddr::V4(_)) = (endpoint.multicast_ttl(), target.ip()) {
        socket.set_multicast_ttl_v4(ttl)?;
    }
    Ok((socket, target))
}
