//! UDP socket helpers.

use camlink_wire::ControlMessage;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

/// Bind a UDP socket that may also send to broadcast addresses
pub async fn bind_udp(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr).await?;
    socket.set_broadcast(true)?;
    debug!("Bound UDP socket on {}", socket.local_addr()?);
    Ok(socket)
}

/// Send a control token as a single datagram
pub async fn send_control(
    socket: &UdpSocket,
    peer: SocketAddr,
    message: &ControlMessage,
) -> std::io::Result<()> {
    socket.send_to(&message.encode(), peer).await?;
    trace!("Sent {} to {}", message, peer);
    Ok(())
}
