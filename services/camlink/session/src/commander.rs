//! Directives sent back to the connected camera.

use async_trait::async_trait;
use camlink_delivery::CommandSink;
use camlink_wire::ControlMessage;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

use crate::transport::send_control;

/// Sends control tokens to the session peer over the session socket
#[derive(Debug, Clone)]
pub struct PeerCommander {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl PeerCommander {
    /// Create a commander for `peer`
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }

    /// Camera address
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl CommandSink for PeerCommander {
    async fn send_command(&self, message: &ControlMessage) -> std::io::Result<()> {
        send_control(&self.socket, self.peer, message).await
    }
}
