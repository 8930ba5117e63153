//! Subnet broadcast of alerts and camera directives.
//!
//! Alerts are plain control tokens sent to the limited broadcast address on
//! [`ALERT_PORT`]; any number of listeners on the subnet may react to them.

use async_trait::async_trait;
use camlink_wire::{ControlMessage, ALERT_PORT};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use crate::consumer::CommandSink;

/// Sends control tokens to every host on the subnet
#[derive(Debug)]
pub struct AlertBroadcaster {
    socket: UdpSocket,
    target: SocketAddr,
}

impl AlertBroadcaster {
    /// Broadcast to `255.255.255.255` on [`ALERT_PORT`]
    pub async fn new() -> std::io::Result<Self> {
        Self::with_target(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, ALERT_PORT))).await
    }

    /// Send to an explicit target, which may be a unicast address
    pub async fn with_target(target: SocketAddr) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))).await?;
        socket.set_broadcast(true)?;
        debug!("Alert broadcaster bound to {}, target {}", socket.local_addr()?, target);
        Ok(Self { socket, target })
    }

    /// Target address
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Send one message
    pub async fn broadcast(&self, message: &ControlMessage) -> std::io::Result<()> {
        let datagram = message.encode();
        self.socket.send_to(&datagram, self.target).await?;
        trace!("Broadcast {} to {}", message, self.target);
        Ok(())
    }

    /// Send `message` `count` times, `interval` apart
    pub async fn broadcast_every(
        &self,
        message: &ControlMessage,
        interval: Duration,
        count: u32,
    ) -> std::io::Result<()> {
        let mut ticker = tokio::time::interval(interval);
        for _ in 0..count {
            ticker.tick().await;
            self.broadcast(message).await?;
        }
        info!("Broadcast {} {} times to {}", message, count, self.target);
        Ok(())
    }
}

#[async_trait]
impl CommandSink for AlertBroadcaster {
    async fn send_command(&self, message: &ControlMessage) -> std::io::Result<()> {
        self.broadcast(message).await
    }
}

/// Receives broadcast control tokens
#[derive(Debug)]
pub struct AlertListener {
    socket: UdpSocket,
    alarm: AtomicBool,
}

impl AlertListener {
    /// Listen on `addr`, usually `0.0.0.0:5005`
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("Alert listener bound to {}", socket.local_addr()?);
        Ok(Self {
            socket,
            alarm: AtomicBool::new(false),
        })
    }

    /// Local address the listener is bound to
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Wait for the next control token, skipping datagrams that are not text
    pub async fn recv(&self) -> std::io::Result<(ControlMessage, SocketAddr)> {
        let mut buf = [0u8; 256];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            match ControlMessage::parse(&buf[..len]) {
                Ok(message) => {
                    if message == ControlMessage::SleepAlert && !self.alarm.swap(true, Ordering::SeqCst) {
                        warn!("Sleep alert raised by {}", from);
                    }
                    return Ok((message, from));
                }
                Err(e) => debug!("Ignoring {} byte datagram from {}: {}", len, from, e),
            }
        }
    }

    /// Whether a sleep alert has been received since the last clear
    pub fn is_alarm_triggered(&self) -> bool {
        self.alarm.load(Ordering::SeqCst)
    }

    /// Reset the alarm
    pub fn clear_alarm(&self) {
        self.alarm.store(false, Ordering::SeqCst);
    }
}
