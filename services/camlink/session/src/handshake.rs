//! Discovery and HELLO/ACK exchange.
//!
//! Both steps are single attempts bounded by a timeout. They only read and
//! write the socket; state transitions are made by [`crate::Session`].
//! Datagrams that are not part of the exchange are handed to an `on_stray`
//! callback with their sender and length.

use camlink_wire::ControlMessage;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::session::SessionState;
use crate::transport::send_control;

const MAX_CONTROL_LEN: usize = 256;

/// Handshake failures; the session is left disconnected
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// No discovery announcement arrived in time
    #[error("no discovery announcement within {0:?}")]
    DiscoveryTimeout(Duration),
    /// No acknowledgment arrived in time
    #[error("no acknowledgment within {0:?}")]
    AckTimeout(Duration),
    /// The peer answered HELLO with something other than ACK
    #[error("unexpected reply to HELLO: {0:?}")]
    UnexpectedReply(String),
    /// Handshake attempted from a state other than idle
    #[error("handshake requires an idle session, state is {0}")]
    NotIdle(SessionState),
    /// Retry attempted on a session that has not disconnected
    #[error("retry requires a disconnected session, state is {0}")]
    NotDisconnected(SessionState),
    /// Socket error
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wait for a camera discovery announcement.
///
/// Returns the camera address: the announcement's source IP with `peer_port`,
/// or the source port when `peer_port` is `None`.
pub async fn await_discovery<F>(
    socket: &UdpSocket,
    wait: Duration,
    peer_port: Option<u16>,
    mut on_stray: F,
) -> Result<SocketAddr, HandshakeError>
where
    F: FnMut(SocketAddr, usize),
{
    info!("Waiting up to {:?} for camera discovery", wait);
    let mut buf = [0u8; MAX_CONTROL_LEN];

    let listen = async {
        loop {
            let (len, from) = socket.recv_from(&mut buf).await?;
            match ControlMessage::parse(&buf[..len]) {
                Ok(ControlMessage::Discovery) => {
                    let peer = SocketAddr::new(from.ip(), peer_port.unwrap_or(from.port()));
                    info!("Discovered camera at {}", peer);
                    return Ok::<_, HandshakeError>(peer);
                }
                _ => {
                    debug!("Ignoring {} byte datagram from {} during discovery", len, from);
                    on_stray(from, len);
                }
            }
        }
    };

    timeout(wait, listen)
        .await
        .map_err(|_| HandshakeError::DiscoveryTimeout(wait))?
}

/// Send HELLO and wait for the peer's reply, which must be ACK.
///
/// Datagrams from other hosts are reported and skipped. Any other reply from
/// the peer is reported and fails the exchange.
pub async fn exchange_hello<F>(
    socket: &UdpSocket,
    peer: SocketAddr,
    wait: Duration,
    mut on_stray: F,
) -> Result<(), HandshakeError>
where
    F: FnMut(SocketAddr, usize),
{
    send_control(socket, peer, &ControlMessage::Hello).await?;
    debug!("Sent HELLO to {}, waiting {:?} for ACK", peer, wait);

    let mut buf = [0u8; MAX_CONTROL_LEN];
    let reply = async {
        loop {
            let (len, from) = socket.recv_from(&mut buf).await?;
            if from.ip() == peer.ip() {
                return Ok::<_, HandshakeError>((len, from));
            }
            debug!("Ignoring datagram from {} while waiting for {}", from, peer);
            on_stray(from, len);
        }
    };

    let (len, from) = timeout(wait, reply)
        .await
        .map_err(|_| HandshakeError::AckTimeout(wait))??;

    match ControlMessage::parse(&buf[..len]) {
        Ok(message) if message.is_ack() => {
            info!("Camera {} acknowledged HELLO", peer);
            Ok(())
        }
        _ => {
            on_stray(from, len);
            Err(HandshakeError::UnexpectedReply(
                String::from_utf8_lossy(&buf[..len]).into_owned(),
            ))
        }
    }
}
