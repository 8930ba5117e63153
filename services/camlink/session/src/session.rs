//! Session lifecycle for one camera.
//!
//! A [`Session`] owns the UDP socket and a single-writer state cell. The
//! handshake moves it from `Idle` to `Connected` and starts the keepalive
//! task; [`Session::start`] then spawns the receive loop and returns a
//! [`SessionHandle`] used to observe and stop the session.

use camlink_delivery::FrameQueue;
use camlink_wire::{HeaderLayout, DEFAULT_BUFFER_SIZE, DEFAULT_SESSION_PORT};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::commander::PeerCommander;
use crate::handshake::{await_discovery, exchange_hello, HandshakeError};
use crate::keepalive::run_keepalive;
use crate::reassembly::{DropReason, Reassembler};
use crate::receive::ReceiveLoop;
use crate::stats::{SessionCounters, SessionStats};
use crate::transport::bind_udp;

/// Configuration for a camera session
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Local address to receive on
    pub bind_addr: SocketAddr,
    /// Camera address; discovered by broadcast when `None`
    pub peer: Option<SocketAddr>,
    /// Port paired with a discovered camera IP; the announcement's source port when `None`
    pub peer_port: Option<u16>,
    /// Data datagram header layout
    pub layout: HeaderLayout,
    /// Receive buffer size, the largest datagram accepted
    pub buffer_size: usize,
    /// How long to wait for a discovery announcement
    pub discovery_timeout: Duration,
    /// How long to wait for the ACK to HELLO
    pub ack_timeout: Duration,
    /// Interval between keepalive ACKs
    pub keepalive_interval: Duration,
    /// Drop frames still incomplete after this long
    pub stale_after: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_SESSION_PORT)),
            peer: None,
            peer_port: Some(DEFAULT_SESSION_PORT),
            layout: HeaderLayout::Compact,
            buffer_size: DEFAULT_BUFFER_SIZE,
            discovery_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_millis(500),
            stale_after: None,
        }
    }
}

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no handshake attempted
    Idle,
    /// Waiting for a camera announcement
    AwaitingDiscovery,
    /// HELLO sent, waiting for ACK
    HelloSent,
    /// Frames are being received
    Connected,
    /// Terminal; a failed handshake or explicit disconnect
    Disconnected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::AwaitingDiscovery => "awaiting-discovery",
            SessionState::HelloSent => "hello-sent",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Events emitted by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Handshake succeeded
    Connected {
        /// Camera address
        peer: SocketAddr,
    },
    /// A frame was reassembled and queued
    FrameCompleted {
        /// Frame sequence number
        sequence: u64,
        /// Frame size in bytes
        size: usize,
        /// Aux byte from fragment 0
        aux: Option<u8>,
    },
    /// A frame was discarded
    FrameDropped {
        /// Why
        reason: DropReason,
    },
    /// A datagram was too short to carry a header
    MalformedPacket {
        /// Sender
        from: SocketAddr,
        /// Datagram length
        len: usize,
    },
    /// The session reached `Disconnected`
    Disconnected,
}

/// Session errors outside the handshake
#[derive(Error, Debug)]
pub enum SessionError {
    /// Operation needs a connected session
    #[error("session is {0}, not connected")]
    NotConnected(SessionState),
    /// Socket error
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// State shared between the session owner and its tasks
#[derive(Debug)]
pub(crate) struct SessionShared {
    state: watch::Sender<SessionState>,
    pub(crate) counters: Arc<SessionCounters>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl SessionShared {
    fn new() -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            state,
            counters: Arc::new(SessionCounters::new()),
            events: None,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Session {} -> {}", previous, next);
        }
    }

    /// Record a frame discarded before it reached the consumer
    pub(crate) fn record_drop(&self, reason: DropReason) {
        warn!("Dropped frame: {}", reason);
        self.counters.frame_dropped();
        self.emit(SessionEvent::FrameDropped { reason });
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            // Receiver gone means nobody is listening
            let _ = events.send(event);
        }
    }

    /// Move to `Disconnected`, returning false if already there
    pub(crate) fn disconnect(&self) -> bool {
        let previous = self.state.send_replace(SessionState::Disconnected);
        if previous == SessionState::Disconnected {
            return false;
        }
        info!("Session disconnected (was {})", previous);
        self.emit(SessionEvent::Disconnected);
        true
    }
}

/// A receiver session with one camera
pub struct Session {
    config: SessionConfig,
    socket: Arc<UdpSocket>,
    shared: Arc<SessionShared>,
    peer: Option<SocketAddr>,
    keepalive: Option<JoinHandle<u64>>,
}

impl Session {
    /// Bind the configured address
    pub async fn bind(config: SessionConfig) -> Result<Self, SessionError> {
        let socket = bind_udp(config.bind_addr).await?;
        Ok(Self::from_socket(config, socket))
    }

    /// Use an already bound socket
    pub fn from_socket(config: SessionConfig, socket: UdpSocket) -> Self {
        Self {
            config,
            socket: Arc::new(socket),
            shared: Arc::new(SessionShared::new()),
            peer: None,
            keepalive: None,
        }
    }

    /// Emit [`SessionEvent`]s on `events`. Must be called before the handshake.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.events = Some(events),
            None => warn!("Session already running, event channel not attached"),
        }
        self
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.subscribe()
    }

    /// Camera address once known
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Local socket address
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Counter snapshot
    pub fn stats(&self) -> SessionStats {
        self.shared.counters.snapshot()
    }

    /// Run discovery (if no peer is configured) and the HELLO/ACK exchange.
    ///
    /// Single attempt. On failure the session is left `Disconnected` and no
    /// keepalive runs; use [`Session::retry`] to try again.
    pub async fn handshake(&mut self) -> Result<SocketAddr, HandshakeError> {
        let state = self.state();
        if state != SessionState::Idle {
            return Err(HandshakeError::NotIdle(state));
        }

        match self.try_handshake().await {
            Ok(peer) => {
                self.shared.set_state(SessionState::Connected);
                self.shared.counters.touch();
                self.peer = Some(peer);
                self.keepalive = Some(tokio::spawn(run_keepalive(
                    self.socket.clone(),
                    peer,
                    self.config.keepalive_interval,
                    self.shared.subscribe(),
                    self.shared.counters.clone(),
                )));
                info!("Connected to camera {}", peer);
                self.shared.emit(SessionEvent::Connected { peer });
                Ok(peer)
            }
            Err(e) => {
                warn!("Handshake failed: {}", e);
                self.shared.disconnect();
                Err(e)
            }
        }
    }

    async fn try_handshake(&mut self) -> Result<SocketAddr, HandshakeError> {
        let shared = &self.shared;
        let stray = |state| {
            move |from, len| shared.record_drop(DropReason::NotConnected { state, from, len })
        };

        let peer = match self.config.peer {
            Some(peer) => peer,
            None => {
                shared.set_state(SessionState::AwaitingDiscovery);
                await_discovery(
                    &self.socket,
                    self.config.discovery_timeout,
                    self.config.peer_port,
                    stray(SessionState::AwaitingDiscovery),
                )
                .await?
            }
        };

        self.peer = Some(peer);
        shared.set_state(SessionState::HelloSent);
        exchange_hello(&self.socket, peer, self.config.ack_timeout, stray(SessionState::HelloSent)).await?;
        Ok(peer)
    }

    /// Reset a disconnected session and run the handshake again
    pub async fn retry(&mut self) -> Result<SocketAddr, HandshakeError> {
        let state = self.state();
        if state != SessionState::Disconnected {
            return Err(HandshakeError::NotDisconnected(state));
        }
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }
        self.peer = None;
        self.shared.set_state(SessionState::Idle);
        self.handshake().await
    }

    /// Stop the session; the keepalive exits at its next wake-up
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    /// Spawn the receive loop feeding `queue`
    pub fn start(self, queue: Arc<FrameQueue>) -> Result<SessionHandle, SessionError> {
        let state = self.state();
        let peer = match (state, self.peer) {
            (SessionState::Connected, Some(peer)) => peer,
            _ => return Err(SessionError::NotConnected(state)),
        };

        let reassembler = Reassembler::new().with_stale_after(self.config.stale_after);
        let receive = ReceiveLoop::new(
            self.socket.clone(),
            peer,
            self.config.layout,
            self.config.buffer_size,
            reassembler,
            self.shared.clone(),
        );
        let receiver = tokio::spawn(receive.run(queue));

        Ok(SessionHandle {
            peer,
            commander: Arc::new(PeerCommander::new(self.socket.clone(), peer)),
            shared: self.shared,
            receiver,
            keepalive: self.keepalive,
        })
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Handle to a running session
#[derive(Debug)]
pub struct SessionHandle {
    peer: SocketAddr,
    commander: Arc<PeerCommander>,
    shared: Arc<SessionShared>,
    receiver: JoinHandle<()>,
    keepalive: Option<JoinHandle<u64>>,
}

impl SessionHandle {
    /// Camera address
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.subscribe()
    }

    /// Counter snapshot
    pub fn stats(&self) -> SessionStats {
        self.shared.counters.snapshot()
    }

    /// Sends directives to the camera over the session socket
    pub fn commander(&self) -> Arc<PeerCommander> {
        self.commander.clone()
    }

    /// Stop receiving; the frame queue is closed once the loop exits
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    /// Wait for the receive loop and keepalive to finish
    pub async fn join(self) -> SessionStats {
        if let Err(e) = self.receiver.await {
            warn!("Receive loop ended abnormally: {}", e);
        }
        if let Some(keepalive) = self.keepalive {
            match keepalive.await {
                Ok(sent) => debug!("Keepalive sent {} messages", sent),
                Err(e) => warn!("Keepalive ended abnormally: {}", e),
            }
        }
        self.shared.counters.snapshot()
    }
}
