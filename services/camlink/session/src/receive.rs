//! Receive-and-reassemble loop.
//!
//! Runs while the session is connected. Every datagram from the camera is
//! acknowledged before it is parsed, then treated as a data fragment. The
//! loop is the only owner of the reassembler and the only producer on the
//! frame queue. When it exits, for whatever cause, the session is moved to
//! `Disconnected` and the queue is closed.

use bytes::Bytes;
use camlink_delivery::{FrameQueue, PushOutcome};
use camlink_wire::{CompletedFrame, ControlMessage, DataFragment, HeaderLayout};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::reassembly::{DropReason, Reassembler, ReassemblyEvent};
use crate::session::{SessionEvent, SessionShared, SessionState};
use crate::transport::send_control;

/// Resolves once the state cell reads `Disconnected` or its sender is gone
pub(crate) async fn wait_disconnected(state: &mut watch::Receiver<SessionState>) {
    loop {
        if *state.borrow_and_update() == SessionState::Disconnected {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

pub(crate) struct ReceiveLoop {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    layout: HeaderLayout,
    buffer_size: usize,
    reassembler: Reassembler,
    shared: Arc<SessionShared>,
}

impl ReceiveLoop {
    pub(crate) fn new(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        layout: HeaderLayout,
        buffer_size: usize,
        reassembler: Reassembler,
        shared: Arc<SessionShared>,
    ) -> Self {
        Self {
            socket,
            peer,
            layout,
            buffer_size,
            reassembler,
            shared,
        }
    }

    pub(crate) async fn run(mut self, queue: Arc<FrameQueue>) {
        let mut state = self.shared.subscribe();
        let mut buf = vec![0u8; self.buffer_size.max(self.layout.header_len())];
        info!("Receiving frames from {}", self.peer);

        loop {
            let received = tokio::select! {
                biased;
                _ = wait_disconnected(&mut state) => break,
                received = self.socket.recv_from(&mut buf) => received,
            };

            let (len, from) = match received {
                Ok(received) => received,
                Err(e) => {
                    // ICMP unreachable from an earlier send surfaces here on some platforms
                    error!("Receive error: {}", e);
                    continue;
                }
            };

            if from.ip() != self.peer.ip() {
                debug!("Ignoring {} bytes from {}, not the camera", len, from);
                continue;
            }
            self.shared.counters.datagram_received();

            match send_control(&self.socket, self.peer, &ControlMessage::Ack).await {
                Ok(()) => self.shared.counters.ack_sent(),
                Err(e) => warn!("Failed to acknowledge fragment: {}", e),
            }

            let fragment = match DataFragment::decode(Bytes::copy_from_slice(&buf[..len]), self.layout) {
                Ok(fragment) => fragment,
                Err(e) => {
                    warn!("Discarding datagram from {}: {}", from, e);
                    self.shared.counters.malformed();
                    self.shared.emit(SessionEvent::MalformedPacket { from, len });
                    continue;
                }
            };
            trace!(
                "Fragment {}/{} ({} bytes)",
                fragment.header.fragment_index,
                fragment.header.total_fragments,
                fragment.payload.len()
            );

            let mut stop = false;
            for event in self.reassembler.push(fragment) {
                match event {
                    ReassemblyEvent::Dropped(reason) => self.shared.record_drop(reason),
                    ReassemblyEvent::Completed(frame) => {
                        if !self.deliver(frame, &queue, &mut state).await {
                            stop = true;
                            break;
                        }
                    }
                }
            }
            if stop {
                break;
            }
        }

        if let Some(reason) = self.reassembler.abandon() {
            self.shared.record_drop(reason);
        }
        // Stops the keepalive when the loop ended on a closed queue
        self.shared.disconnect();
        queue.close().await;
        info!("Receive loop for {} stopped", self.peer);
    }

    /// Queue a completed frame; false when the loop should stop
    async fn deliver(
        &self,
        frame: CompletedFrame,
        queue: &FrameQueue,
        state: &mut watch::Receiver<SessionState>,
    ) -> bool {
        let sequence = frame.sequence;
        let size = frame.len();
        let aux = frame.aux;
        debug!("Frame {} complete ({} bytes, aux={:?})", sequence, size, aux);

        let pushed = tokio::select! {
            biased;
            _ = wait_disconnected(state) => None,
            pushed = queue.push(frame) => Some(pushed),
        };

        let queued = match pushed {
            Some(Ok(PushOutcome::Queued)) => true,
            Some(Ok(PushOutcome::Evicted(evicted))) => {
                self.shared.record_drop(DropReason::Evicted { sequence: evicted });
                true
            }
            Some(Err(e)) => {
                info!("Stopping receive loop: {}", e);
                false
            }
            None => false,
        };

        if queued {
            self.shared.counters.frame_completed(aux);
            self.shared.emit(SessionEvent::FrameCompleted { sequence, size, aux });
        } else {
            self.shared.record_drop(DropReason::Undelivered { sequence });
        }
        queued
    }
}
