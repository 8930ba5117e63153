//! Frame reassembly from data fragments.
//!
//! Only one frame is ever in flight. A fragment with index 0 always starts a
//! new frame, discarding whatever was being assembled. Completion is decided
//! by counting distinct indices: once the count reaches the announced total
//! the payloads are concatenated in index order, and the frame is dropped if
//! any index in `0..total` turns out to be absent.

use bytes::{Bytes, BytesMut};
use camlink_wire::{CompletedFrame, DataFragment};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::session::SessionState;

/// Why an in-flight frame was discarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Fragment count reached the total but this index was never seen
    MissingFragment {
        /// First absent index
        index: u16,
        /// Announced fragment total
        expected: u16,
    },
    /// A new frame started before this one completed
    Superseded {
        /// Distinct fragments held when the frame was discarded
        received: usize,
        /// Announced fragment total
        expected: u16,
    },
    /// Fragment 0 announced a total of zero
    EmptyFrame,
    /// The frame was in flight longer than the configured bound
    Stale {
        /// Age of the frame when dropped
        age: Duration,
        /// Distinct fragments held when the frame was discarded
        received: usize,
        /// Announced fragment total
        expected: u16,
    },
    /// The session ended with the frame still incomplete
    Abandoned {
        /// Distinct fragments held when the frame was discarded
        received: usize,
        /// Announced fragment total
        expected: u16,
    },
    /// A datagram arrived before the session was connected
    NotConnected {
        /// State when it arrived
        state: SessionState,
        /// Sender
        from: SocketAddr,
        /// Datagram length
        len: usize,
    },
    /// A completed frame was evicted from a full queue
    Evicted {
        /// Sequence number of the evicted frame
        sequence: u64,
    },
    /// A completed frame could not be queued because the session ended
    Undelivered {
        /// Sequence number of the lost frame
        sequence: u64,
    },
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::MissingFragment { index, expected } => {
                write!(f, "fragment {} of {} missing", index, expected)
            }
            DropReason::Superseded { received, expected } => {
                write!(f, "superseded with {}/{} fragments", received, expected)
            }
            DropReason::EmptyFrame => f.write_str("frame announced zero fragments"),
            DropReason::Stale { age, received, expected } => {
                write!(f, "stale after {:?} with {}/{} fragments", age, received, expected)
            }
            DropReason::Abandoned { received, expected } => {
                write!(f, "abandoned with {}/{} fragments", received, expected)
            }
            DropReason::NotConnected { state, from, len } => {
                write!(f, "{} byte datagram from {} while {}", len, from, state)
            }
            DropReason::Evicted { sequence } => write!(f, "frame {} evicted from full queue", sequence),
            DropReason::Undelivered { sequence } => write!(f, "frame {} not queued, session ended", sequence),
        }
    }
}

/// Output of feeding one fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyEvent {
    /// A frame was completed
    Completed(CompletedFrame),
    /// An in-flight frame was discarded
    Dropped(DropReason),
}

#[derive(Debug)]
struct InFlightFrame {
    expected: u16,
    fragments: BTreeMap<u16, Bytes>,
    aux: Option<u8>,
    started_at: Instant,
}

impl InFlightFrame {
    fn new(expected: u16, aux: Option<u8>, started_at: Instant) -> Self {
        Self {
            expected,
            fragments: BTreeMap::new(),
            aux,
            started_at,
        }
    }

    fn assemble(&self) -> Result<Bytes, u16> {
        let size = self.fragments.values().map(Bytes::len).sum();
        let mut buf = BytesMut::with_capacity(size);
        for index in 0..self.expected {
            let payload = self.fragments.get(&index).ok_or(index)?;
            buf.extend_from_slice(payload);
        }
        Ok(buf.freeze())
    }
}

/// Single-frame reassembler owned by the receive loop
#[derive(Debug)]
pub struct Reassembler {
    in_flight: Option<InFlightFrame>,
    next_sequence: u64,
    stale_after: Option<Duration>,
}

impl Reassembler {
    /// Create a reassembler that waits indefinitely for missing fragments
    pub fn new() -> Self {
        Self {
            in_flight: None,
            next_sequence: 1,
            stale_after: None,
        }
    }

    /// Drop frames older than `bound` when their next fragment arrives
    pub fn with_stale_after(mut self, bound: Option<Duration>) -> Self {
        self.stale_after = bound;
        self
    }

    /// Distinct fragments held and the announced total, if a frame is in flight
    pub fn progress(&self) -> Option<(usize, u16)> {
        self.in_flight
            .as_ref()
            .map(|frame| (frame.fragments.len(), frame.expected))
    }

    /// Feed one fragment
    pub fn push(&mut self, fragment: DataFragment) -> Vec<ReassemblyEvent> {
        self.push_at(fragment, Instant::now())
    }

    /// Feed one fragment observed at `now`
    pub fn push_at(&mut self, fragment: DataFragment, now: Instant) -> Vec<ReassemblyEvent> {
        let mut events = Vec::new();
        let header = fragment.header;

        if header.fragment_index == 0 {
            if let Some(previous) = self.in_flight.take() {
                debug!(
                    "Frame superseded with {}/{} fragments",
                    previous.fragments.len(),
                    previous.expected
                );
                events.push(ReassemblyEvent::Dropped(DropReason::Superseded {
                    received: previous.fragments.len(),
                    expected: previous.expected,
                }));
            }
            if header.total_fragments == 0 {
                events.push(ReassemblyEvent::Dropped(DropReason::EmptyFrame));
                return events;
            }
            trace!("Starting frame of {} fragments", header.total_fragments);
            self.in_flight = Some(InFlightFrame::new(header.total_fragments, header.aux, now));
        } else if let (Some(frame), Some(bound)) = (&self.in_flight, self.stale_after) {
            let age = now.saturating_duration_since(frame.started_at);
            if age > bound {
                events.push(ReassemblyEvent::Dropped(DropReason::Stale {
                    age,
                    received: frame.fragments.len(),
                    expected: frame.expected,
                }));
                self.in_flight = None;
                return events;
            }
        }

        let Some(frame) = self.in_flight.as_mut() else {
            trace!("No frame in flight, ignoring fragment {}", header.fragment_index);
            return events;
        };

        frame.fragments.insert(header.fragment_index, fragment.payload);
        if frame.fragments.len() < frame.expected as usize {
            return events;
        }

        let Some(frame) = self.in_flight.take() else {
            return events;
        };
        match frame.assemble() {
            Ok(bytes) => {
                let sequence = self.next_sequence;
                self.next_sequence += 1;
                events.push(ReassemblyEvent::Completed(CompletedFrame::new(
                    sequence,
                    bytes,
                    frame.aux,
                    frame.expected,
                )));
            }
            Err(index) => {
                events.push(ReassemblyEvent::Dropped(DropReason::MissingFragment {
                    index,
                    expected: frame.expected,
                }));
            }
        }
        events
    }

    /// Discard the in-flight frame, reporting it if there was one
    pub fn abandon(&mut self) -> Option<DropReason> {
        self.in_flight.take().map(|frame| DropReason::Abandoned {
            received: frame.fragments.len(),
            expected: frame.expected,
        })
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}
