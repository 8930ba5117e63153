//! Lock-free counters shared by the receive loop and keepalive task.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

const NO_AUX: u32 = u32::MAX;

/// Point-in-time view of session counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Datagrams received from the peer while connected
    pub datagrams_received: u64,
    /// Datagrams shorter than the header
    pub malformed_packets: u64,
    /// Per-fragment acknowledgments sent
    pub acks_sent: u64,
    /// Keepalive acknowledgments sent
    pub keepalives_sent: u64,
    /// Frames reassembled
    pub frames_completed: u64,
    /// Frames discarded by the reassembler
    pub frames_dropped: u64,
    /// Aux byte of the most recent completed frame
    pub last_aux: Option<u8>,
    /// Time since the peer was last heard from
    pub last_contact: Option<Duration>,
}

/// Shared session counters
#[derive(Debug)]
pub struct SessionCounters {
    epoch: Instant,
    datagrams_received: AtomicU64,
    malformed_packets: AtomicU64,
    acks_sent: AtomicU64,
    keepalives_sent: AtomicU64,
    frames_completed: AtomicU64,
    frames_dropped: AtomicU64,
    last_aux: AtomicU32,
    // Nanoseconds since `epoch`, zero until first contact
    last_contact_ns: AtomicU64,
}

impl SessionCounters {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            datagrams_received: AtomicU64::new(0),
            malformed_packets: AtomicU64::new(0),
            acks_sent: AtomicU64::new(0),
            keepalives_sent: AtomicU64::new(0),
            frames_completed: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            last_aux: AtomicU32::new(NO_AUX),
            last_contact_ns: AtomicU64::new(0),
        }
    }

    /// Record that the peer was heard from
    pub fn touch(&self) {
        let ns = self.epoch.elapsed().as_nanos().max(1) as u64;
        self.last_contact_ns.store(ns, Ordering::Relaxed);
    }

    /// Record a received datagram
    pub fn datagram_received(&self) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Record a malformed datagram
    pub fn malformed(&self) {
        self.malformed_packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a per-fragment acknowledgment
    pub fn ack_sent(&self) {
        self.acks_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a keepalive
    pub fn keepalive_sent(&self) {
        self.keepalives_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed frame
    pub fn frame_completed(&self, aux: Option<u8>) {
        self.frames_completed.fetch_add(1, Ordering::Relaxed);
        if let Some(aux) = aux {
            self.last_aux.store(aux as u32, Ordering::Relaxed);
        }
    }

    /// Record a dropped frame
    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot
    pub fn snapshot(&self) -> SessionStats {
        let last_aux = match self.last_aux.load(Ordering::Relaxed) {
            NO_AUX => None,
            aux => Some(aux as u8),
        };
        let last_contact = match self.last_contact_ns.load(Ordering::Relaxed) {
            0 => None,
            ns => Some(self.epoch.elapsed().saturating_sub(Duration::from_nanos(ns))),
        };

        SessionStats {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
            keepalives_sent: self.keepalives_sent.load(Ordering::Relaxed),
            frames_completed: self.frames_completed.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            last_aux,
            last_contact,
        }
    }
}

impl Default for SessionCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let counters = SessionCounters::new();
        let empty = counters.snapshot();
        assert_eq!(empty.last_aux, None);
        assert_eq!(empty.last_contact, None);

        counters.datagram_received();
        counters.ack_sent();
        counters.frame_completed(Some(0));
        counters.frame_completed(None);
        counters.frame_dropped();

        let stats = counters.snapshot();
        assert_eq!(stats.datagrams_received, 1);
        assert_eq!(stats.acks_sent, 1);
        assert_eq!(stats.frames_completed, 2);
        assert_eq!(stats.frames_dropped, 1);
        assert_eq!(stats.last_aux, Some(0));
        assert!(stats.last_contact.is_some());
    }
}
