//! Bounded FIFO between the receive loop and the frame consumer.
//!
//! The queue is the only structure written by two tasks: the network receive
//! loop pushes, the consumer pops. A full queue makes `push` wait, which in
//! turn stalls the receive loop; datagrams arriving meanwhile are dropped by
//! the OS socket buffer rather than growing memory here.

use camlink_wire::CompletedFrame;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace};

/// Default number of frames held before backpressure applies
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// What `push` does when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait until the consumer frees a slot
    #[default]
    Block,
    /// Evict the oldest queued frame
    DropOldest,
}

/// Frame queue errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The queue was closed; no more frames are accepted
    #[error("frame queue closed")]
    Closed,
}

/// Result of a successful push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Frame appended
    Queued,
    /// Frame appended after evicting the frame with this sequence number
    Evicted(u64),
}

/// Counters for queue activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Frames accepted by `push`
    pub pushed: u64,
    /// Frames handed out by `pop`
    pub popped: u64,
    /// Frames evicted under [`OverflowPolicy::DropOldest`]
    pub evicted: u64,
    /// Largest queue length observed
    pub high_water: usize,
}

struct QueueState {
    frames: VecDeque<CompletedFrame>,
    closed: bool,
    stats: QueueStats,
}

/// Bounded frame queue with configurable overflow policy
pub struct FrameQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    policy: OverflowPolicy,
    not_empty: Notify,
    not_full: Notify,
}

impl FrameQueue {
    /// Create a new queue. A capacity of zero is treated as one.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::with_capacity(capacity),
                closed: false,
                stats: QueueStats::default(),
            }),
            capacity,
            policy,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Configured overflow policy
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Append a frame, waiting for space under [`OverflowPolicy::Block`]
    pub async fn push(&self, frame: CompletedFrame) -> Result<PushOutcome, QueueError> {
        loop {
            // Registered before the check so a pop between unlock and await is not missed
            let notified = self.not_full.notified();
            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Err(QueueError::Closed);
                }

                if state.frames.len() < self.capacity {
                    trace!("Queued frame {} ({} bytes)", frame.sequence, frame.len());
                    state.frames.push_back(frame);
                    state.stats.pushed += 1;
                    state.stats.high_water = state.stats.high_water.max(state.frames.len());
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(PushOutcome::Queued);
                }

                if self.policy == OverflowPolicy::DropOldest {
                    let evicted = state.frames.pop_front().map(|f| f.sequence).unwrap_or_default();
                    debug!("Queue full, evicted frame {} for frame {}", evicted, frame.sequence);
                    state.frames.push_back(frame);
                    state.stats.pushed += 1;
                    state.stats.evicted += 1;
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(PushOutcome::Evicted(evicted));
                }
            }

            trace!("Queue full, waiting for consumer");
            notified.await;
        }
    }

    /// Remove the oldest frame, waiting until one is available.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<CompletedFrame> {
        loop {
            let notified = self.not_empty.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(frame) = state.frames.pop_front() {
                    state.stats.popped += 1;
                    drop(state);
                    self.not_full.notify_one();
                    return Some(frame);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Remove the oldest frame without waiting
    pub async fn try_pop(&self) -> Option<CompletedFrame> {
        let mut state = self.state.lock().await;
        let frame = state.frames.pop_front();
        if frame.is_some() {
            state.stats.popped += 1;
            drop(state);
            self.not_full.notify_one();
        }
        frame
    }

    /// Stop accepting frames and wake every waiter.
    ///
    /// Frames already queued can still be popped.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if !state.closed {
            state.closed = true;
            debug!("Frame queue closed with {} frames pending", state.frames.len());
        }
        drop(state);
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Whether `close` has been called
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Number of frames currently queued
    pub async fn len(&self) -> usize {
        self.state.lock().await.frames.len()
    }

    /// Whether the queue is empty
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.frames.is_empty()
    }

    /// Snapshot of the queue counters
    pub async fn stats(&self) -> QueueStats {
        self.state.lock().await.stats.clone()
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY, OverflowPolicy::Block)
    }
}

impl std::fmt::Debug for FrameQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameQueue")
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn frame(sequence: u64) -> CompletedFrame {
        CompletedFrame::new(sequence, Bytes::from(vec![sequence as u8; 4]), None, 1)
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = FrameQueue::new(4, OverflowPolicy::Block);
        for seq in 1..=3 {
            assert_eq!(queue.push(frame(seq)).await.unwrap(), PushOutcome::Queued);
        }

        for seq in 1..=3 {
            assert_eq!(queue.pop().await.unwrap().sequence, seq);
        }
        assert!(queue.try_pop().await.is_none());
    }

    #[tokio::test]
    async fn test_push_blocks_at_capacity() {
        let queue = Arc::new(FrameQueue::new(1, OverflowPolicy::Block));
        queue.push(frame(1)).await.unwrap();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(frame(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished(), "push should wait while the queue is full");
        assert_eq!(queue.len().await, 1);

        assert_eq!(queue.pop().await.unwrap().sequence, 1);

        let pushed = timeout(Duration::from_secs(1), producer).await.unwrap().unwrap();
        assert_eq!(pushed.unwrap(), PushOutcome::Queued);
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.pop().await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn test_concurrent_producer_consumer_never_exceeds_capacity() {
        let queue = Arc::new(FrameQueue::new(1, OverflowPolicy::Block));

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                for seq in 1..=50 {
                    queue.push(frame(seq)).await.unwrap();
                }
                queue.close().await;
            })
        };

        let mut received = Vec::new();
        while let Some(frame) = timeout(Duration::from_secs(2), queue.pop()).await.unwrap() {
            received.push(frame.sequence);
        }
        producer.await.unwrap();

        assert_eq!(received, (1..=50).collect::<Vec<_>>());
        let stats = queue.stats().await;
        assert_eq!(stats.high_water, 1);
        assert_eq!(stats.pushed, 50);
        assert_eq!(stats.popped, 50);
    }

    #[tokio::test]
    async fn test_drop_oldest() {
        let queue = FrameQueue::new(2, OverflowPolicy::DropOldest);
        queue.push(frame(1)).await.unwrap();
        queue.push(frame(2)).await.unwrap();
        assert_eq!(queue.push(frame(3)).await.unwrap(), PushOutcome::Evicted(1));

        assert_eq!(queue.len().await, 2);
        assert_eq!(queue.pop().await.unwrap().sequence, 2);
        assert_eq!(queue.pop().await.unwrap().sequence, 3);
        assert_eq!(queue.stats().await.evicted, 1);
    }

    #[tokio::test]
    async fn test_close_wakes_consumer_and_rejects_push() {
        let queue = Arc::new(FrameQueue::default());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close().await;

        let popped = timeout(Duration::from_secs(1), consumer).await.unwrap().unwrap();
        assert!(popped.is_none());
        assert_eq!(queue.push(frame(1)).await.unwrap_err(), QueueError::Closed);
    }

    #[tokio::test]
    async fn test_close_drains_pending_frames() {
        let queue = FrameQueue::new(3, OverflowPolicy::Block);
        queue.push(frame(1)).await.unwrap();
        queue.close().await;

        assert!(queue.is_closed().await);
        assert_eq!(queue.pop().await.unwrap().sequence, 1);
        assert!(queue.pop().await.is_none());
    }

    #[test]
    fn test_zero_capacity_is_one() {
        assert_eq!(FrameQueue::new(0, OverflowPolicy::Block).capacity(), 1);
    }
}
