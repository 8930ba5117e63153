//! Bounded frame queue, consumer adapters, and alert broadcasts for camlink.
//!
//! This crate sits downstream of reassembly. Completed frames are pushed into a
//! bounded [`FrameQueue`] by the network receive loop and popped by a
//! [`ConsumerLoop`], which decodes each frame, hands it to a [`FrameSink`], and
//! forwards any directives the sink derives (LED level, alerts) through a
//! [`CommandSink`].
//!
//! ## Features
//!
//! - **Backpressure**: `push` waits while the queue is full (or evicts the
//!   oldest frame under [`OverflowPolicy::DropOldest`])
//! - **Pluggable decoding**: the core never decodes pixels; [`JpegProbe`]
//!   only validates markers and reads dimensions
//! - **Recording**: [`RecordingSink`] stores raw JPEG frames on disk
//! - **Alerts**: subnet broadcast of sleepiness alerts and camera directives

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod alert;
pub mod consumer;
pub mod queue;

pub use alert::{AlertBroadcaster, AlertListener};
pub use consumer::{
    BrightnessFeedback, CommandSink, ConsumerLoop, ConsumerStats, DecodeError, FrameDecoder,
    FrameSink, JpegInfo, JpegProbe, LoggingSink, Luminance, RecordingSink,
};
pub use queue::{
    FrameQueue, OverflowPolicy, PushOutcome, QueueError, QueueStats, DEFAULT_QUEUE_CAPACITY,
};
