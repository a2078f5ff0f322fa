//! The **feed** module drives live fMP4 video from a message transport into playback
//! sinks. One connection carries several independent channels; each channel has its
//! own frame queue, sink and pacing state, and failures stay inside the channel that
//! caused them.
//!
//! # Architecture
//!
//! A single-thread event loop (`ConnectionSupervisor`) consumes one queue of events:
//! transport frames, sink completion signals and commands from `FeedHandle`s.
//!
//! ## Key Components
//!
//! - `ConnectionSupervisor`: transport lifecycle, subscription replay, recovery
//! - `MultiplexRouter`: channel registry, control envelopes, binary demultiplexing
//! - `ChannelFeeder`: per-channel state machine pacing chunks into the sink
//! - `FrameQueue`: bounded FIFO of pending chunks with backpressure levels
//! - `SinkAdapter`: wraps a `MediaSink` (e.g. a Media Source Extensions source buffer)
//!
//! ## Wire Format
//!
//! | Frame | Multiplexed | Single channel |
//! |-------|-------------|----------------|
//! | Text | `{"type", "channel", "content"}` JSON envelope | Envelope without `channel`, or a bare codec string |
//! | Binary | 4-byte big-endian channel id + fMP4 chunk | fMP4 chunk |
//!
//! ## Channel Pacing
//!
//! At most one append or removal is outstanding per channel. After each completion:
//!
//! | Step | Condition | Action |
//! |------|-----------|--------|
//! | Trim | buffered span > 47000 | remove everything after the first range (+10), keep at most 47000 |
//! | Trim | playback > 120 past the first range, live edge ahead | remove up to `min(last.end - 10, playback)` |
//! | Drift | `\|last.end - playback\| >= 1.8` | seek to `last.end - 0.01` |
//!
//! ## Recovery
//!
//! | Failure | Multiplexed | Single channel |
//! |---------|-------------|----------------|
//! | Unsupported codec | Channel terminated, reported | Channel terminated, reported |
//! | Append rejected / sink wedged | UNSUBSCRIBE + SUBSCRIBE that channel | Reconnect, replay subscription |
//! | Transport closed | Channels stall until reopened | Reconnect after `reconnect_delay` |
//!
//! ## Backpressure Management
//!
//! | Level | Threshold | Behavior |
//! |-------|-----------|----------|
//! | Normal | < 8MB | All chunks enqueued |
//! | Warning | 8-32MB | Enqueued, backlog logged once |
//! | Critical | ≥ 32MB or 2048 chunks | Oldest chunks evicted, init segments kept |
//!
//! # Example
//!
//! ```rust,ignore
//! let mut supervisor = ConnectionSupervisor::builder()
//!     .url("ws://localhost:8080/live")
//!     .config(FeedConfig::multiplexed())
//!     .connector(WsConnector::new())
//!     .sink_factory(|channel: ChannelId, target: &str| -> Box<dyn MediaSink> {
//!         Box::new(MyPlayerSink::new(channel, target))
//!     })
//!     .build()?;
//!
//! supervisor.subscribe(Subscription::new(1, "video1", "rtsp://camera-1/stream"))?;
//! supervisor.subscribe(Subscription::new(2, "video2", "rtsp://camera-2/stream"))?;
//!
//! let handle = supervisor.handle();
//! let events = supervisor.feed_events();
//! std::thread::spawn(move || {
//!     for event in events {
//!         println!("{:?}", event);
//!     }
//! });
//!
//! // Blocks until `handle.stop()` is called from another thread
//! supervisor.run()?;
//! ```
//!
//! **Feature Flag**: `WsConnector` is only available when the `websocket` feature is enabled.

pub mod channel;
pub mod config;
pub mod frame_queue;
pub mod playback;
pub mod protocol;
pub mod router;
pub mod sink;
pub mod supervisor;
pub mod transport;
#[cfg(feature = "websocket")]
pub mod ws;

#[cfg(test)]
mod test_support;

pub use channel::{ChannelState, ChannelStats, ChannelToken};
pub use config::{FeedConfig, PlaybackPolicy, QueueLimits};
pub use protocol::{ChannelId, ChannelMode};
pub use sink::{BufferedRanges, MediaSink, SinkFactory, SinkNotifier, SinkReadiness, SinkSignal, TimeRange};
pub use supervisor::{ConnectionSupervisor, FeedEvent, FeedHandle, Subscription, SupervisorBuilder};
pub use transport::{Connector, Transport, TransportEvent, TransportEvents};
#[cfg(feature = "websocket")]
pub use ws::WsConnector;
