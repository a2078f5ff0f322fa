// src/feed/channel.rs - Per-channel feed state machine
//
// AwaitingCodec -> Feeding <-> Draining -> Error -> (resubscribe) -> AwaitingCodec
//                                       \-> Terminated
//
// Core features:
// - Feed gate: at most one outstanding sink operation per channel
// - Trim and drift correction after every completed append
// - Append liveness timeout detects a wedged sink
// - Stale sink signals rejected by token generation

use crate::error::{Error, Result};
use crate::feed::config::{FeedConfig, PlaybackPolicy};
use crate::feed::frame_queue::{FrameQueue, PushOutcome};
use crate::feed::playback::{plan_drift, plan_trim};
use crate::feed::protocol::ChannelId;
use crate::feed::sink::{MediaSink, SinkAdapter, SinkInit, SinkNotifier};
use bytes::Bytes;
use log::{debug, info, warn};
use std::time::{Duration, Instant};

// ============================================================================
// Channel Token - Prevents stale sink signals after resubscription
// ============================================================================

/// Channel token - channel id plus generation counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelToken {
    pub id: ChannelId,
    /// Incremented each time the id is subscribed again
    pub generation: u32,
}

impl ChannelToken {
    pub fn new(id: ChannelId, generation: u32) -> Self {
        Self { id, generation }
    }
}

// ============================================================================
// Channel State Machine
// ============================================================================

/// Channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Subscribed, waiting for the codec acknowledgement or for the sink to open
    AwaitingCodec,
    /// Gate open, next chunk is delivered as soon as it arrives
    Feeding,
    /// A sink operation is outstanding, gate closed
    Draining,
    /// Delivery failed, waiting for reset
    Error,
    /// Codec unsupported or channel torn down
    Terminated,
}

impl ChannelState {
    pub fn accepts_chunks(&self) -> bool {
        matches!(
            self,
            ChannelState::AwaitingCodec | ChannelState::Feeding | ChannelState::Draining
        )
    }

    pub fn is_live(&self) -> bool {
        matches!(self, ChannelState::Feeding | ChannelState::Draining)
    }
}

/// Outstanding sink operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingOp {
    Append,
    Remove,
}

/// Snapshot of a channel's counters
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStats {
    pub state: ChannelState,
    pub queued_chunks: usize,
    pub queued_bytes: usize,
    /// How long the oldest queued chunk has been waiting
    pub oldest_pending: Option<Duration>,
    pub appended_chunks: u64,
    pub dropped_chunks: u64,
    pub removals: u64,
    pub seeks: u64,
}

/// Result of enqueueing a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Queued,
    /// Queued, older chunks evicted to make room
    Evicted(usize),
    /// Chunk discarded (channel not accepting data, or too large)
    Discarded,
}

/// Single channel feeder
pub struct ChannelFeeder {
    token: ChannelToken,
    /// Render target named by the subscription
    target: String,
    state: ChannelState,
    queue: FrameQueue,
    sink: Option<SinkAdapter>,
    /// Gate: true only when the sink may accept another chunk
    feed_enabled: bool,
    pending: Option<PendingOp>,
    pending_since: Option<Instant>,
    policy: PlaybackPolicy,
    appended_chunks: u64,
    removals: u64,
    seeks: u64,
}

impl ChannelFeeder {
    pub fn new(token: ChannelToken, target: impl Into<String>, config: &FeedConfig) -> Self {
        Self {
            token,
            target: target.into(),
            state: ChannelState::AwaitingCodec,
            queue: FrameQueue::new(config.queue),
            sink: None,
            feed_enabled: false,
            pending: None,
            pending_since: None,
            policy: config.playback,
            appended_chunks: 0,
            removals: 0,
            seeks: 0,
        }
    }

    pub fn token(&self) -> ChannelToken {
        self.token
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_feed_enabled(&self) -> bool {
        self.feed_enabled
    }

    pub fn has_outstanding_operation(&self) -> bool {
        self.pending.is_some()
    }

    pub fn mime(&self) -> Option<&str> {
        self.sink.as_ref().and_then(|s| s.mime())
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            state: self.state,
            queued_chunks: self.queue.len(),
            queued_bytes: self.queue.pending_bytes(),
            oldest_pending: self.queue.oldest_age(),
            appended_chunks: self.appended_chunks,
            dropped_chunks: self.queue.dropped_chunks(),
            removals: self.removals,
            seeks: self.seeks,
        }
    }

    /// Initialize the channel's sink for `mime`.
    ///
    /// A channel that was already live gets a fresh sink and loses its queued
    /// chunks, which belong to the previous stream.
    pub fn init(&mut self, mime: &str, sink: Box<dyn MediaSink>, notifier: SinkNotifier) -> Result<()> {
        if self.state == ChannelState::Terminated {
            debug!("Channel {} terminated, ignoring codec {}", self.token.id, mime);
            return Ok(());
        }

        if self.state.is_live() || self.state == ChannelState::Error {
            let discarded = self.queue.clear();
            debug!(
                "Channel {} re-initialized, discarded {} queued chunks",
                self.token.id, discarded
            );
        }
        self.release_sink();
        self.feed_enabled = false;
        self.pending = None;
        self.pending_since = None;
        self.state = ChannelState::AwaitingCodec;

        info!("Channel {} starting [{}]", self.token.id, mime);
        let mut adapter = SinkAdapter::new(self.token, sink);
        match adapter.initialize(mime, notifier) {
            SinkInit::Unsupported => {
                self.state = ChannelState::Terminated;
                self.queue.clear();
                Err(Error::UnsupportedCodec {
                    channel: self.token.id,
                    mime: mime.to_string(),
                })
            }
            SinkInit::Pending => {
                self.sink = Some(adapter);
                Ok(())
            }
            SinkInit::Ready => {
                self.sink = Some(adapter);
                self.on_source_open()
            }
        }
    }

    /// Sink source opened: open the gate and start delivery.
    pub fn on_source_open(&mut self) -> Result<()> {
        if self.sink.is_none() || self.state != ChannelState::AwaitingCodec {
            debug!("Channel {} ignoring source open in state {:?}", self.token.id, self.state);
            return Ok(());
        }
        self.state = ChannelState::Feeding;
        self.feed_enabled = true;
        self.feed_next()
    }

    /// Enqueue a chunk and deliver it if the gate is open.
    pub fn push_chunk(&mut self, data: Bytes) -> Result<EnqueueResult> {
        if !self.state.accepts_chunks() {
            return Ok(EnqueueResult::Discarded);
        }

        let result = match self.queue.push(data) {
            PushOutcome::Queued => EnqueueResult::Queued,
            PushOutcome::QueuedWithEviction { dropped } => {
                debug!("Channel {} evicted {} stale chunks", self.token.id, dropped);
                EnqueueResult::Evicted(dropped)
            }
            PushOutcome::Rejected => {
                warn!("Channel {} frame queue full, chunk discarded", self.token.id);
                return Ok(EnqueueResult::Discarded);
            }
        };

        if self.feed_enabled {
            self.feed_next()?;
        }
        Ok(result)
    }

    /// Deliver the oldest chunk if the gate is open and the sink is idle.
    pub fn feed_next(&mut self) -> Result<()> {
        if !self.feed_enabled || self.queue.is_empty() {
            return Ok(());
        }
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        if sink.is_busy() {
            return Ok(());
        }

        let Some(chunk) = self.queue.pop() else {
            return Ok(());
        };

        // Gate closes before the append is issued
        self.feed_enabled = false;
        match sink.append(chunk) {
            Ok(()) => {
                self.appended_chunks += 1;
                self.begin(PendingOp::Append);
                Ok(())
            }
            Err(e) => {
                self.fail();
                Err(e)
            }
        }
    }

    /// The outstanding sink operation completed: trim, correct drift, reopen the gate.
    pub fn on_update_end(&mut self) -> Result<()> {
        if self.pending.take().is_none() {
            debug!("Channel {} update end without outstanding operation", self.token.id);
            return Ok(());
        }
        self.pending_since = None;

        if self.request_trim() {
            return Ok(());
        }
        self.correct_drift();

        self.state = ChannelState::Feeding;
        self.feed_enabled = true;
        self.feed_next()
    }

    /// The outstanding sink operation failed asynchronously.
    pub fn on_sink_error(&mut self, reason: &str) -> Result<()> {
        if !self.state.is_live() {
            debug!("Channel {} sink error in state {:?}: {}", self.token.id, self.state, reason);
            return Ok(());
        }
        self.fail();
        Err(Error::AppendRejected {
            channel: self.token.id,
            reason: reason.to_string(),
        })
    }

    /// Whether an operation has been outstanding longer than `timeout`.
    pub fn is_wedged(&self, timeout: Duration) -> bool {
        self.pending_since
            .map(|since| since.elapsed() > timeout)
            .unwrap_or(false)
    }

    /// Fail a wedged channel.
    pub fn expire(&mut self) -> Error {
        self.fail();
        Error::AppendRejected {
            channel: self.token.id,
            reason: "sink did not complete the outstanding operation in time".to_string(),
        }
    }

    /// Transport lost: drop pending data and wait for a new codec acknowledgement.
    pub fn stall(&mut self) {
        if self.state == ChannelState::Terminated {
            return;
        }
        self.queue.clear();
        self.feed_enabled = false;
        self.pending = None;
        self.pending_since = None;
        self.release_sink();
        self.state = ChannelState::AwaitingCodec;
    }

    /// Tear the channel down. No further chunk is accepted.
    pub fn terminate(&mut self) {
        self.queue.clear();
        self.feed_enabled = false;
        self.pending = None;
        self.pending_since = None;
        self.release_sink();
        self.state = ChannelState::Terminated;
    }

    fn begin(&mut self, op: PendingOp) {
        self.pending = Some(op);
        self.pending_since = Some(Instant::now());
        self.state = ChannelState::Draining;
    }

    fn fail(&mut self) {
        let discarded = self.queue.clear();
        self.feed_enabled = false;
        self.pending = None;
        self.pending_since = None;
        self.state = ChannelState::Error;
        debug!("Channel {} failed, discarded {} queued chunks", self.token.id, discarded);
    }

    fn release_sink(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            sink.detach();
        }
    }

    /// Returns true if a removal is now outstanding.
    fn request_trim(&mut self) -> bool {
        let Some(sink) = self.sink.as_mut() else {
            return false;
        };
        if sink.is_busy() {
            return false;
        }
        let ranges = sink.buffered_ranges();
        let current = sink.current_position();
        let Some(removal) = plan_trim(&ranges, current, &self.policy) else {
            return false;
        };

        match sink.request_removal(removal.start, removal.end) {
            Ok(()) => {
                debug!(
                    "Channel {} removing [{:.3}, {:.3}] ({:?}), current {:.3}",
                    self.token.id, removal.start, removal.end, removal.reason, current
                );
                self.removals += 1;
                self.begin(PendingOp::Remove);
                true
            }
            Err(e) => {
                warn!("Channel {} buffer removal failed: {}", self.token.id, e);
                false
            }
        }
    }

    fn correct_drift(&mut self) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        if sink.is_busy() {
            return;
        }
        let ranges = sink.buffered_ranges();
        let current = sink.current_position();
        if let Some(target) = plan_drift(&ranges, current, &self.policy) {
            debug!(
                "Channel {} playback drifted, seeking {:.3} -> {:.3}",
                self.token.id, current, target
            );
            sink.seek(target);
            self.seeks += 1;
        }
    }
}
