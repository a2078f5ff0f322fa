//! Playback sink boundary.
//!
//! [`MediaSink`] is the collaborator interface a player implements (a Media Source
//! Extensions source buffer, a native decoder queue, a test double). [`SinkAdapter`]
//! wraps one sink for one channel and translates its readiness and error signals
//! into the feeder's vocabulary.

use crate::error::{Error, SinkError};
use crate::feed::channel::ChannelToken;
use crate::feed::protocol::ChannelId;
use crate::feed::supervisor::SupervisorEvent;
use bytes::Bytes;
use log::debug;

/// A buffered time interval `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }
}

/// Ordered, non-overlapping ranges retained by the sink.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferedRanges {
    ranges: Vec<TimeRange>,
}

impl BufferedRanges {
    /// Build from arbitrary ranges; sorts and merges overlaps.
    pub fn from_ranges(mut ranges: Vec<TimeRange>) -> Self {
        ranges.retain(|r| r.end >= r.start);
        ranges.sort_by(|a, b| a.start.total_cmp(&b.start));

        let mut merged: Vec<TimeRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if range.start <= last.end => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }
        Self { ranges: merged }
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn first(&self) -> Option<TimeRange> {
        self.ranges.first().copied()
    }

    pub fn last(&self) -> Option<TimeRange> {
        self.ranges.last().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimeRange> {
        self.ranges.iter()
    }

    /// Distance between the earliest start and the latest end.
    pub fn span(&self) -> f64 {
        match (self.first(), self.last()) {
            (Some(first), Some(last)) => (last.end - first.start).abs(),
            _ => 0.0,
        }
    }

    /// Remove `[start, end]`, splitting ranges that straddle it.
    pub fn remove(&mut self, start: f64, end: f64) {
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for range in self.ranges.drain(..) {
            if range.end <= start || range.start >= end {
                kept.push(range);
                continue;
            }
            if range.start < start {
                kept.push(TimeRange::new(range.start, start));
            }
            if range.end > end {
                kept.push(TimeRange::new(end, range.end));
            }
        }
        self.ranges = kept;
    }
}

impl From<Vec<(f64, f64)>> for BufferedRanges {
    fn from(ranges: Vec<(f64, f64)>) -> Self {
        Self::from_ranges(ranges.into_iter().map(|(s, e)| TimeRange::new(s, e)).collect())
    }
}

/// Whether a sink can take data right after `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkReadiness {
    /// Source buffer created, appends may start.
    Ready,
    /// Source is opening; the sink sends [`SinkSignal::SourceOpen`] when ready.
    Pending,
}

/// Asynchronous notifications from a sink.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkSignal {
    /// The source opened and appends may start.
    SourceOpen,
    /// The outstanding append or removal finished.
    UpdateEnd,
    /// The outstanding operation failed.
    Error(String),
}

/// Posts sink signals back to the feed loop, tagged with the channel token so
/// signals from a torn-down channel are ignored.
#[derive(Clone)]
pub struct SinkNotifier {
    token: ChannelToken,
    sender: crossbeam_channel::Sender<SupervisorEvent>,
}

impl SinkNotifier {
    pub(crate) fn new(token: ChannelToken, sender: crossbeam_channel::Sender<SupervisorEvent>) -> Self {
        Self { token, sender }
    }

    pub fn token(&self) -> ChannelToken {
        self.token
    }

    /// Returns false if the feed loop is gone.
    pub fn notify(&self, signal: SinkSignal) -> bool {
        self.sender
            .send(SupervisorEvent::Sink {
                token: self.token,
                signal,
            })
            .is_ok()
    }

    pub fn source_open(&self) -> bool {
        self.notify(SinkSignal::SourceOpen)
    }

    pub fn update_end(&self) -> bool {
        self.notify(SinkSignal::UpdateEnd)
    }

    pub fn error(&self, reason: impl Into<String>) -> bool {
        self.notify(SinkSignal::Error(reason.into()))
    }
}

/// Playback sink collaborator.
///
/// Mirrors a media source plus one source buffer: appends and removals are
/// asynchronous and complete with [`SinkSignal::UpdateEnd`] through the notifier
/// handed to [`open`](MediaSink::open).
pub trait MediaSink {
    /// Whether the sink can play `mime` (`container; codecs="..."`).
    fn is_type_supported(&self, mime: &str) -> bool;

    /// Create the source and its buffer for `mime`.
    fn open(&mut self, mime: &str, notifier: SinkNotifier) -> Result<SinkReadiness, SinkError>;

    /// Start appending one chunk. Errors here are synchronous rejections.
    fn append_buffer(&mut self, chunk: Bytes) -> Result<(), SinkError>;

    /// Whether an append or removal is in progress.
    fn updating(&self) -> bool;

    fn buffered(&self) -> BufferedRanges;

    /// Start removing `[start, end]` from the buffer.
    fn remove(&mut self, start: f64, end: f64) -> Result<(), SinkError>;

    fn current_time(&self) -> f64;

    fn set_current_time(&mut self, time: f64);

    /// Release the source. Called when the channel is torn down or re-initialized.
    fn detach(&mut self) {}
}

/// Creates one sink per channel.
pub trait SinkFactory {
    /// `target` is the render target the subscription names (e.g. a video element id).
    fn create_sink(&mut self, channel: ChannelId, target: &str) -> Box<dyn MediaSink>;
}

impl<F> SinkFactory for F
where
    F: FnMut(ChannelId, &str) -> Box<dyn MediaSink>,
{
    fn create_sink(&mut self, channel: ChannelId, target: &str) -> Box<dyn MediaSink> {
        self(channel, target)
    }
}

/// Result of initializing a sink with a codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkInit {
    Ready,
    Pending,
    Unsupported,
}

/// Wraps a channel's sink.
pub struct SinkAdapter {
    token: ChannelToken,
    sink: Box<dyn MediaSink>,
    mime: Option<String>,
}

impl SinkAdapter {
    pub fn new(token: ChannelToken, sink: Box<dyn MediaSink>) -> Self {
        Self {
            token,
            sink,
            mime: None,
        }
    }

    /// Open the sink for `mime`.
    ///
    /// `Unsupported` covers both an unplayable type and a sink that fails to open.
    pub fn initialize(&mut self, mime: &str, notifier: SinkNotifier) -> SinkInit {
        if !self.sink.is_type_supported(mime) {
            return SinkInit::Unsupported;
        }
        match self.sink.open(mime, notifier) {
            Ok(readiness) => {
                self.mime = Some(mime.to_string());
                match readiness {
                    SinkReadiness::Ready => SinkInit::Ready,
                    SinkReadiness::Pending => SinkInit::Pending,
                }
            }
            Err(e) => {
                debug!("Channel {} sink failed to open {}: {}", self.token.id, mime, e);
                SinkInit::Unsupported
            }
        }
    }

    pub fn mime(&self) -> Option<&str> {
        self.mime.as_deref()
    }

    /// Start an append; a synchronous failure maps to [`Error::AppendRejected`].
    pub fn append(&mut self, chunk: Bytes) -> Result<(), Error> {
        self.sink
            .append_buffer(chunk)
            .map_err(|e| Error::AppendRejected {
                channel: self.token.id,
                reason: e.to_string(),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.sink.updating()
    }

    pub fn buffered_ranges(&self) -> BufferedRanges {
        self.sink.buffered()
    }

    pub fn current_position(&self) -> f64 {
        self.sink.current_time()
    }

    pub fn seek(&mut self, time: f64) {
        self.sink.set_current_time(time);
    }

    pub fn request_removal(&mut self, start: f64, end: f64) -> Result<(), SinkError> {
        if !(end > start) {
            return Err(SinkError::InvalidRange { start, end });
        }
        self.sink.remove(start, end)
    }

    pub fn detach(&mut self) {
        self.sink.detach();
    }
}
