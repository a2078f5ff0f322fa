use crate::feed::protocol::ChannelMode;
use std::time::Duration;

// Buffer policy defaults, in sink time units (seconds for MSE)
const DEFAULT_DISCONTINUITY_THRESHOLD: f64 = 47000.0;
const DEFAULT_RETENTION_WINDOW: f64 = 120.0;
const DEFAULT_OVERFLOW_MARGIN: f64 = 10.0;
const DEFAULT_TRAILING_MARGIN: f64 = 10.0;
const DEFAULT_DRIFT_THRESHOLD: f64 = 1.8;
const DEFAULT_SEEK_BACK: f64 = 0.01;

// Queue bounds
const DEFAULT_QUEUE_WARN_BYTES: usize = 8 * 1024 * 1024; // 8MB warning
const DEFAULT_QUEUE_MAX_BYTES: usize = 32 * 1024 * 1024; // 32MB drop-oldest
const DEFAULT_QUEUE_MAX_CHUNKS: usize = 2048;

const DEFAULT_APPEND_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 2000;

/// Thresholds governing trimming and drift correction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackPolicy {
    /// Buffered span beyond which timestamps are treated as having jumped.
    pub discontinuity_threshold: f64,
    /// How far playback may run past the earliest retained point before trimming.
    pub retention_window: f64,
    /// Gap kept after the first range when repairing a discontinuity.
    pub overflow_margin: f64,
    /// Data kept behind the latest buffered point when trimming normally.
    pub trailing_margin: f64,
    /// Distance between playback and the live edge that triggers a seek.
    pub drift_threshold: f64,
    /// How far behind the live edge a drift seek lands.
    pub seek_back: f64,
}

impl Default for PlaybackPolicy {
    fn default() -> Self {
        Self {
            discontinuity_threshold: DEFAULT_DISCONTINUITY_THRESHOLD,
            retention_window: DEFAULT_RETENTION_WINDOW,
            overflow_margin: DEFAULT_OVERFLOW_MARGIN,
            trailing_margin: DEFAULT_TRAILING_MARGIN,
            drift_threshold: DEFAULT_DRIFT_THRESHOLD,
            seek_back: DEFAULT_SEEK_BACK,
        }
    }
}

/// Frame queue bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub warn_bytes: usize,
    pub max_bytes: usize,
    pub max_chunks: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            warn_bytes: DEFAULT_QUEUE_WARN_BYTES,
            max_bytes: DEFAULT_QUEUE_MAX_BYTES,
            max_chunks: DEFAULT_QUEUE_MAX_CHUNKS,
        }
    }
}

/// Feed controller configuration.
///
/// Start from [`FeedConfig::multiplexed`] or [`FeedConfig::single_channel`] and
/// adjust with the `set_*` methods.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub(crate) mode: ChannelMode,
    pub(crate) container: String,
    pub(crate) playback: PlaybackPolicy,
    pub(crate) queue: QueueLimits,
    pub(crate) append_timeout: Duration,
    pub(crate) auto_reconnect: bool,
    pub(crate) reconnect_delay: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self::multiplexed()
    }
}

impl FeedConfig {
    /// Several channels over one transport; failures reset only the failing channel.
    pub fn multiplexed() -> Self {
        Self {
            mode: ChannelMode::Multiplexed,
            container: "video/mp4".to_string(),
            playback: PlaybackPolicy::default(),
            queue: QueueLimits::default(),
            append_timeout: Duration::from_secs(DEFAULT_APPEND_TIMEOUT_SECS),
            auto_reconnect: false,
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
        }
    }

    /// One implicit channel; failures reset the whole connection.
    pub fn single_channel() -> Self {
        Self {
            mode: ChannelMode::Single,
            auto_reconnect: true,
            ..Self::multiplexed()
        }
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    pub fn playback(&self) -> &PlaybackPolicy {
        &self.playback
    }

    pub fn queue_limits(&self) -> &QueueLimits {
        &self.queue
    }

    /// Sets the container MIME type the codec descriptor is combined with (default `video/mp4`).
    pub fn set_container(mut self, container: impl Into<String>) -> Self {
        self.container = container.into();
        self
    }

    pub fn set_playback_policy(mut self, policy: PlaybackPolicy) -> Self {
        self.playback = policy;
        self
    }

    pub fn set_discontinuity_threshold(mut self, threshold: f64) -> Self {
        self.playback.discontinuity_threshold = threshold;
        self
    }

    pub fn set_retention_window(mut self, window: f64) -> Self {
        self.playback.retention_window = window;
        self
    }

    pub fn set_drift_threshold(mut self, threshold: f64) -> Self {
        self.playback.drift_threshold = threshold;
        self
    }

    /// Sets the frame queue bounds.
    ///
    /// `max_bytes` and `max_chunks` are raised to at least 1; `warn_bytes` is
    /// clamped to `max_bytes`.
    pub fn set_queue_limits(mut self, warn_bytes: usize, max_bytes: usize, max_chunks: usize) -> Self {
        let max_bytes = max_bytes.max(1);
        self.queue = QueueLimits {
            warn_bytes: warn_bytes.min(max_bytes),
            max_bytes,
            max_chunks: max_chunks.max(1),
        };
        self
    }

    /// Sets how long an append may stay outstanding before the sink is considered wedged.
    pub fn set_append_timeout(mut self, timeout: Duration) -> Self {
        self.append_timeout = timeout;
        self
    }

    /// Enables or disables reopening the transport after it closes or fails.
    pub fn set_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn set_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let multi = FeedConfig::multiplexed();
        assert_eq!(multi.mode(), ChannelMode::Multiplexed);
        assert!(!multi.auto_reconnect);

        let single = FeedConfig::single_channel();
        assert_eq!(single.mode(), ChannelMode::Single);
        assert!(single.auto_reconnect);
        assert_eq!(single.playback().discontinuity_threshold, 47000.0);
        assert_eq!(single.playback().retention_window, 120.0);
        assert_eq!(single.playback().drift_threshold, 1.8);
    }

    #[test]
    fn test_queue_limits_are_sanitized() {
        let config = FeedConfig::multiplexed().set_queue_limits(500, 100, 0);
        assert_eq!(config.queue_limits().max_bytes, 100);
        assert_eq!(config.queue_limits().warn_bytes, 100);
        assert_eq!(config.queue_limits().max_chunks, 1);
    }
}
