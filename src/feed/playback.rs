// src/feed/playback.rs - Buffer trimming and drift correction decisions
//
// Pure functions over the sink's buffered ranges and playback position, run by
// the channel feeder after every completed sink operation:
// - Trim: bound retained media and repair timestamp discontinuities
// - Drift: keep playback pinned just behind the live edge

use crate::feed::config::PlaybackPolicy;
use crate::feed::sink::BufferedRanges;

/// Why a removal was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimReason {
    /// Buffered span implausibly large: timestamps overflowed or jumped
    Discontinuity,
    /// Playback ran past the retention window
    Retention,
}

/// A removal request `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Removal {
    pub start: f64,
    pub end: f64,
    pub reason: TrimReason,
}

/// Decide whether part of the buffer should be removed.
pub fn plan_trim(ranges: &BufferedRanges, current: f64, policy: &PlaybackPolicy) -> Option<Removal> {
    let first = ranges.first()?;
    let last = ranges.last()?;

    if (first.start - last.end).abs() > policy.discontinuity_threshold {
        // Keep the first range, drop everything after it. The kept span never
        // exceeds the threshold, so a long (or single) first range is cut too.
        let start = (first.end + policy.overflow_margin)
            .min(first.start + policy.discontinuity_threshold);
        if start >= last.end {
            return None;
        }
        return Some(Removal {
            start,
            end: last.end,
            reason: TrimReason::Discontinuity,
        });
    }

    if current - first.start > policy.retention_window && last.end > current {
        let end = (last.end - policy.trailing_margin).min(current);
        if end <= first.start {
            return None;
        }
        return Some(Removal {
            start: first.start,
            end,
            reason: TrimReason::Retention,
        });
    }

    None
}

/// Decide whether playback should jump to the live edge. Returns the seek target.
///
/// The target is never ahead of the latest buffered time.
pub fn plan_drift(ranges: &BufferedRanges, current: f64, policy: &PlaybackPolicy) -> Option<f64> {
    let last = ranges.last()?;
    if (last.end - current).abs() < policy.drift_threshold {
        return None;
    }
    let target = (last.end - policy.seek_back).max(last.start).min(last.end);
    Some(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PlaybackPolicy {
        PlaybackPolicy::default()
    }

    #[test]
    fn test_no_ranges_no_action() {
        let ranges = BufferedRanges::default();
        assert!(plan_trim(&ranges, 10.0, &policy()).is_none());
        assert!(plan_drift(&ranges, 10.0, &policy()).is_none());
    }

    #[test]
    fn test_discontinuity_removal_over_threshold() {
        // 48000-unit span, over the 47000 threshold
        let ranges = BufferedRanges::from(vec![(0.0, 4.0), (47_990.0, 48_000.0)]);
        let removal = plan_trim(&ranges, 2.0, &policy()).unwrap();
        assert_eq!(removal.reason, TrimReason::Discontinuity);
        assert_eq!(removal.start, 14.0);
        assert_eq!(removal.end, 48_000.0);

        // Remaining span is back under the threshold
        let mut remaining = ranges.clone();
        remaining.remove(removal.start, removal.end);
        assert!(remaining.span() <= policy().discontinuity_threshold);
    }

    #[test]
    fn test_discontinuity_single_range() {
        let ranges = BufferedRanges::from(vec![(0.0, 48_000.0)]);
        let removal = plan_trim(&ranges, 0.0, &policy()).unwrap();
        assert_eq!(removal.reason, TrimReason::Discontinuity);
        assert_eq!(removal.start, 47_000.0);
        assert_eq!(removal.end, 48_000.0);

        let mut remaining = ranges.clone();
        remaining.remove(removal.start, removal.end);
        assert!(remaining.span() <= policy().discontinuity_threshold);
    }

    #[test]
    fn test_discontinuity_long_first_range_stays_within_threshold() {
        // First range ends inside the overflow margin of the threshold
        let ranges = BufferedRanges::from(vec![(0.0, 46_995.0), (47_000.0, 48_000.0)]);
        let removal = plan_trim(&ranges, 100.0, &policy()).unwrap();
        assert_eq!(removal.reason, TrimReason::Discontinuity);
        assert_eq!(removal.start, 47_000.0);
        assert_eq!(removal.end, 48_000.0);

        let mut remaining = ranges.clone();
        remaining.remove(removal.start, removal.end);
        assert!(remaining.span() <= policy().discontinuity_threshold);
        // Playback position still buffered, no second trim follows
        assert!(remaining.first().unwrap().end > 100.0);
        assert!(plan_trim(&remaining, 100.0, &policy()).is_none());
    }

    #[test]
    fn test_span_at_threshold_not_trimmed_as_discontinuity() {
        let ranges = BufferedRanges::from(vec![(0.0, 47_000.0)]);
        let removal = plan_trim(&ranges, 46_999.0, &policy());
        // Falls through to the retention branch instead
        assert_eq!(removal.map(|r| r.reason), Some(TrimReason::Retention));
    }

    #[test]
    fn test_retention_removal_keeps_trailing_margin() {
        let ranges = BufferedRanges::from(vec![(0.0, 131.0)]);
        let removal = plan_trim(&ranges, 130.0, &policy()).unwrap();
        assert_eq!(removal.reason, TrimReason::Retention);
        assert_eq!(removal.start, 0.0);
        assert_eq!(removal.end, 121.0);

        let mut remaining = ranges.clone();
        remaining.remove(removal.start, removal.end);
        let last = remaining.last().unwrap();
        assert!(last.end - last.start >= policy().trailing_margin);
    }

    #[test]
    fn test_retention_never_removes_past_playback() {
        // Playback far behind the live edge: removal stops at playback position
        let ranges = BufferedRanges::from(vec![(0.0, 200.0)]);
        let removal = plan_trim(&ranges, 150.0, &policy()).unwrap();
        assert_eq!(removal.end, 150.0);
    }

    #[test]
    fn test_retention_requires_live_edge_ahead() {
        let ranges = BufferedRanges::from(vec![(0.0, 125.0)]);
        assert!(plan_trim(&ranges, 125.0, &policy()).is_none());
        assert!(plan_trim(&ranges, 100.0, &policy()).is_none());
    }

    #[test]
    fn test_drift_seeks_behind_live_edge() {
        let ranges = BufferedRanges::from(vec![(0.0, 10.0)]);
        let target = plan_drift(&ranges, 5.0, &policy()).unwrap();
        assert!(target <= 10.0);
        assert!((target - 9.99).abs() < 1e-9);

        assert!(plan_drift(&ranges, 9.0, &policy()).is_none());
    }

    #[test]
    fn test_drift_when_playback_ahead_of_buffer() {
        let ranges = BufferedRanges::from(vec![(0.0, 10.0)]);
        let target = plan_drift(&ranges, 20.0, &policy()).unwrap();
        assert!(target <= 10.0);
    }

    #[test]
    fn test_drift_never_before_last_range_start() {
        let ranges = BufferedRanges::from(vec![(0.0, 1.0), (50.0, 50.005)]);
        let target = plan_drift(&ranges, 0.5, &policy()).unwrap();
        assert_eq!(target, 50.0);
        assert!(target <= 50.005);
    }
}
