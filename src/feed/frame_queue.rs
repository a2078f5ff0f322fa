// src/feed/frame_queue.rs - Per-channel frame queue
//
// Core features:
// - Strict FIFO, each chunk handed out exactly once
// - Tiered backpressure (Normal/Warning/Critical) on pending bytes
// - Drop-oldest eviction when the byte or chunk cap is reached
// - Init segments (ftyp/moov) are never evicted

use crate::feed::config::QueueLimits;
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Queue entry
struct QueuedChunk {
    data: Bytes,
    enqueued_at: Instant,
    is_init_segment: bool,
}

/// Backpressure level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureLevel {
    Normal,   // below warn_bytes
    Warning,  // warn_bytes..max_bytes: sink is falling behind
    Critical, // >= max_bytes: oldest chunks are being evicted
}

/// Outcome of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Chunk queued after evicting `dropped` older chunks
    QueuedWithEviction { dropped: usize },
    /// Chunk larger than the whole queue, discarded
    Rejected,
}

/// Frame queue
pub struct FrameQueue {
    queue: VecDeque<QueuedChunk>,
    total_bytes: usize,
    limits: QueueLimits,
    dropped_chunks: u64,
    warned: bool,
}

impl FrameQueue {
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            queue: VecDeque::with_capacity(64),
            total_bytes: 0,
            limits,
            dropped_chunks: 0,
            warned: false,
        }
    }

    /// Current backpressure level
    pub fn backpressure_level(&self) -> BackpressureLevel {
        if self.total_bytes >= self.limits.max_bytes || self.queue.len() >= self.limits.max_chunks {
            BackpressureLevel::Critical
        } else if self.total_bytes >= self.limits.warn_bytes {
            BackpressureLevel::Warning
        } else {
            BackpressureLevel::Normal
        }
    }

    /// Enqueue a chunk at the back.
    ///
    /// When the chunk would exceed a bound, the oldest non-init chunks are
    /// evicted until it fits.
    pub fn push(&mut self, data: Bytes) -> PushOutcome {
        let len = data.len();
        if len > self.limits.max_bytes {
            self.dropped_chunks += 1;
            return PushOutcome::Rejected;
        }

        let mut dropped = 0;
        while self.total_bytes.saturating_add(len) > self.limits.max_bytes
            || self.queue.len() >= self.limits.max_chunks
        {
            if !self.evict_oldest() {
                break;
            }
            dropped += 1;
        }

        // Only init segments left and still no room
        if self.total_bytes.saturating_add(len) > self.limits.max_bytes
            || self.queue.len() >= self.limits.max_chunks
        {
            self.dropped_chunks += 1;
            return PushOutcome::Rejected;
        }

        let is_init_segment = is_init_segment(&data);
        self.queue.push_back(QueuedChunk {
            data,
            enqueued_at: Instant::now(),
            is_init_segment,
        });
        self.total_bytes += len;

        match self.backpressure_level() {
            BackpressureLevel::Normal => self.warned = false,
            BackpressureLevel::Warning | BackpressureLevel::Critical => {
                if !self.warned {
                    self.warned = true;
                    log::warn!(
                        "Frame queue backlog {} bytes in {} chunks, sink is not keeping up",
                        self.total_bytes,
                        self.queue.len()
                    );
                }
            }
        }

        if dropped > 0 {
            PushOutcome::QueuedWithEviction { dropped }
        } else {
            PushOutcome::Queued
        }
    }

    /// Remove the oldest evictable chunk. Returns false if none can be evicted.
    fn evict_oldest(&mut self) -> bool {
        let position = self.queue.iter().position(|entry| !entry.is_init_segment);
        let Some(index) = position else {
            return false;
        };
        if let Some(removed) = self.queue.remove(index) {
            self.total_bytes = self.total_bytes.saturating_sub(removed.data.len());
            self.dropped_chunks += 1;
            return true;
        }
        false
    }

    /// Dequeue the oldest chunk
    pub fn pop(&mut self) -> Option<Bytes> {
        let entry = self.queue.pop_front()?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.data.len());
        Some(entry.data)
    }

    /// Drop everything pending, returning the number of chunks discarded
    pub fn clear(&mut self) -> usize {
        let count = self.queue.len();
        self.queue.clear();
        self.total_bytes = 0;
        self.warned = false;
        count
    }

    /// Age of the oldest pending chunk
    pub fn oldest_age(&self) -> Option<Duration> {
        self.queue.front().map(|entry| entry.enqueued_at.elapsed())
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn pending_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn dropped_chunks(&self) -> u64 {
        self.dropped_chunks
    }
}

/// Whether the chunk starts with an ISO-BMFF `ftyp` or `moov` box
pub fn is_init_segment(data: &[u8]) -> bool {
    matches!(data.get(4..8), Some(b"ftyp") | Some(b"moov"))
}
