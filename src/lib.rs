//! # ez-feed
//!
//! Live video feed controller: receives fMP4 segments for several channels over one
//! message transport and paces each channel into its own playback sink, trimming the
//! sink's buffer and keeping playback pinned to the live edge.
//!
//! See the [`feed`] module for the architecture and an example.

pub mod error;
pub mod feed;

pub use error::{Error, Result};
pub use feed::{ConnectionSupervisor, FeedConfig, FeedEvent, FeedHandle, Subscription};
