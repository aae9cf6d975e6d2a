use std::fmt;

use super::codec::PlayableBuffer;
use crate::error::Result;

/// Identifier of one scheduled buffer on an output device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaybackId(pub u64);

impl fmt::Display for PlaybackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "playback-{}", self.0)
    }
}

/// A buffer stopped before it finished playing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CancelledPlayback {
    pub id: PlaybackId,
    /// Scheduled start on the output clock (seconds)
    pub start: f64,
    /// Portion that will never be heard (seconds)
    pub unplayed_secs: f64,
}

/// Audio output device with an absolute playback clock
///
/// Times are seconds on the device's own monotonic clock, which is independent
/// of the capture clock.
pub trait OutputDevice: Send + Sync {
    /// Current position of the output clock in seconds
    fn now(&self) -> f64;

    /// Schedule `buffer` to begin playing at absolute time `start_at`
    fn schedule(&self, buffer: PlayableBuffer, start_at: f64) -> Result<PlaybackId>;

    /// Stop every buffer that has not finished, including the remainder of
    /// one currently playing
    fn cancel_all(&self) -> Vec<CancelledPlayback>;

    /// Release the device. Later calls are no-ops.
    fn release(&self) -> Result<()>;

    /// Native rate the device was opened at
    fn sample_rate(&self) -> u32;

    /// Get device name for logging
    fn name(&self) -> &str;
}
