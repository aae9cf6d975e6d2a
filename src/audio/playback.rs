// Gapless playback scheduling for streamed synthesized audio
//
// Each inbound chunk is placed on the output clock right after the previous
// one: start = max(next_start, now), next_start = start + duration. Chunks
// that arrive faster than real time queue back-to-back; slow arrivals leave
// silence but never overlap. An interruption cancels everything not yet heard
// and unsets the timeline so the next chunk starts at `now()`.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, info};

use super::codec::{self, EncodedChunk};
use super::output::{CancelledPlayback, OutputDevice, PlaybackId};
use crate::error::Result;

/// Where a chunk landed on the output timeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledPlayback {
    pub id: PlaybackId,
    pub start: f64,
    pub duration: f64,
}

impl ScheduledPlayback {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Counters reported in conversation stats
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PlaybackStats {
    pub chunks_scheduled: u64,
    pub chunks_rejected: u64,
    pub interruptions: u64,
    pub seconds_scheduled: f64,
    pub seconds_cancelled: f64,
}

#[derive(Debug, Default)]
struct Timeline {
    /// Earliest start for the next chunk; `None` schedules at `now()`
    next_start: Option<f64>,
    stats: PlaybackStats,
}

/// Schedules inbound audio on one output device for one session
pub struct PlaybackScheduler {
    output: Arc<dyn OutputDevice>,
    default_sample_rate: u32,
    channels: u16,
    timeline: Mutex<Timeline>,
}

impl PlaybackScheduler {
    /// `default_sample_rate` applies to chunks that do not declare a rate
    pub fn new(output: Arc<dyn OutputDevice>, default_sample_rate: u32) -> Self {
        info!(
            "Playback scheduler initialized on {} ({}Hz)",
            output.name(),
            default_sample_rate
        );

        Self {
            output,
            default_sample_rate,
            channels: 1,
            timeline: Mutex::new(Timeline::default()),
        }
    }

    /// Decode a chunk and append it to the timeline
    ///
    /// Decoding happens before the timeline lock is taken; a malformed chunk
    /// leaves the timeline untouched. The start time is computed and the
    /// buffer handed to the device under one lock, so an interruption can never
    /// observe (or leave behind) a half-scheduled chunk.
    pub fn schedule_chunk(&self, chunk: &EncodedChunk) -> Result<ScheduledPlayback> {
        let sample_rate = if chunk.sample_rate == 0 {
            self.default_sample_rate
        } else {
            chunk.sample_rate
        };

        let buffer = match codec::decode(&chunk.data, sample_rate, self.channels) {
            Ok(buffer) => buffer,
            Err(e) => {
                self.lock().stats.chunks_rejected += 1;
                return Err(e);
            }
        };
        let duration = buffer.duration_secs();

        let mut timeline = self.lock();
        let now = self.output.now();
        let start = timeline.next_start.map_or(now, |next| next.max(now));

        let id = self.output.schedule(buffer, start)?;

        timeline.next_start = Some(start + duration);
        timeline.stats.chunks_scheduled += 1;
        timeline.stats.seconds_scheduled += duration;

        debug!(
            "Scheduled {} at {:.3}s for {:.3}s (now={:.3}s)",
            id, start, duration, now
        );

        Ok(ScheduledPlayback {
            id,
            start,
            duration,
        })
    }

    /// Barge-in: drop all unplayed audio and unset the timeline
    pub fn interrupt(&self) -> Vec<CancelledPlayback> {
        let mut timeline = self.lock();

        let cancelled = self.output.cancel_all();
        let unplayed: f64 = cancelled.iter().map(|c| c.unplayed_secs).sum();

        timeline.next_start = None;
        timeline.stats.interruptions += 1;
        timeline.stats.seconds_cancelled += unplayed;

        info!(
            "Playback interrupted: {} buffers cancelled ({:.3}s unplayed)",
            cancelled.len(),
            unplayed
        );

        cancelled
    }

    /// Cancel anything still queued without counting it as an interruption
    pub fn flush(&self) -> Vec<CancelledPlayback> {
        let mut timeline = self.lock();
        let cancelled = self.output.cancel_all();
        timeline.next_start = None;
        timeline.stats.seconds_cancelled += cancelled.iter().map(|c| c.unplayed_secs).sum::<f64>();
        cancelled
    }

    pub fn next_start(&self) -> Option<f64> {
        self.lock().next_start
    }

    pub fn stats(&self) -> PlaybackStats {
        self.lock().stats
    }

    fn lock(&self) -> MutexGuard<'_, Timeline> {
        self.timeline
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::headless::{HeadlessOutput, ManualClock};
    use crate::error::ConverseError;

    const RATE: u32 = 24000;

    fn chunk_of(seconds: f64) -> EncodedChunk {
        let samples = (seconds * RATE as f64).round() as usize;
        EncodedChunk::new(vec![0u8; samples * 2], RATE)
    }

    fn scheduler_at(t0: f64) -> (PlaybackScheduler, Arc<HeadlessOutput>, ManualClock) {
        let clock = ManualClock::new(t0);
        let output = Arc::new(HeadlessOutput::manual(RATE, clock.clone()));
        let scheduler = PlaybackScheduler::new(output.clone(), RATE);
        (scheduler, output, clock)
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_fast_arrivals_play_back_to_back() {
        let t0 = 3.0;
        let (scheduler, _output, _clock) = scheduler_at(t0);

        let a = scheduler.schedule_chunk(&chunk_of(1.0)).unwrap();
        let b = scheduler.schedule_chunk(&chunk_of(0.5)).unwrap();
        let c = scheduler.schedule_chunk(&chunk_of(0.2)).unwrap();

        assert!(approx(a.start, t0));
        assert!(approx(b.start, t0 + 1.0));
        assert!(approx(c.start, t0 + 1.5));
        assert!(a.end() <= b.start + 1e-9);
        assert!(b.end() <= c.start + 1e-9);
        assert!(approx(scheduler.next_start().unwrap(), t0 + 1.7));
    }

    #[test]
    fn test_slow_arrival_starts_at_now() {
        let (scheduler, _output, clock) = scheduler_at(1.0);

        scheduler.schedule_chunk(&chunk_of(0.5)).unwrap();
        clock.set(4.0);
        let late = scheduler.schedule_chunk(&chunk_of(0.5)).unwrap();

        assert!(approx(late.start, 4.0));
        assert!(approx(scheduler.next_start().unwrap(), 4.5));
    }

    #[test]
    fn test_interrupt_cancels_future_and_resets_timeline() {
        let t0 = 2.0;
        let (scheduler, output, clock) = scheduler_at(t0);

        for _ in 0..5 {
            scheduler.schedule_chunk(&chunk_of(1.0)).unwrap();
        }
        assert!(approx(scheduler.next_start().unwrap(), t0 + 5.0));

        clock.set(t0 + 1.0);
        let cancelled = scheduler.interrupt();

        // Chunk 0 has finished; chunks 1..5 start at or after t0+1
        assert_eq!(cancelled.len(), 4);
        assert!(cancelled.iter().all(|c| c.start >= t0 + 1.0 - 1e-9));
        assert_eq!(scheduler.next_start(), None);
        assert_eq!(output.pending(), 0);

        let next = scheduler.schedule_chunk(&chunk_of(0.5)).unwrap();
        assert!(approx(next.start, t0 + 1.0));
    }

    #[test]
    fn test_interrupt_truncates_playing_buffer() {
        let (scheduler, _output, clock) = scheduler_at(0.0);

        scheduler.schedule_chunk(&chunk_of(1.0)).unwrap();
        clock.set(0.4);
        let cancelled = scheduler.interrupt();

        assert_eq!(cancelled.len(), 1);
        assert!(approx(cancelled[0].unplayed_secs, 0.6));
        assert_eq!(scheduler.stats().interruptions, 1);
    }

    #[test]
    fn test_reset_is_unset_not_zero() {
        // A clock reading near zero must not pull the next chunk into the past
        let (scheduler, _output, clock) = scheduler_at(0.0);

        scheduler.schedule_chunk(&chunk_of(1.0)).unwrap();
        clock.set(0.3);
        scheduler.interrupt();

        let next = scheduler.schedule_chunk(&chunk_of(0.1)).unwrap();
        assert!(approx(next.start, 0.3));
    }

    #[test]
    fn test_malformed_chunk_leaves_timeline_unchanged() {
        let (scheduler, output, _clock) = scheduler_at(1.0);

        scheduler.schedule_chunk(&chunk_of(1.0)).unwrap();
        let before = scheduler.next_start();

        let result = scheduler.schedule_chunk(&EncodedChunk::new(vec![0u8; 3], RATE));

        assert!(matches!(result, Err(ConverseError::MalformedAudio(_))));
        assert_eq!(scheduler.next_start(), before);
        assert_eq!(output.events().len(), 1);
        assert_eq!(scheduler.stats().chunks_rejected, 1);
        assert_eq!(scheduler.stats().chunks_scheduled, 1);
    }

    #[test]
    fn test_undeclared_rate_uses_default() {
        let (scheduler, _output, _clock) = scheduler_at(0.0);

        let chunk = EncodedChunk::new(vec![0u8; 2 * RATE as usize], 0);
        let scheduled = scheduler.schedule_chunk(&chunk).unwrap();

        assert!(approx(scheduled.duration, 1.0));
    }

    #[test]
    fn test_concurrent_interrupts_never_overlap() {
        let (scheduler, _output, _clock) = scheduler_at(0.0);
        let scheduler = Arc::new(scheduler);

        let producer = {
            let scheduler = Arc::clone(&scheduler);
            std::thread::spawn(move || {
                (0..200)
                    .map(|_| scheduler.schedule_chunk(&chunk_of(0.01)).unwrap())
                    .collect::<Vec<_>>()
            })
        };
        for _ in 0..50 {
            scheduler.interrupt();
        }
        let scheduled = producer.join().unwrap();

        // The clock never moves, so every chunk is either back-to-back with its
        // predecessor or restarts at zero after a reset
        for pair in scheduled.windows(2) {
            let gap = pair[1].start - pair[0].end();
            assert!(approx(pair[1].start, 0.0) || approx(gap, 0.0));
        }
    }
}
