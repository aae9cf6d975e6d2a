// Software output device
//
// Keeps the same timeline bookkeeping as a real speaker without producing
// sound. Used for headless runs (`talk --headless`) and by tests, where a
// manually advanced clock makes scheduling deterministic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tracing::{debug, info};

use super::codec::PlayableBuffer;
use super::output::{CancelledPlayback, OutputDevice, PlaybackId};
use crate::error::{ConverseError, Result};

/// Source of "now" for a headless output
pub trait OutputClock: Send + Sync {
    fn now(&self) -> f64;
}

/// Wall clock measured from device creation
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputClock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    seconds: Arc<Mutex<f64>>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            seconds: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, seconds: f64) {
        *lock(&self.seconds) = seconds;
    }

    pub fn advance(&self, seconds: f64) {
        *lock(&self.seconds) += seconds;
    }
}

impl OutputClock for ManualClock {
    fn now(&self) -> f64 {
        *lock(&self.seconds)
    }
}

/// Everything that happened on a headless output, in order
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    Scheduled {
        id: PlaybackId,
        start: f64,
        duration: f64,
    },
    Cancelled(CancelledPlayback),
    Released,
}

#[derive(Debug)]
struct Voice {
    id: PlaybackId,
    start: f64,
    duration: f64,
}

#[derive(Debug, Default)]
struct HeadlessState {
    voices: Vec<Voice>,
    events: Vec<OutputEvent>,
    released: bool,
}

/// Output device without audio hardware
pub struct HeadlessOutput {
    clock: Box<dyn OutputClock>,
    sample_rate: u32,
    next_id: AtomicU64,
    state: Mutex<HeadlessState>,
    releases: AtomicU64,
    /// Keep the event log; off for long-running outputs
    record_events: bool,
}

impl HeadlessOutput {
    pub fn new(sample_rate: u32, clock: Box<dyn OutputClock>) -> Self {
        info!("Headless output initialized ({}Hz)", sample_rate);

        Self {
            clock,
            sample_rate,
            next_id: AtomicU64::new(0),
            state: Mutex::new(HeadlessState::default()),
            releases: AtomicU64::new(0),
            record_events: false,
        }
    }

    /// Headless output driven by the wall clock
    pub fn system(sample_rate: u32) -> Self {
        Self::new(sample_rate, Box::new(SystemClock::new()))
    }

    /// Headless output driven by a test clock, recording every event
    pub fn manual(sample_rate: u32, clock: ManualClock) -> Self {
        Self::new(sample_rate, Box::new(clock)).with_event_log()
    }

    pub fn with_event_log(mut self) -> Self {
        self.record_events = true;
        self
    }

    fn record(&self, state: &mut HeadlessState, event: OutputEvent) {
        if self.record_events {
            state.events.push(event);
        }
    }

    /// Snapshot of the event log (empty unless recording)
    pub fn events(&self) -> Vec<OutputEvent> {
        lock(&self.state).events.clone()
    }

    /// Cancellations recorded so far
    pub fn cancellations(&self) -> Vec<CancelledPlayback> {
        lock(&self.state)
            .events
            .iter()
            .filter_map(|e| match e {
                OutputEvent::Cancelled(c) => Some(*c),
                _ => None,
            })
            .collect()
    }

    /// Buffers that are scheduled and not yet finished at `now()`
    pub fn pending(&self) -> usize {
        let now = self.clock.now();
        lock(&self.state)
            .voices
            .iter()
            .filter(|v| v.start + v.duration > now)
            .count()
    }

    /// How many times `release` actually released the device
    pub fn release_count(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        lock(&self.state).released
    }
}

impl OutputDevice for HeadlessOutput {
    fn now(&self) -> f64 {
        self.clock.now()
    }

    fn schedule(&self, buffer: PlayableBuffer, start_at: f64) -> Result<PlaybackId> {
        let mut state = lock(&self.state);
        if state.released {
            return Err(ConverseError::Playback("output device released".into()));
        }

        let id = PlaybackId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let duration = buffer.duration_secs();

        let now = self.clock.now();
        state.voices.retain(|v| v.start + v.duration > now);
        state.voices.push(Voice {
            id,
            start: start_at,
            duration,
        });
        self.record(
            &mut state,
            OutputEvent::Scheduled {
                id,
                start: start_at,
                duration,
            },
        );

        debug!("Scheduled {} at {:.3}s ({:.3}s)", id, start_at, duration);

        Ok(id)
    }

    fn cancel_all(&self) -> Vec<CancelledPlayback> {
        let now = self.clock.now();
        let mut state = lock(&self.state);

        let cancelled: Vec<CancelledPlayback> = state
            .voices
            .drain(..)
            .filter(|v| v.start + v.duration > now)
            .map(|v| CancelledPlayback {
                id: v.id,
                start: v.start,
                unplayed_secs: v.start + v.duration - now.max(v.start),
            })
            .collect();

        for c in &cancelled {
            self.record(&mut state, OutputEvent::Cancelled(*c));
        }

        cancelled
    }

    fn release(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.released {
            return Ok(());
        }

        state.voices.clear();
        state.released = true;
        self.record(&mut state, OutputEvent::Released);
        self.releases.fetch_add(1, Ordering::SeqCst);

        info!("Headless output released");

        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn name(&self) -> &str {
        "headless"
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
