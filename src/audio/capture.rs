use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::AudioFrame;
use super::codec::{self, EncodedChunk};
use crate::error::{ConverseError, Result};

/// Destination for encoded capture chunks
///
/// `send_chunk` must not block: the remote side never acknowledges individual
/// chunks, so the capture loop hands each one off and moves on.
pub trait ChunkSink: Send + Sync {
    fn send_chunk(&self, chunk: EncodedChunk) -> Result<()>;
}

/// Capture counters
#[derive(Debug, Default)]
pub struct CaptureCounters {
    frames_captured: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    send_failures: AtomicU64,
}

impl CaptureCounters {
    pub fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.frames_captured.load(Ordering::SeqCst),
            frames_sent: self.frames_sent.load(Ordering::SeqCst),
            frames_dropped: self.frames_dropped.load(Ordering::SeqCst),
            send_failures: self.send_failures.load(Ordering::SeqCst),
        }
    }
}

/// Point-in-time view of the capture counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    /// Frames pulled from the input device
    pub frames_captured: u64,
    /// Frames encoded and handed to the session
    pub frames_sent: u64,
    /// Frames discarded while muted
    pub frames_dropped: u64,
    /// Frames the session refused for reasons other than close
    pub send_failures: u64,
}

/// Pulls frames from an input device, encodes them and forwards them
pub struct CapturePipeline;

impl CapturePipeline {
    /// Spawn the capture loop on the current runtime
    pub fn spawn(
        frames: mpsc::Receiver<AudioFrame>,
        sink: Arc<dyn ChunkSink>,
        muted: Arc<AtomicBool>,
    ) -> CaptureHandle {
        let accepting = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(CaptureCounters::default());

        let task = tokio::spawn(run(
            frames,
            sink,
            muted,
            Arc::clone(&accepting),
            Arc::clone(&counters),
        ));

        CaptureHandle {
            accepting,
            counters,
            task: Some(task),
        }
    }
}

/// Handle to a running capture loop
pub struct CaptureHandle {
    accepting: Arc<AtomicBool>,
    counters: Arc<CaptureCounters>,
    task: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Stop accepting frames and wait for the loop to exit
    ///
    /// After this returns no further chunk reaches the sink.
    pub async fn stop(&mut self) {
        self.accepting.store(false, Ordering::SeqCst);

        if let Some(task) = self.task.take() {
            task.abort();
            match task.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!("Capture task panicked: {}", e),
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn stats(&self) -> CaptureStats {
        self.counters.snapshot()
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run(
    mut frames: mpsc::Receiver<AudioFrame>,
    sink: Arc<dyn ChunkSink>,
    muted: Arc<AtomicBool>,
    accepting: Arc<AtomicBool>,
    counters: Arc<CaptureCounters>,
) {
    info!("Capture pipeline started");

    while let Some(frame) = frames.recv().await {
        if !accepting.load(Ordering::SeqCst) {
            break;
        }

        let seq = counters.frames_captured.fetch_add(1, Ordering::SeqCst);

        // Muted audio is discarded for good, never queued for later
        if muted.load(Ordering::SeqCst) {
            counters.frames_dropped.fetch_add(1, Ordering::SeqCst);
            debug!("Dropped muted frame {} ({} samples)", seq, frame.samples.len());
            continue;
        }

        let chunk = EncodedChunk::new(codec::encode(&frame.samples), frame.sample_rate);

        match sink.send_chunk(chunk) {
            Ok(()) => {
                counters.frames_sent.fetch_add(1, Ordering::SeqCst);
            }
            Err(ConverseError::SendAfterClose) => {
                debug!("Frame {} raced with session close", seq);
            }
            Err(e) => {
                counters.send_failures.fetch_add(1, Ordering::SeqCst);
                warn!("Failed to send frame {}: {}", seq, e);
            }
        }
    }

    info!("Capture pipeline stopped");
}
