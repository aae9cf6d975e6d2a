use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::ConversationConfig;
use super::stats::{
    ConversationPhase, ConversationStats, ConversationStatus, STATUS_CLOSED, STATUS_CONNECTED,
    STATUS_CONNECTING, STATUS_DISCONNECTED, STATUS_DISCONNECTING, STATUS_INITIALIZING,
};
use crate::audio::{
    AudioBackend, CaptureHandle, CapturePipeline, ChunkSink, DeviceProvider, OutputDevice,
    PlaybackScheduler,
};
use crate::error::{ConverseError, Result};
use crate::transport::{LiveTransport, SessionEvent, SessionHandle, SessionState};

/// How a conversation ended
#[derive(Debug, Clone)]
enum Outcome {
    Stopped,
    RemoteClosed,
    /// Carries the full status line
    Failed(String),
}

/// Resources owned by the running conversation
struct ActiveConversation {
    id: String,
    started_at: DateTime<Utc>,
    input: Box<dyn AudioBackend>,
    output: Arc<dyn OutputDevice>,
    session: Arc<SessionHandle>,
    capture: CaptureHandle,
    dispatcher: JoinHandle<()>,
    scheduler: Arc<PlaybackScheduler>,
}

impl ActiveConversation {
    fn stats(&self) -> ConversationStats {
        let duration = Utc::now().signed_duration_since(self.started_at);

        ConversationStats {
            session_id: self.id.clone(),
            started_at: self.started_at,
            duration_secs: duration.num_milliseconds() as f64 / 1000.0,
            capture: self.capture.stats(),
            playback: self.scheduler.stats(),
        }
    }
}

struct Inner {
    config: ConversationConfig,
    devices: Arc<dyn DeviceProvider>,
    transport: Arc<dyn LiveTransport>,
    muted: Arc<AtomicBool>,
    status: watch::Sender<ConversationStatus>,
    active: Mutex<Option<ActiveConversation>>,
}

/// Owns the lifecycle of at most one conversation at a time
///
/// Phases run `Idle → Connecting → Active → Stopping → Idle`, with a `Failed`
/// excursion back to `Idle` when the session errors. Every device and the
/// session are acquired per conversation and released on teardown.
#[derive(Clone)]
pub struct ConversationManager {
    inner: Arc<Inner>,
}

impl ConversationManager {
    pub fn new(
        config: ConversationConfig,
        devices: Arc<dyn DeviceProvider>,
        transport: Arc<dyn LiveTransport>,
    ) -> Self {
        let muted = config.start_muted;
        let (status, _) = watch::channel(ConversationStatus::idle(muted));

        Self {
            inner: Arc::new(Inner {
                config,
                devices,
                transport,
                muted: Arc::new(AtomicBool::new(muted)),
                status,
                active: Mutex::new(None),
            }),
        }
    }

    /// Start a conversation and wait until the service accepts it
    ///
    /// Returns the session id. Fails with `AlreadyRunning` if a conversation
    /// exists, `DeviceUnavailable` if a device cannot be acquired (nothing is
    /// left open), `Cancelled` if `stop` ran while connecting, and
    /// `SessionOpenFailed` if the service refused or dropped the session.
    pub async fn start(&self) -> Result<String> {
        let (id, session) = {
            let mut active = self.inner.active.lock().await;
            if active.is_some() {
                return Err(ConverseError::AlreadyRunning);
            }

            let id = format!("conversation-{}", uuid::Uuid::new_v4());
            info!("Starting conversation {}", id);
            self.update_status(|s| {
                s.phase = ConversationPhase::Connecting;
                s.message = STATUS_INITIALIZING.to_string();
                s.session_id = Some(id.clone());
            });

            let conversation = match self.acquire(&id).await {
                Ok(conversation) => conversation,
                Err(e) => {
                    warn!("Conversation {} could not start: {}", id, e);
                    self.finish_failed_start(&e);
                    return Err(e);
                }
            };

            let session = Arc::clone(&conversation.session);
            *active = Some(conversation);
            (id, session)
        };

        let opened = session.wait_open().await;

        match opened {
            Ok(()) => {
                let active = self.inner.active.lock().await;
                let current = active.as_ref().is_some_and(|a| a.id == id);

                if current && session.state() == SessionState::Open {
                    self.update_status(|s| {
                        s.phase = ConversationPhase::Active;
                        s.message = STATUS_CONNECTED.to_string();
                    });
                    info!("Conversation {} active", id);
                    return Ok(id);
                }
                drop(active);

                if !current {
                    return Err(ConverseError::Cancelled);
                }

                // Opened and failed before we could promote it
                let reason = session
                    .close_reason()
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "session ended".to_string());
                self.teardown(
                    Some(&id),
                    Outcome::Failed(format!("Failed to connect: {}", reason)),
                    false,
                )
                .await;
                Err(ConverseError::SessionErrored(reason))
            }
            Err(ConverseError::Cancelled) => {
                info!("Conversation {} cancelled while connecting", id);
                Err(ConverseError::Cancelled)
            }
            Err(e) => {
                let reason = match &e {
                    ConverseError::SessionOpenFailed(r) | ConverseError::SessionErrored(r) => {
                        r.clone()
                    }
                    other => other.to_string(),
                };
                self.teardown(
                    Some(&id),
                    Outcome::Failed(format!("Failed to connect: {}", reason)),
                    false,
                )
                .await;
                Err(e)
            }
        }
    }

    /// Stop the conversation, if any; safe from every phase
    ///
    /// Returns the final stats, or `None` when nothing was running. After this
    /// returns no frame is sent and no audio is scheduled.
    pub async fn stop(&self) -> Option<ConversationStats> {
        self.teardown(None, Outcome::Stopped, false).await
    }

    /// Muted frames are dropped, never buffered for later
    pub fn set_muted(&self, muted: bool) {
        self.inner.muted.store(muted, Ordering::SeqCst);
        self.update_status(|s| s.muted = muted);
        info!("Microphone {}", if muted { "muted" } else { "unmuted" });
    }

    pub fn is_muted(&self) -> bool {
        self.inner.muted.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ConversationStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationStatus> {
        self.inner.status.subscribe()
    }

    /// Stats of the running conversation
    pub async fn stats(&self) -> Option<ConversationStats> {
        self.inner.active.lock().await.as_ref().map(|a| a.stats())
    }

    /// Open devices and the session; on failure release what was acquired
    async fn acquire(&self, id: &str) -> Result<ActiveConversation> {
        let config = &self.inner.config;

        let mut input = self
            .inner
            .devices
            .open_input(&config.backend_config())
            .map_err(as_device_error)?;

        let frames = match input.start().await {
            Ok(frames) => frames,
            Err(e) => {
                release_input(input.as_mut()).await;
                return Err(as_device_error(e));
            }
        };

        let output = match self.inner.devices.open_output(config.output_sample_rate) {
            Ok(output) => output,
            Err(e) => {
                release_input(input.as_mut()).await;
                return Err(as_device_error(e));
            }
        };

        info!(
            "Audio ready: input={} output={} ({}Hz)",
            input.name(),
            output.name(),
            output.sample_rate()
        );
        self.update_status(|s| s.message = STATUS_CONNECTING.to_string());

        let (session, events) = SessionHandle::open_with_timeout(
            Arc::clone(&self.inner.transport),
            id,
            config.setup_message(),
            config.open_timeout(),
        );
        let session = Arc::new(session);

        let scheduler = Arc::new(PlaybackScheduler::new(
            Arc::clone(&output),
            config.output_sample_rate,
        ));

        let sink: Arc<dyn ChunkSink> = session.clone();
        let capture = CapturePipeline::spawn(frames, sink, Arc::clone(&self.inner.muted));

        let dispatcher = tokio::spawn(dispatch(
            Arc::downgrade(&self.inner),
            id.to_string(),
            events,
            Arc::clone(&scheduler),
        ));

        Ok(ActiveConversation {
            id: id.to_string(),
            started_at: Utc::now(),
            input,
            output,
            session,
            capture,
            dispatcher,
            scheduler,
        })
    }

    /// Release everything the conversation holds
    ///
    /// With `expected_id`, only that conversation is torn down. With
    /// `only_if_active`, a conversation still connecting is left to `start`.
    async fn teardown(
        &self,
        expected_id: Option<&str>,
        outcome: Outcome,
        only_if_active: bool,
    ) -> Option<ConversationStats> {
        let mut active = self.inner.active.lock().await;

        let matches = match (active.as_ref(), expected_id) {
            (None, _) => false,
            (Some(a), Some(id)) => a.id == id,
            (Some(_), None) => true,
        };
        if !matches {
            return None;
        }
        if only_if_active && self.status().phase != ConversationPhase::Active {
            return None;
        }

        let mut conversation = active.take()?;
        let id = conversation.id.clone();

        match &outcome {
            Outcome::Failed(message) => {
                warn!("Conversation {} failed: {}", id, message);
                self.update_status(|s| {
                    s.phase = ConversationPhase::Failed;
                    s.message = message.clone();
                    s.last_error = Some(message.clone());
                });
            }
            _ => {
                info!("Stopping conversation {} ({:?})", id, outcome);
                self.update_status(|s| {
                    s.phase = ConversationPhase::Stopping;
                    s.message = STATUS_DISCONNECTING.to_string();
                });
            }
        }

        // 1. No more frames reach the session, no more chunks reach the scheduler
        conversation.capture.stop().await;
        conversation.dispatcher.abort();
        if let Err(e) = (&mut conversation.dispatcher).await {
            if !e.is_cancelled() {
                error!("Event dispatcher panicked: {}", e);
            }
        }

        // 2. Session
        conversation.session.close().await;

        // 3. Input device
        release_input(conversation.input.as_mut()).await;

        // 4. Pending playback and the output device
        let cancelled = conversation.scheduler.flush();
        if !cancelled.is_empty() {
            debug!("Discarded {} pending playbacks", cancelled.len());
        }
        if let Err(e) = conversation.output.release() {
            error!("Failed to release output device: {}", e);
        }

        let stats = conversation.stats();

        self.update_status(|s| {
            s.phase = ConversationPhase::Idle;
            s.session_id = None;
            match &outcome {
                Outcome::Stopped => s.message = STATUS_DISCONNECTED.to_string(),
                Outcome::RemoteClosed => s.message = STATUS_CLOSED.to_string(),
                // Keep the error line visible
                Outcome::Failed(_) => {}
            }
        });

        info!(
            "Conversation {} ended after {:.1}s ({} frames sent, {} chunks played)",
            id,
            stats.duration_secs,
            stats.capture.frames_sent,
            stats.playback.chunks_scheduled
        );

        Some(stats)
    }

    fn finish_failed_start(&self, error: &ConverseError) {
        let message = format!("Failed to connect: {}", error);
        self.update_status(|s| {
            s.phase = ConversationPhase::Failed;
            s.message = message.clone();
            s.last_error = Some(message.clone());
        });
        self.update_status(|s| {
            s.phase = ConversationPhase::Idle;
            s.session_id = None;
        });
    }

    fn update_status(&self, modify: impl FnOnce(&mut ConversationStatus)) {
        self.inner.status.send_modify(modify);
    }
}

/// Routes session events to the scheduler until the session ends
async fn dispatch(
    manager: Weak<Inner>,
    id: String,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    scheduler: Arc<PlaybackScheduler>,
) {
    while let Some(event) = events.recv().await {
        let outcome = match event {
            SessionEvent::AudioChunkReceived(chunk) => {
                if let Err(e) = scheduler.schedule_chunk(&chunk) {
                    warn!("Dropping inbound chunk: {}", e);
                }
                continue;
            }
            SessionEvent::Interrupted => {
                scheduler.interrupt();
                continue;
            }
            SessionEvent::TurnComplete => {
                debug!("Turn complete");
                continue;
            }
            SessionEvent::Closed { reason } => {
                info!("Conversation {} closed by service: {:?}", id, reason);
                Outcome::RemoteClosed
            }
            SessionEvent::Errored(reason) => Outcome::Failed(format!("Error occurred: {}", reason)),
        };

        // Teardown aborts this task, so it runs on its own
        if let Some(inner) = manager.upgrade() {
            let manager = ConversationManager { inner };
            tokio::spawn(async move {
                manager.teardown(Some(&id), outcome, true).await;
            });
        }
        break;
    }
}

fn as_device_error(e: ConverseError) -> ConverseError {
    match e {
        ConverseError::DeviceUnavailable(_) => e,
        other => ConverseError::DeviceUnavailable(other.to_string()),
    }
}

async fn release_input(input: &mut dyn AudioBackend) {
    if let Err(e) = input.stop().await {
        error!("Failed to stop input device {}: {}", input.name(), e);
    }
}
