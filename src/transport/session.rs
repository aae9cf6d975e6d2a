use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::messages::{RealtimeInput, ServerMessage, SetupMessage};
use super::{LiveTransport, SessionEvent, TransportEvent, TransportLink};
use crate::audio::capture::ChunkSink;
use crate::audio::codec::EncodedChunk;
use crate::error::{ConverseError, Result};

/// How long `close` lets the driver flush before aborting it
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// How long the service gets to acknowledge the setup by default
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(15);

/// Lifecycle of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    /// Sends are refused in these states
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Closing | Self::Closed | Self::Failed)
    }
}

/// Why a session stopped being usable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called on this side
    Local,
    Remote(Option<String>),
    Error(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "closed locally"),
            Self::Remote(Some(reason)) => write!(f, "{}", reason),
            Self::Remote(None) => write!(f, "closed by remote"),
            Self::Error(reason) => write!(f, "{}", reason),
        }
    }
}

struct Shared {
    state: watch::Sender<SessionState>,
    close_reason: Mutex<Option<CloseReason>>,
    /// Set once the service acknowledged the setup
    opened: AtomicBool,
}

impl Shared {
    /// Move from a live state to `to`, recording why
    ///
    /// Returns false (and changes nothing) if the session already left
    /// `Connecting`/`Open`.
    fn end(&self, to: SessionState, reason: CloseReason) -> bool {
        self.state.send_if_modified(|state| match state {
            SessionState::Connecting | SessionState::Open => {
                *lock(&self.close_reason) = Some(reason);
                *state = to;
                true
            }
            _ => false,
        })
    }

    /// Fail the session only if it is still waiting for the acknowledgement
    fn expire(&self, reason: String) -> bool {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                *lock(&self.close_reason) = Some(CloseReason::Error(reason));
                *state = SessionState::Failed;
                true
            } else {
                false
            }
        })
    }

    fn open(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                self.opened.store(true, Ordering::SeqCst);
                *state = SessionState::Open;
                true
            } else {
                false
            }
        })
    }

    fn current(&self) -> SessionState {
        *self.state.borrow()
    }
}

/// One live session with the conversational service
///
/// `open` returns immediately in `Connecting`. Chunks sent before the service
/// acknowledges the setup are queued and flushed once the session is `Open`.
/// A session that is not acknowledged within its open timeout fails.
pub struct SessionHandle {
    id: String,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<RealtimeInput>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    pub fn open(
        transport: Arc<dyn LiveTransport>,
        session_id: impl Into<String>,
        setup: SetupMessage,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        Self::open_with_timeout(transport, session_id, setup, DEFAULT_OPEN_TIMEOUT)
    }

    /// Like `open`, failing the session if it is not acknowledged in time
    pub fn open_with_timeout(
        transport: Arc<dyn LiveTransport>,
        session_id: impl Into<String>,
        setup: SetupMessage,
        open_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let id = session_id.into();
        let (state, _) = watch::channel(SessionState::Connecting);
        let shared = Arc::new(Shared {
            state,
            close_reason: Mutex::new(None),
            opened: AtomicBool::new(false),
        });

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        info!("Opening session {} via {}", id, transport.name());

        let driver = tokio::spawn(drive(
            transport,
            id.clone(),
            setup,
            Arc::clone(&shared),
            outbound_rx,
            events_tx,
            Instant::now() + open_timeout,
        ));

        let handle = Self {
            id,
            shared,
            outbound: outbound_tx,
            driver: Mutex::new(Some(driver)),
        };

        (handle, events_rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.shared.current()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        lock(&self.shared.close_reason).clone()
    }

    /// Queue one chunk for the service; never blocks
    pub fn send(&self, chunk: EncodedChunk) -> Result<()> {
        let state = self.shared.current();
        if state.is_closed() {
            debug!("Session {} refused chunk in {:?}", self.id, state);
            return Err(ConverseError::SendAfterClose);
        }

        self.outbound
            .send(RealtimeInput::from_chunk(&chunk))
            .map_err(|_| ConverseError::SendAfterClose)
    }

    /// Resolve once the session leaves `Connecting`
    ///
    /// A session that opened and then failed reports `SessionErrored`; one
    /// that never opened reports `SessionOpenFailed`.
    pub async fn wait_open(&self) -> Result<()> {
        let mut state_rx = self.shared.state.subscribe();
        let state = state_rx
            .wait_for(|s| *s != SessionState::Connecting)
            .await
            .map(|s| *s)
            .map_err(|_| ConverseError::SessionOpenFailed("session dropped".into()))?;

        if state == SessionState::Open {
            return Ok(());
        }

        let opened = self.shared.opened.load(Ordering::SeqCst);
        let failure = |reason: String| {
            if opened {
                ConverseError::SessionErrored(reason)
            } else {
                ConverseError::SessionOpenFailed(reason)
            }
        };

        match self.close_reason() {
            Some(CloseReason::Local) => Err(ConverseError::Cancelled),
            Some(CloseReason::Remote(reason)) => {
                Err(failure(reason.unwrap_or_else(|| "closed by remote".into())))
            }
            Some(CloseReason::Error(reason)) => Err(failure(reason)),
            None => Err(failure(format!("{:?}", state))),
        }
    }

    /// Close the session; safe to call repeatedly and from any state
    pub async fn close(&self) {
        let closing = self.shared.end(SessionState::Closing, CloseReason::Local);

        let driver = lock(&self.driver).take();
        if let Some(mut driver) = driver {
            match tokio::time::timeout(CLOSE_GRACE, &mut driver).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!("Session {} driver panicked: {}", self.id, e),
                Err(_) => {
                    warn!("Session {} driver did not finish in time, aborting", self.id);
                    driver.abort();
                }
            }
        }

        if closing {
            self.shared.state.send_replace(SessionState::Closed);
            info!("Session {} closed", self.id);
        }
    }
}

impl ChunkSink for SessionHandle {
    fn send_chunk(&self, chunk: EncodedChunk) -> Result<()> {
        self.send(chunk)
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(driver) = lock(&self.driver).take() {
            driver.abort();
        }
    }
}

/// Resolves once the session is closing, closed or failed
async fn until_closed(state_rx: &mut watch::Receiver<SessionState>) {
    let _ = state_rx.wait_for(|s| s.is_closed()).await.map(|_| ());
}

/// Resolves once the session left `Connecting`
async fn until_settled(state_rx: &mut watch::Receiver<SessionState>) -> SessionState {
    state_rx
        .wait_for(|s| *s != SessionState::Connecting)
        .await
        .map(|s| *s)
        .unwrap_or(SessionState::Closed)
}

async fn drive(
    transport: Arc<dyn LiveTransport>,
    id: String,
    setup: SetupMessage,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedReceiver<RealtimeInput>,
    events: mpsc::UnboundedSender<SessionEvent>,
    open_deadline: Instant,
) {
    let mut state_rx = shared.state.subscribe();

    let connected = tokio::select! {
        result = transport.connect(&id, setup) => result,
        _ = until_closed(&mut state_rx) => {
            debug!("Session {} closed while connecting", id);
            return;
        }
        _ = tokio::time::sleep_until(open_deadline) => {
            expire(&id, &shared, &events);
            return;
        }
    };

    let TransportLink {
        outbound: link_tx,
        inbound: link_rx,
    } = match connected {
        Ok(link) => link,
        Err(e) => {
            warn!("Session {} failed to connect: {}", id, e);
            let reason = e.to_string();
            if shared.end(SessionState::Failed, CloseReason::Error(reason.clone())) {
                let _ = events.send(SessionEvent::Errored(reason));
            }
            return;
        }
    };

    // The two directions never wait on each other: a full outbound link
    // stalls only the forwarder while inbound events keep flowing
    tokio::join!(
        forward_outbound(&id, &shared, outbound, link_tx, &events),
        receive_inbound(&id, &shared, link_rx, &events),
        enforce_open_deadline(&id, &shared, &events, open_deadline),
    );

    debug!("Session {} driver finished", id);
}

/// Client → service; holds input until the session is open
async fn forward_outbound(
    id: &str,
    shared: &Shared,
    mut outbound: mpsc::UnboundedReceiver<RealtimeInput>,
    link_tx: mpsc::Sender<RealtimeInput>,
    events: &mpsc::UnboundedSender<SessionEvent>,
) {
    let mut state_rx = shared.state.subscribe();
    if until_settled(&mut state_rx).await != SessionState::Open {
        return;
    }

    loop {
        let input = tokio::select! {
            input = outbound.recv() => input,
            _ = until_closed(&mut state_rx) => break,
        };
        let Some(input) = input else {
            break;
        };

        let sent = tokio::select! {
            sent = link_tx.send(input) => sent,
            _ = until_closed(&mut state_rx) => break,
        };
        if sent.is_err() {
            let reason = "transport stopped accepting input".to_string();
            if shared.end(SessionState::Failed, CloseReason::Error(reason.clone())) {
                let _ = events.send(SessionEvent::Errored(reason));
            }
            break;
        }
    }

    // A local close still delivers what was queued while the session was open
    if shared.current() == SessionState::Closing {
        let mut flushed = 0usize;
        while let Ok(input) = outbound.try_recv() {
            if link_tx.send(input).await.is_err() {
                break;
            }
            flushed += 1;
        }
        if flushed > 0 {
            debug!("Session {} flushed {} queued chunks on close", id, flushed);
        }
    }

    // Dropping the link sender tells the transport to close the remote session
    drop(link_tx);
}

/// Service → client until the session leaves its live states
async fn receive_inbound(
    id: &str,
    shared: &Shared,
    mut link_rx: mpsc::Receiver<TransportEvent>,
    events: &mpsc::UnboundedSender<SessionEvent>,
) {
    let mut state_rx = shared.state.subscribe();

    loop {
        let event = tokio::select! {
            event = link_rx.recv() => event,
            _ = until_closed(&mut state_rx) => break,
        };

        match event {
            Some(TransportEvent::Message(message)) => {
                if !handle_message(id, shared, events, message) {
                    break;
                }
            }
            Some(TransportEvent::Closed { reason }) => {
                info!("Session {} closed by remote: {:?}", id, reason);
                if shared.end(SessionState::Closed, CloseReason::Remote(reason.clone())) {
                    let _ = events.send(SessionEvent::Closed { reason });
                }
                break;
            }
            Some(TransportEvent::Error(reason)) => {
                warn!("Session {} transport error: {}", id, reason);
                if shared.end(SessionState::Failed, CloseReason::Error(reason.clone())) {
                    let _ = events.send(SessionEvent::Errored(reason));
                }
                break;
            }
            None => {
                info!("Session {} link dropped by transport", id);
                if shared.end(SessionState::Closed, CloseReason::Remote(None)) {
                    let _ = events.send(SessionEvent::Closed { reason: None });
                }
                break;
            }
        }
    }
}

async fn enforce_open_deadline(
    id: &str,
    shared: &Shared,
    events: &mpsc::UnboundedSender<SessionEvent>,
    deadline: Instant,
) {
    let mut state_rx = shared.state.subscribe();

    tokio::select! {
        _ = until_settled(&mut state_rx) => {}
        _ = tokio::time::sleep_until(deadline) => expire(id, shared, events),
    }
}

fn expire(id: &str, shared: &Shared, events: &mpsc::UnboundedSender<SessionEvent>) {
    let reason = "service did not acknowledge the setup in time".to_string();
    if shared.expire(reason.clone()) {
        warn!("Session {} not acknowledged in time", id);
        let _ = events.send(SessionEvent::Errored(reason));
    }
}

/// Translate one server message into events; false ends the session
fn handle_message(
    id: &str,
    shared: &Shared,
    events: &mpsc::UnboundedSender<SessionEvent>,
    message: ServerMessage,
) -> bool {
    if message.setup_complete.is_some() && shared.open() {
        info!("Session {} open", id);
    }

    if let Some(error) = message.error {
        warn!("Session {} error from service: {}", id, error.message);
        if shared.end(
            SessionState::Failed,
            CloseReason::Error(error.message.clone()),
        ) {
            let _ = events.send(SessionEvent::Errored(error.message));
        }
        return false;
    }

    let Some(content) = message.server_content else {
        return true;
    };

    if let Some(turn) = content.model_turn {
        for part in turn.parts {
            let Some(inline) = part.inline_data else {
                continue;
            };
            match inline.to_chunk() {
                Ok(chunk) => {
                    debug!(
                        "Session {} received {} samples at {}Hz",
                        id,
                        chunk.sample_count(),
                        chunk.sample_rate
                    );
                    let _ = events.send(SessionEvent::AudioChunkReceived(chunk));
                }
                Err(e) => warn!("Session {} dropped audio part: {}", id, e),
            }
        }
    }

    if content.interrupted {
        debug!("Session {} interrupted", id);
        let _ = events.send(SessionEvent::Interrupted);
    }

    if content.turn_complete {
        let _ = events.send(SessionEvent::TurnComplete);
    }

    true
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
