//! Bidirectional session with the conversational service.
//!
//! A `LiveTransport` knows how to reach the service and hands back a pair of
//! channels. `SessionHandle` layers the session state machine on top: it waits
//! for the setup acknowledgement, queues sends made while connecting, and turns
//! raw server messages into `SessionEvent`s.

pub mod messages;
pub mod nats;
pub mod session;
pub mod simulated;

use tokio::sync::mpsc;

use crate::audio::codec::EncodedChunk;
use crate::error::Result;

pub use messages::{RealtimeInput, ServerMessage, SetupMessage};
pub use nats::NatsTransport;
pub use session::{CloseReason, SessionHandle, SessionState};
pub use simulated::{SimulatedPeer, SimulatedTransport};

/// What a transport reports about the remote side
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(ServerMessage),
    /// The remote closed the link
    Closed { reason: Option<String> },
    /// The link failed (network, protocol)
    Error(String),
}

/// Channels of one connected session
///
/// Dropping `outbound` tells the transport to close the remote session.
pub struct TransportLink {
    pub outbound: mpsc::Sender<RealtimeInput>,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

/// A way of reaching the conversational service
#[async_trait::async_trait]
pub trait LiveTransport: Send + Sync {
    /// Open the link and send the setup message
    ///
    /// Returns once the setup has been sent; the acknowledgement arrives later
    /// as a `setupComplete` message on `inbound`.
    async fn connect(&self, session_id: &str, setup: SetupMessage) -> Result<TransportLink>;

    fn name(&self) -> &str;
}

/// Events surfaced to the conversation, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    AudioChunkReceived(EncodedChunk),
    /// The user barged in; unplayed audio must go
    Interrupted,
    TurnComplete,
    Closed { reason: Option<String> },
    Errored(String),
}
