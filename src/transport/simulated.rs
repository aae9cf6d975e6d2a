//! In-process transport for tests and demos.
//!
//! Every `connect` hands a `SimulatedPeer` to the paired `SimulatedServer`;
//! the test then plays the remote service through the peer: read what the
//! client sent, acknowledge setup, stream audio back, interrupt, fail or close.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::info;

use super::messages::{
    InlineData, ModelTurn, Part, RealtimeInput, ServerContent, ServerError, ServerMessage,
    SetupMessage,
};
use super::{LiveTransport, TransportEvent, TransportLink};
use crate::audio::codec::EncodedChunk;
use crate::error::{ConverseError, Result};

const LINK_CAPACITY: usize = 256;

/// Client side of the simulation
pub struct SimulatedTransport {
    peers: mpsc::UnboundedSender<SimulatedPeer>,
    connect_failure: Mutex<Option<String>>,
    connects: AtomicU64,
}

/// Remote side of the simulation; yields one peer per connect
pub struct SimulatedServer {
    peers: mpsc::UnboundedReceiver<SimulatedPeer>,
}

impl SimulatedTransport {
    pub fn new() -> (Self, SimulatedServer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            peers: tx,
            connect_failure: Mutex::new(None),
            connects: AtomicU64::new(0),
        };
        (transport, SimulatedServer { peers: rx })
    }

    /// Make the next `connect` fail with `reason`
    pub fn fail_next_connect(&self, reason: impl Into<String>) {
        *self
            .connect_failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(reason.into());
    }

    /// Number of connect attempts so far
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LiveTransport for SimulatedTransport {
    async fn connect(&self, session_id: &str, setup: SetupMessage) -> Result<TransportLink> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let failure = self
            .connect_failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(reason) = failure {
            return Err(ConverseError::SessionOpenFailed(reason));
        }

        let (client_tx, client_rx) = mpsc::channel(LINK_CAPACITY);
        let (server_tx, server_rx) = mpsc::channel(LINK_CAPACITY);

        let peer = SimulatedPeer {
            session_id: session_id.to_string(),
            setup,
            client: client_rx,
            server: server_tx,
        };
        self.peers
            .send(peer)
            .map_err(|_| ConverseError::SessionOpenFailed("simulated server is gone".into()))?;

        info!("Simulated session {} connected", session_id);

        Ok(TransportLink {
            outbound: client_tx,
            inbound: server_rx,
        })
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

impl SimulatedServer {
    /// Wait for the next client connection
    pub async fn accept(&mut self) -> Option<SimulatedPeer> {
        self.peers.recv().await
    }
}

/// The remote end of one simulated session
pub struct SimulatedPeer {
    pub session_id: String,
    pub setup: SetupMessage,
    client: mpsc::Receiver<RealtimeInput>,
    server: mpsc::Sender<TransportEvent>,
}

impl SimulatedPeer {
    /// Next message from the client; `None` once the client closed the link
    pub async fn recv_client(&mut self) -> Option<RealtimeInput> {
        self.client.recv().await
    }

    /// Non-blocking variant of `recv_client`
    pub fn try_recv_client(&mut self) -> Option<RealtimeInput> {
        self.client.try_recv().ok()
    }

    /// Wait until the client drops its side of the link, discarding input
    pub async fn wait_closed(&mut self) {
        while self.client.recv().await.is_some() {}
    }

    pub async fn send_message(&self, message: ServerMessage) -> bool {
        self.server
            .send(TransportEvent::Message(message))
            .await
            .is_ok()
    }

    /// Send `setupComplete`
    pub async fn acknowledge(&self) -> bool {
        self.send_message(ServerMessage {
            setup_complete: Some(serde_json::json!({})),
            ..Default::default()
        })
        .await
    }

    /// One model turn carrying each chunk as an inline audio part
    pub async fn send_audio(&self, chunks: &[EncodedChunk]) -> bool {
        let parts = chunks
            .iter()
            .map(|chunk| Part {
                inline_data: Some(InlineData {
                    data: chunk.to_base64(),
                    sample_rate: Some(chunk.sample_rate),
                    mime_type: Some(chunk.mime_type()),
                }),
                text: None,
            })
            .collect();

        self.send_content(ServerContent {
            model_turn: Some(ModelTurn { parts }),
            ..Default::default()
        })
        .await
    }

    pub async fn interrupt(&self) -> bool {
        self.send_content(ServerContent {
            interrupted: true,
            ..Default::default()
        })
        .await
    }

    pub async fn turn_complete(&self) -> bool {
        self.send_content(ServerContent {
            turn_complete: true,
            ..Default::default()
        })
        .await
    }

    /// Service-level error message (`{"error": {...}}`)
    pub async fn send_error(&self, message: impl Into<String>) -> bool {
        self.send_message(ServerMessage {
            error: Some(ServerError {
                message: message.into(),
            }),
            ..Default::default()
        })
        .await
    }

    /// Link-level failure
    pub async fn fail(&self, reason: impl Into<String>) -> bool {
        self.server
            .send(TransportEvent::Error(reason.into()))
            .await
            .is_ok()
    }

    /// Remote close
    pub async fn close(&self, reason: Option<String>) -> bool {
        self.server
            .send(TransportEvent::Closed { reason })
            .await
            .is_ok()
    }

    async fn send_content(&self, content: ServerContent) -> bool {
        self.send_message(ServerMessage {
            server_content: Some(content),
            ..Default::default()
        })
        .await
    }
}
