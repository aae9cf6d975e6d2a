use futures::stream::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::messages::{RealtimeInput, ServerMessage, SetupMessage};
use super::{LiveTransport, TransportEvent, TransportLink};
use crate::error::{ConverseError, Result};

const LINK_CAPACITY: usize = 256;

/// Reaches the conversational service through a NATS bridge
///
/// Per session, JSON messages flow on:
/// - `<prefix>.<id>.setup`: the setup message (published once)
/// - `<prefix>.<id>.input`: one `RealtimeInput` per captured chunk
/// - `<prefix>.<id>.close`: empty object when the client closes
/// - `<prefix>.<id>.output`: `ServerMessage`s from the service; an empty
///   payload means the service closed the session
pub struct NatsTransport {
    url: String,
    subject_prefix: String,
}

impl NatsTransport {
    pub fn new(url: impl Into<String>, subject_prefix: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            subject_prefix: subject_prefix.into(),
        }
    }

    fn subject(&self, session_id: &str, leaf: &str) -> String {
        format!("{}.{}.{}", self.subject_prefix, session_id, leaf)
    }
}

#[async_trait::async_trait]
impl LiveTransport for NatsTransport {
    async fn connect(&self, session_id: &str, setup: SetupMessage) -> Result<TransportLink> {
        info!("Connecting to NATS at {}", self.url);

        let client = async_nats::connect(self.url.as_str())
            .await
            .map_err(|e| ConverseError::SessionOpenFailed(format!("NATS connect: {}", e)))?;

        info!("Connected to NATS successfully");

        // Subscribe first so the setup acknowledgement cannot be missed
        let output = self.subject(session_id, "output");
        let mut subscriber = client
            .subscribe(output.clone())
            .await
            .map_err(|e| ConverseError::SessionOpenFailed(format!("subscribe {}: {}", output, e)))?;

        let setup_subject = self.subject(session_id, "setup");
        let payload = serde_json::to_vec(&setup)?;
        client
            .publish(setup_subject.clone(), payload.into())
            .await
            .map_err(|e| ConverseError::SessionOpenFailed(format!("publish setup: {}", e)))?;

        info!("Published setup to {} (model={})", setup_subject, setup.setup.model);

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<RealtimeInput>(LINK_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<TransportEvent>(LINK_CAPACITY);

        let reader_tx = inbound_tx.clone();
        let reader_id = session_id.to_string();
        let reader = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                let event = if message.payload.is_empty() {
                    TransportEvent::Closed { reason: None }
                } else {
                    match serde_json::from_slice::<ServerMessage>(&message.payload) {
                        Ok(parsed) => TransportEvent::Message(parsed),
                        Err(e) => {
                            warn!("Session {} ignored unparseable output: {}", reader_id, e);
                            continue;
                        }
                    }
                };

                let closed = matches!(event, TransportEvent::Closed { .. });
                if reader_tx.send(event).await.is_err() || closed {
                    return;
                }
            }

            debug!("Session {} output subscription ended", reader_id);
            let _ = reader_tx.send(TransportEvent::Closed { reason: None }).await;
        });

        let input_subject = self.subject(session_id, "input");
        let close_subject = self.subject(session_id, "close");
        let writer_id = session_id.to_string();
        tokio::spawn(async move {
            let mut published: u64 = 0;

            while let Some(input) = outbound_rx.recv().await {
                let payload = match serde_json::to_vec(&input) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Session {} could not encode input: {}", writer_id, e);
                        continue;
                    }
                };

                if let Err(e) = client.publish(input_subject.clone(), payload.into()).await {
                    let _ = inbound_tx
                        .send(TransportEvent::Error(format!("publish input: {}", e)))
                        .await;
                    break;
                }
                published += 1;
            }

            if let Err(e) = client.publish(close_subject.clone(), "{}".into()).await {
                warn!("Session {} failed to publish close: {}", writer_id, e);
            }
            if let Err(e) = client.flush().await {
                debug!("Session {} flush on close failed: {}", writer_id, e);
            }

            reader.abort();
            info!(
                "Session {} NATS link closed ({} chunks published)",
                writer_id, published
            );
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }

    fn name(&self) -> &str {
        "nats"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subjects_are_scoped_by_session() {
        let transport = NatsTransport::new("nats://localhost:4222", "live.session");

        assert_eq!(transport.subject("abc", "input"), "live.session.abc.input");
        assert_eq!(transport.subject("abc", "output"), "live.session.abc.output");
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_open() {
        let transport = NatsTransport::new("nats://127.0.0.1:1", "live.session");
        let setup = SetupMessage::audio("m", "v", "i");

        let result = transport.connect("abc", setup).await;

        assert!(matches!(result, Err(ConverseError::SessionOpenFailed(_))));
    }
}
