use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::audio::{CaptureStats, PlaybackStats};

pub const STATUS_READY: &str = "Ready to connect";
pub const STATUS_INITIALIZING: &str = "Initializing audio...";
pub const STATUS_CONNECTING: &str = "Connecting...";
pub const STATUS_CONNECTED: &str = "Connected! Speak now.";
pub const STATUS_DISCONNECTING: &str = "Disconnecting...";
pub const STATUS_CLOSED: &str = "Connection closed";
pub const STATUS_DISCONNECTED: &str = "Disconnected";

/// Where the conversation is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationPhase {
    Idle,
    Connecting,
    Active,
    Stopping,
    /// Cleanup after an error; always followed by `Idle`
    Failed,
}

/// What the user sees
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationStatus {
    pub phase: ConversationPhase,

    /// Human-readable status line
    pub message: String,

    pub muted: bool,

    /// Identifier of the running conversation, if any
    pub session_id: Option<String>,

    /// Reason of the most recent failure
    pub last_error: Option<String>,
}

impl ConversationStatus {
    pub fn idle(muted: bool) -> Self {
        Self {
            phase: ConversationPhase::Idle,
            message: STATUS_READY.to_string(),
            muted,
            session_id: None,
            last_error: None,
        }
    }
}

/// Statistics about one conversation
#[derive(Debug, Clone, Serialize)]
pub struct ConversationStats {
    pub session_id: String,

    /// When the conversation started
    pub started_at: DateTime<Utc>,

    /// Total duration in seconds
    pub duration_secs: f64,

    pub capture: CaptureStats,

    pub playback: PlaybackStats,
}
