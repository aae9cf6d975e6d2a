//! Conversation lifecycle management
//!
//! This module provides the `ConversationManager` that ties together:
//! - Input and output device acquisition
//! - The live session with the conversational service
//! - Capture (mic → service) and playback (service → speakers)
//! - Mute, status reporting and teardown

mod config;
mod manager;
mod stats;

pub use config::ConversationConfig;
pub use manager::ConversationManager;
pub use stats::{
    ConversationPhase, ConversationStats, ConversationStatus, STATUS_CLOSED, STATUS_CONNECTED,
    STATUS_CONNECTING, STATUS_DISCONNECTED, STATUS_DISCONNECTING, STATUS_INITIALIZING,
    STATUS_READY,
};
