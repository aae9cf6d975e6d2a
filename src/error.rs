use thiserror::Error;

/// Errors produced by the conversation core.
#[derive(Debug, Error)]
pub enum ConverseError {
    /// Microphone or speaker could not be acquired (permission or hardware).
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A PCM payload was not frame-aligned or not decodable.
    #[error("malformed audio: {0}")]
    MalformedAudio(String),

    #[error("session open failed: {0}")]
    SessionOpenFailed(String),

    #[error("session errored: {0}")]
    SessionErrored(String),

    /// A send raced with an asynchronous close. Callers swallow this.
    #[error("send after session close")]
    SendAfterClose,

    #[error("a conversation is already running")]
    AlreadyRunning,

    #[error("conversation start cancelled")]
    Cancelled,

    #[error("playback error: {0}")]
    Playback(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConverseError {
    pub fn malformed(len: usize, frame_size: usize) -> Self {
        Self::MalformedAudio(format!(
            "{} bytes is not a multiple of the {}-byte frame size",
            len, frame_size
        ))
    }
}

pub type Result<T> = std::result::Result<T, ConverseError>;
