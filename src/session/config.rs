use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::AudioBackendConfig;
use crate::transport::SetupMessage;

/// Everything one conversation needs to know up front
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Model identifier sent in the setup message
    pub model: String,

    /// Prebuilt voice for synthesized replies
    pub voice: String,

    /// Persona / system instruction
    pub system_instruction: String,

    /// Capture rate sent to the service (16kHz)
    pub input_sample_rate: u32,

    /// Rate assumed for replies that do not declare one (24kHz)
    pub output_sample_rate: u32,

    /// Samples per captured frame
    pub block_size: usize,

    /// Frames buffered between the input device and the capture loop
    pub frame_queue: usize,

    /// Start with the microphone muted
    pub start_muted: bool,

    /// Seconds the service gets to acknowledge the setup
    pub open_timeout_secs: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
            voice: "Zephyr".to_string(),
            system_instruction:
                "You are a helpful, witty, and concise AI assistant. Keep responses short and conversational."
                    .to_string(),
            input_sample_rate: 16000,
            output_sample_rate: 24000,
            block_size: 4096, // ~256ms at 16kHz
            frame_queue: 32,
            start_muted: false,
            open_timeout_secs: 15,
        }
    }
}

impl ConversationConfig {
    pub fn setup_message(&self) -> SetupMessage {
        SetupMessage::audio(&self.model, &self.voice, &self.system_instruction)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs.max(1))
    }

    pub fn backend_config(&self) -> AudioBackendConfig {
        AudioBackendConfig {
            target_sample_rate: self.input_sample_rate,
            target_channels: 1,
            block_size: self.block_size,
            frame_queue: self.frame_queue,
        }
    }
}
