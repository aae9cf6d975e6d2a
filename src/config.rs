use anyhow::{Context, Result};
use serde::Deserialize;

use crate::session::ConversationConfig;

/// Environment override prefix, e.g. `LOQA_CONVERSE__LIVE__VOICE=Puck`
const ENV_PREFIX: &str = "LOQA_CONVERSE";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub http: HttpConfig,
    pub live: LiveConfig,
    pub audio: AudioConfig,
    pub nats: NatsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

/// Model, voice and persona for the conversational service
#[derive(Debug, Clone, Deserialize)]
pub struct LiveConfig {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    /// Seconds the service gets to acknowledge a new session
    pub open_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub block_size: usize,
    pub frame_queue: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    pub url: String,
    pub subject_prefix: String,
}

impl Config {
    /// Load from an optional file (any format the `config` crate knows,
    /// extension optional) with `LOQA_CONVERSE__*` environment overrides
    pub fn load(path: &str) -> Result<Self> {
        let defaults = ConversationConfig::default();

        let settings = config::Config::builder()
            .set_default("service.name", "loqa-converse")?
            .set_default("http.bind", "127.0.0.1")?
            .set_default("http.port", 3000_i64)?
            .set_default("live.model", defaults.model.as_str())?
            .set_default("live.voice", defaults.voice.as_str())?
            .set_default("live.system_instruction", defaults.system_instruction.as_str())?
            .set_default("live.open_timeout_secs", defaults.open_timeout_secs as i64)?
            .set_default("audio.input_sample_rate", defaults.input_sample_rate as i64)?
            .set_default("audio.output_sample_rate", defaults.output_sample_rate as i64)?
            .set_default("audio.block_size", defaults.block_size as i64)?
            .set_default("audio.frame_queue", defaults.frame_queue as i64)?
            .set_default("nats.url", "nats://localhost:4222")?
            .set_default("nats.subject_prefix", "live.session")?
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .with_context(|| format!("Failed to load config from {}", path))?;

        settings
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Per-conversation settings derived from this config
    pub fn conversation(&self, start_muted: bool) -> ConversationConfig {
        ConversationConfig {
            model: self.live.model.clone(),
            voice: self.live.voice.clone(),
            system_instruction: self.live.system_instruction.clone(),
            input_sample_rate: self.audio.input_sample_rate,
            output_sample_rate: self.audio.output_sample_rate,
            block_size: self.audio.block_size,
            frame_queue: self.audio.frame_queue,
            start_muted,
            open_timeout_secs: self.live.open_timeout_secs,
        }
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.http.bind, self.http.port)
    }
}
