pub mod audio;
pub mod config;
pub mod error;
pub mod http;
pub mod session;
pub mod transport;

pub use audio::{
    AudioBackend, AudioBackendConfig, AudioBackendFactory, AudioFile, AudioFrame, AudioSink,
    AudioSource, DefaultDevices, DeviceProvider, EncodedChunk, HeadlessOutput, OutputDevice,
    PlayableBuffer, PlaybackScheduler,
};
pub use config::Config;
pub use error::{ConverseError, Result};
pub use http::{create_router, AppState};
pub use session::{
    ConversationConfig, ConversationManager, ConversationPhase, ConversationStats,
    ConversationStatus,
};
pub use transport::{
    LiveTransport, NatsTransport, SessionEvent, SessionHandle, SetupMessage, SimulatedTransport,
};
