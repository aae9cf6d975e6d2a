pub mod backend;
pub mod capture;
pub mod codec;
pub mod file;
pub mod headless;
pub mod output;
pub mod playback;

#[cfg(feature = "audio-cpal")]
pub mod cpal;
#[cfg(feature = "audio-cpal")]
pub mod resample;

pub use backend::{
    AudioBackend, AudioBackendConfig, AudioBackendFactory, AudioFrame, AudioSink, AudioSource,
    DefaultDevices, DeviceProvider,
};
pub use capture::{CaptureHandle, CapturePipeline, CaptureStats, ChunkSink};
pub use codec::{EncodedChunk, PlayableBuffer};
pub use file::{AudioFile, FileBackend};
pub use headless::{HeadlessOutput, ManualClock, OutputEvent};
pub use output::{CancelledPlayback, OutputDevice, PlaybackId};
pub use playback::{PlaybackScheduler, PlaybackStats, ScheduledPlayback};
