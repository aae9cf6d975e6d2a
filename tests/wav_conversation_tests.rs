// Integration tests for WAV-driven conversations
//
// These tests replay a WAV file through the default device provider (file
// input, headless output) and check what reaches the simulated service.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use loqa_converse::audio::codec;
use loqa_converse::transport::simulated::SimulatedTransport;
use loqa_converse::{
    AudioSink, AudioSource, ConversationConfig, ConversationManager, ConversationPhase,
    DefaultDevices, DeviceProvider, LiveTransport,
};
use tempfile::TempDir;

fn write_wav(dir: &TempDir, samples: &[i16]) -> Result<PathBuf> {
    let path = dir.path().join("question.wav");
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(&path, spec)?;
    for &s in samples {
        writer.write_sample(s)?;
    }
    writer.finalize()?;

    Ok(path)
}

#[tokio::test]
async fn test_wav_file_is_streamed_to_the_service() -> Result<()> {
    let temp_dir = TempDir::new()?;

    // Two blocks: the first at +0.5, the second at -0.5
    let mut samples = vec![16384i16; 4096];
    samples.extend(vec![-16384i16; 4096]);
    let path = write_wav(&temp_dir, &samples)?;

    let devices: Arc<dyn DeviceProvider> = Arc::new(DefaultDevices::new(
        AudioSource::File {
            path,
            realtime: false,
        },
        AudioSink::Headless,
    ));
    let (transport, mut server) = SimulatedTransport::new();
    let transport: Arc<dyn LiveTransport> = Arc::new(transport);
    let manager = ConversationManager::new(ConversationConfig::default(), devices, transport);

    let starter = manager.clone();
    let start = tokio::spawn(async move { starter.start().await });

    let mut peer = server.accept().await.expect("no connection");
    peer.acknowledge().await;
    start.await??;

    let first = peer.recv_client().await.expect("first block").to_chunk()?;
    let second = peer.recv_client().await.expect("second block").to_chunk()?;

    let first = codec::decode(&first.data, first.sample_rate, 1)?;
    let second = codec::decode(&second.data, second.sample_rate, 1)?;

    assert_eq!(first.samples.len(), 4096);
    assert!(first.samples.iter().all(|s| (*s - 16384.0 / 32767.0).abs() < 1e-6));
    assert!(second.samples.iter().all(|s| (*s + 0.5).abs() < 1e-6));

    let stats = manager.stop().await.expect("conversation was running");
    assert_eq!(stats.capture.frames_sent, 2);
    assert_eq!(manager.status().phase, ConversationPhase::Idle);

    Ok(())
}

#[tokio::test]
async fn test_wav_at_wrong_rate_fails_to_start() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("hifi.wav");
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 44100,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec)?;
    writer.write_sample(0i16)?;
    writer.finalize()?;

    let devices: Arc<dyn DeviceProvider> = Arc::new(DefaultDevices::new(
        AudioSource::File {
            path,
            realtime: false,
        },
        AudioSink::Headless,
    ));
    let (transport, _server) = SimulatedTransport::new();
    let manager =
        ConversationManager::new(ConversationConfig::default(), devices, Arc::new(transport));

    let result = manager.start().await;

    assert!(result.is_err());
    let status = manager.status();
    assert_eq!(status.phase, ConversationPhase::Idle);
    assert!(status.message.starts_with("Failed to connect: "));

    Ok(())
}
