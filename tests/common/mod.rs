// Shared fixtures for integration tests: scripted input, headless output on a
// manual clock, and a simulated service.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use loqa_converse::audio::{
    AudioBackend, AudioBackendConfig, AudioFrame, DeviceProvider, HeadlessOutput, ManualClock,
    OutputDevice,
};
use loqa_converse::session::{ConversationConfig, ConversationManager};
use loqa_converse::transport::simulated::{SimulatedPeer, SimulatedServer, SimulatedTransport};
use loqa_converse::transport::LiveTransport;
use loqa_converse::{ConverseError, Result};
use tokio::sync::mpsc;

pub const BLOCK: usize = 4096;

#[derive(Debug, Default)]
pub struct DeviceCounters {
    pub input_opens: AtomicUsize,
    pub input_stops: AtomicUsize,
    pub output_opens: AtomicUsize,
}

impl DeviceCounters {
    pub fn input_opens(&self) -> usize {
        self.input_opens.load(Ordering::SeqCst)
    }

    pub fn input_stops(&self) -> usize {
        self.input_stops.load(Ordering::SeqCst)
    }

    pub fn output_opens(&self) -> usize {
        self.output_opens.load(Ordering::SeqCst)
    }
}

/// Input device that delivers a fixed list of frames and then stays open
pub struct ScriptedInput {
    frames: Vec<AudioFrame>,
    counters: Arc<DeviceCounters>,
    fail_start: bool,
    sender: Option<mpsc::Sender<AudioFrame>>,
}

#[async_trait::async_trait]
impl AudioBackend for ScriptedInput {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>> {
        if self.fail_start {
            return Err(ConverseError::DeviceUnavailable("device busy".into()));
        }

        let (tx, rx) = mpsc::channel(self.frames.len().max(1));
        for frame in self.frames.drain(..) {
            let _ = tx.try_send(frame);
        }
        self.sender = Some(tx);
        Ok(rx)
    }

    async fn stop(&mut self) -> Result<()> {
        self.sender = None;
        self.counters.input_stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.sender.is_some()
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

pub struct TestDevices {
    pub frames: Vec<AudioFrame>,
    pub counters: Arc<DeviceCounters>,
    pub clock: ManualClock,
    pub fail_input_open: bool,
    pub fail_input_start: bool,
    pub fail_output: bool,
    outputs: Mutex<Vec<Arc<HeadlessOutput>>>,
}

impl TestDevices {
    pub fn new(frames: Vec<AudioFrame>) -> Self {
        Self {
            frames,
            counters: Arc::new(DeviceCounters::default()),
            clock: ManualClock::new(5.0),
            fail_input_open: false,
            fail_input_start: false,
            fail_output: false,
            outputs: Mutex::new(Vec::new()),
        }
    }

    /// The output device of the most recent conversation
    pub fn output(&self) -> Arc<HeadlessOutput> {
        self.outputs
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no output device opened")
    }
}

impl DeviceProvider for TestDevices {
    fn open_input(&self, _config: &AudioBackendConfig) -> Result<Box<dyn AudioBackend>> {
        if self.fail_input_open {
            return Err(ConverseError::DeviceUnavailable(
                "microphone permission denied".into(),
            ));
        }

        self.counters.input_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedInput {
            frames: self.frames.clone(),
            counters: Arc::clone(&self.counters),
            fail_start: self.fail_input_start,
            sender: None,
        }))
    }

    fn open_output(&self, sample_rate: u32) -> Result<Arc<dyn OutputDevice>> {
        if self.fail_output {
            return Err(ConverseError::DeviceUnavailable("no speakers".into()));
        }

        self.counters.output_opens.fetch_add(1, Ordering::SeqCst);
        let output = Arc::new(HeadlessOutput::manual(sample_rate, self.clock.clone()));
        self.outputs.lock().unwrap().push(Arc::clone(&output));
        Ok(output)
    }
}

pub struct Harness {
    pub manager: ConversationManager,
    pub devices: Arc<TestDevices>,
    pub transport: Arc<SimulatedTransport>,
    pub server: SimulatedServer,
}

pub fn harness(devices: TestDevices) -> Harness {
    harness_with_config(devices, ConversationConfig::default())
}

pub fn harness_with_config(devices: TestDevices, config: ConversationConfig) -> Harness {
    let devices = Arc::new(devices);
    let (transport, server) = SimulatedTransport::new();
    let transport = Arc::new(transport);

    let provider: Arc<dyn DeviceProvider> = devices.clone();
    let live: Arc<dyn LiveTransport> = transport.clone();
    let manager = ConversationManager::new(config, provider, live);

    Harness {
        manager,
        devices,
        transport,
        server,
    }
}

pub fn silent_frames(count: usize) -> Vec<AudioFrame> {
    (0..count)
        .map(|i| AudioFrame::silence(BLOCK, 16000, (i * 256) as u64))
        .collect()
}

/// Start a conversation and play the service side until it is active
pub async fn start_active(h: &mut Harness) -> (String, SimulatedPeer) {
    let manager = h.manager.clone();
    let start = tokio::spawn(async move { manager.start().await });

    let peer = h.server.accept().await.expect("no connection");
    peer.acknowledge().await;

    let id = start.await.unwrap().expect("conversation did not start");
    (id, peer)
}

/// Poll until `check` holds, failing after five seconds
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met within 5s");
}
