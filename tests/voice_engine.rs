//! Voice engine integration tests
//!
//! Drive a full call through `VoiceSessionHandle` with an in-memory
//! microphone, speaker and remote model.

use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use steadycoach::audio::codec::encode_media_blob;
use steadycoach::audio::{
    AudioError, AudioOutput, CaptureTap, Microphone, MicrophoneStream, OutputDevice,
    PlaybackBuffer, VoiceId,
};
use steadycoach::live::{ClientMessage, LiveConnector, LiveError, LiveLink, ServerEvent, SessionConfig};
use steadycoach::transcript::Role;
use steadycoach::voice::{CallPhase, VoiceDevices, VoiceError, VoiceEvent, VoiceSessionHandle};

const WAIT: Duration = Duration::from_secs(2);

// ============================================================================
// Fakes
// ============================================================================

#[derive(Default)]
struct MicState {
    opens: usize,
    closes: usize,
    tap: Option<CaptureTap>,
}

/// Exclusive microphone: a second open while held fails
#[derive(Default)]
struct FakeMicrophone {
    state: Arc<Mutex<MicState>>,
    deny: bool,
}

impl FakeMicrophone {
    fn held(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.opens > state.closes
    }

    fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    fn take_tap(&self) -> CaptureTap {
        self.state.lock().unwrap().tap.take().expect("microphone not open")
    }
}

struct FakeMicStream {
    state: Arc<Mutex<MicState>>,
    closed: bool,
}

impl MicrophoneStream for FakeMicStream {
    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.lock().unwrap().closes += 1;
        }
    }
}

impl Drop for FakeMicStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl Microphone for FakeMicrophone {
    fn open(&self, tap: CaptureTap) -> Result<Box<dyn MicrophoneStream>, AudioError> {
        if self.deny {
            return Err(AudioError::PermissionDenied);
        }
        let mut state = self.state.lock().unwrap();
        if state.opens > state.closes {
            return Err(AudioError::DeviceUnavailable);
        }
        state.opens += 1;
        state.tap = Some(tap);
        Ok(Box::new(FakeMicStream {
            state: self.state.clone(),
            closed: false,
        }))
    }
}

/// Microphone whose `open` blocks until the test lets it through, like a
/// device waiting on a permission prompt
struct GatedMicrophone {
    inner: Arc<FakeMicrophone>,
    gate: Mutex<std_mpsc::Receiver<()>>,
}

impl Microphone for GatedMicrophone {
    fn open(&self, tap: CaptureTap) -> Result<Box<dyn MicrophoneStream>, AudioError> {
        let _ = self.gate.lock().unwrap().recv();
        self.inner.open(tap)
    }
}

#[derive(Default)]
struct OutputLog {
    now: f64,
    started: Vec<(VoiceId, f64, f64)>,
    stopped: Vec<VoiceId>,
    opens: usize,
    closes: usize,
    ended: Option<mpsc::UnboundedSender<VoiceId>>,
}

#[derive(Default)]
struct FakeSpeaker {
    log: Arc<Mutex<OutputLog>>,
}

impl FakeSpeaker {
    fn started(&self) -> Vec<(VoiceId, f64, f64)> {
        self.log.lock().unwrap().started.clone()
    }

    fn stopped(&self) -> Vec<VoiceId> {
        self.log.lock().unwrap().stopped.clone()
    }

    fn finish(&self, id: VoiceId) {
        let log = self.log.lock().unwrap();
        log.ended.as_ref().unwrap().send(id).unwrap();
    }
}

struct FakeOutput {
    log: Arc<Mutex<OutputLog>>,
    closed: bool,
}

impl AudioOutput for FakeOutput {
    fn current_time(&self) -> f64 {
        self.log.lock().unwrap().now
    }

    fn start(&mut self, id: VoiceId, buffer: Arc<PlaybackBuffer>, start_at: f64) {
        self.log
            .lock()
            .unwrap()
            .started
            .push((id, start_at, buffer.duration()));
    }

    fn stop(&mut self, id: VoiceId) {
        self.log.lock().unwrap().stopped.push(id);
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.log.lock().unwrap().closes += 1;
        }
    }
}

impl OutputDevice for FakeSpeaker {
    fn open(
        &self,
        _sample_rate: u32,
        ended: mpsc::UnboundedSender<VoiceId>,
    ) -> Result<Box<dyn AudioOutput>, AudioError> {
        let mut log = self.log.lock().unwrap();
        log.opens += 1;
        log.now = 5.0;
        log.ended = Some(ended);
        Ok(Box::new(FakeOutput {
            log: self.log.clone(),
            closed: false,
        }))
    }
}

/// The test's end of an established link
struct RemoteEnd {
    events: mpsc::Sender<ServerEvent>,
    sent: mpsc::Receiver<ClientMessage>,
}

enum Behaviour {
    /// Hand out a link the test controls
    Accept,
    /// Never finish the handshake
    Hang,
    Reject(LiveError),
}

struct FakeConnector {
    behaviour: Behaviour,
    remotes: Mutex<Vec<RemoteEnd>>,
    calls: Mutex<usize>,
}

impl FakeConnector {
    fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            remotes: Mutex::new(Vec::new()),
            calls: Mutex::new(0),
        })
    }

    fn remote(&self) -> RemoteEnd {
        self.remotes.lock().unwrap().pop().expect("no link handed out")
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl LiveConnector for FakeConnector {
    async fn connect(&self, _config: &SessionConfig) -> Result<LiveLink, LiveError> {
        *self.calls.lock().unwrap() += 1;
        match &self.behaviour {
            Behaviour::Accept => {
                let (out_tx, out_rx) = mpsc::channel(64);
                let (in_tx, in_rx) = mpsc::channel(64);
                self.remotes.lock().unwrap().push(RemoteEnd {
                    events: in_tx,
                    sent: out_rx,
                });
                Ok(LiveLink::new(out_tx, in_rx, CancellationToken::new(), Vec::new()))
            }
            Behaviour::Hang => std::future::pending().await,
            Behaviour::Reject(err) => Err(err.clone()),
        }
    }
}

struct Rig {
    mic: Arc<FakeMicrophone>,
    speaker: Arc<FakeSpeaker>,
    connector: Arc<FakeConnector>,
}

impl Rig {
    fn new(behaviour: Behaviour) -> Self {
        Self {
            mic: Arc::new(FakeMicrophone::default()),
            speaker: Arc::new(FakeSpeaker::default()),
            connector: FakeConnector::new(behaviour),
        }
    }

    fn spawn(&self) -> (VoiceSessionHandle, mpsc::UnboundedReceiver<VoiceEvent>) {
        let devices = VoiceDevices {
            microphone: self.mic.clone(),
            output: self.speaker.clone(),
            connector: self.connector.clone(),
        };
        VoiceSessionHandle::spawn(SessionConfig::new("test-key", "Be an interviewer"), devices)
    }
}

// ============================================================================
// Helpers
// ============================================================================

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<VoiceEvent>) -> VoiceEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Events up to and including `Ended`
async fn events_until_ended(events: &mut mpsc::UnboundedReceiver<VoiceEvent>) -> Vec<VoiceEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let done = matches!(event, VoiceEvent::Ended(_));
        seen.push(event);
        if done {
            return seen;
        }
    }
}

fn chunk(seconds: f64) -> ServerEvent {
    let samples = vec![0.1f32; (24_000.0 * seconds) as usize];
    ServerEvent::AudioChunk(encode_media_blob(&samples, 24_000))
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_connect_opens_call() {
    let rig = Rig::new(Behaviour::Accept);
    let (handle, _events) = rig.spawn();

    handle.connect().await.unwrap();

    let status = handle.status();
    assert_eq!(status.phase, CallPhase::Live);
    assert!(status.connected);
    assert!(!status.ai_speaking);
    assert!(rig.mic.held());
    assert_eq!(rig.connector.calls(), 1);
}

#[tokio::test]
async fn test_disconnect_during_connect_releases_microphone() {
    let rig = Rig::new(Behaviour::Hang);
    let (handle, mut events) = rig.spawn();
    let mut status = handle.subscribe();

    let (connected, ()) = tokio::join!(handle.connect(), async {
        tokio::time::timeout(WAIT, status.wait_for(|s| s.phase == CallPhase::Connecting))
            .await
            .expect("never started connecting")
            .expect("controller stopped");
        // Devices are open once the handshake is under way
        eventually("handshake started", || rig.connector.calls() == 1).await;
        handle.disconnect().await;
    });

    assert_eq!(connected, Err(VoiceError::Cancelled));
    assert_eq!(rig.mic.opens(), 1);
    assert!(!rig.mic.held(), "microphone still held after disconnect");
    assert_eq!(rig.speaker.log.lock().unwrap().closes, 1);
    assert!(matches!(next_event(&mut events).await, VoiceEvent::Ended(_)));
    assert_eq!(handle.status().phase, CallPhase::Idle);
}

#[tokio::test]
async fn test_disconnect_does_not_wait_for_blocked_microphone() {
    let mic = Arc::new(FakeMicrophone::default());
    let (open_tx, open_rx) = std_mpsc::channel();
    let speaker = Arc::new(FakeSpeaker::default());
    let connector = FakeConnector::new(Behaviour::Accept);
    let devices = VoiceDevices {
        microphone: Arc::new(GatedMicrophone {
            inner: mic.clone(),
            gate: Mutex::new(open_rx),
        }),
        output: speaker.clone(),
        connector: connector.clone(),
    };
    let (handle, mut events) =
        VoiceSessionHandle::spawn(SessionConfig::new("test-key", "Be an interviewer"), devices);
    let mut status = handle.subscribe();

    let (connected, ()) = tokio::join!(handle.connect(), async {
        tokio::time::timeout(WAIT, status.wait_for(|s| s.phase == CallPhase::Connecting))
            .await
            .expect("never started connecting")
            .expect("controller stopped");
        tokio::time::timeout(WAIT, handle.disconnect())
            .await
            .expect("disconnect waited for the microphone");
        // Still stuck in open
        assert_eq!(mic.opens(), 0);
    });

    assert_eq!(connected, Err(VoiceError::Cancelled));
    assert!(matches!(next_event(&mut events).await, VoiceEvent::Ended(_)));
    assert_eq!(handle.status().phase, CallPhase::Idle);

    // The device that opens late is released without a call to attach to
    open_tx.send(()).unwrap();
    eventually("late microphone released", || mic.opens() == 1 && !mic.held()).await;
    eventually("late speaker released", || {
        let log = speaker.log.lock().unwrap();
        log.opens == 1 && log.closes == 1
    })
    .await;
    assert_eq!(connector.calls(), 0);
}

#[tokio::test]
async fn test_meter_keeps_ticking_while_microphone_opens() {
    let mic = Arc::new(FakeMicrophone::default());
    let (open_tx, open_rx) = std_mpsc::channel();
    let connector = FakeConnector::new(Behaviour::Accept);
    let devices = VoiceDevices {
        microphone: Arc::new(GatedMicrophone {
            inner: mic.clone(),
            gate: Mutex::new(open_rx),
        }),
        output: Arc::new(FakeSpeaker::default()),
        connector: connector.clone(),
    };
    let (handle, _events) =
        VoiceSessionHandle::spawn(SessionConfig::new("test-key", "Be an interviewer"), devices);

    let (connected, ()) = tokio::join!(handle.connect(), async {
        // Other tasks on this runtime still run while open is blocked
        let mut ticks = 0;
        let mut ticker = tokio::time::interval(Duration::from_millis(5));
        while ticks < 5 {
            ticker.tick().await;
            ticks += 1;
        }
        assert_eq!(mic.opens(), 0);
        open_tx.send(()).unwrap();
    });

    assert_eq!(connected, Ok(()));
    assert!(mic.held());
    assert_eq!(connector.calls(), 1);
}

#[tokio::test]
async fn test_permission_denied_acquires_nothing() {
    let rig = Rig {
        mic: Arc::new(FakeMicrophone {
            deny: true,
            ..Default::default()
        }),
        speaker: Arc::new(FakeSpeaker::default()),
        connector: FakeConnector::new(Behaviour::Accept),
    };
    let (handle, _events) = rig.spawn();

    assert_eq!(handle.connect().await, Err(VoiceError::PermissionDenied));
    assert_eq!(rig.speaker.log.lock().unwrap().opens, 0);
    assert_eq!(rig.connector.calls(), 0);
    assert_eq!(handle.status().phase, CallPhase::Idle);
}

#[tokio::test]
async fn test_handshake_failure_is_connection_error() {
    let rig = Rig::new(Behaviour::Reject(LiveError::AuthenticationFailed(
        "API key not valid".into(),
    )));
    let (handle, mut events) = rig.spawn();

    let err = handle.connect().await.unwrap_err();
    assert!(matches!(err, VoiceError::Connection(ref m) if m.contains("API key not valid")));
    assert!(!rig.mic.held());

    // Reported through connect(), not as an extra error event
    let events = events_until_ended(&mut events).await;
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn test_second_connect_rejected_while_active() {
    let rig = Rig::new(Behaviour::Accept);
    let (handle, _events) = rig.spawn();
    handle.connect().await.unwrap();

    assert_eq!(handle.connect().await, Err(VoiceError::AlreadyActive));
    assert_eq!(rig.mic.opens(), 1);
}

#[tokio::test]
async fn test_microphone_frames_reach_transport() {
    let rig = Rig::new(Behaviour::Accept);
    let (handle, _events) = rig.spawn();
    handle.connect().await.unwrap();
    let mut remote = rig.connector.remote();
    let mut tap = rig.mic.take_tap();

    tap.process(&vec![0.25f32; 4096], 16_000);

    let sent = tokio::time::timeout(WAIT, remote.sent.recv())
        .await
        .expect("no frame sent")
        .expect("link closed");
    let json = serde_json::to_value(&sent).unwrap();
    let chunk = &json["realtimeInput"]["mediaChunks"][0];
    assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
    assert!(!chunk["data"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_chunks_play_back_to_back() {
    let rig = Rig::new(Behaviour::Accept);
    let (handle, _events) = rig.spawn();
    handle.connect().await.unwrap();
    let remote = rig.connector.remote();
    let mut status = handle.subscribe();

    remote.events.send(chunk(0.5)).await.unwrap();
    remote.events.send(chunk(0.25)).await.unwrap();
    eventually("two chunks scheduled", || rig.speaker.started().len() == 2).await;

    let started = rig.speaker.started();
    assert!((started[0].1 - 5.0).abs() < 1e-9);
    assert!((started[1].1 - 5.5).abs() < 1e-9);

    tokio::time::timeout(WAIT, status.wait_for(|s| s.ai_speaking))
        .await
        .unwrap()
        .unwrap();

    rig.speaker.finish(started[0].0);
    rig.speaker.finish(started[1].0);
    tokio::time::timeout(WAIT, status.wait_for(|s| !s.ai_speaking))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_interruption_flushes_playback() {
    let rig = Rig::new(Behaviour::Accept);
    let (handle, mut events) = rig.spawn();
    handle.connect().await.unwrap();
    let remote = rig.connector.remote();
    let mut status = handle.subscribe();

    remote.events.send(chunk(1.0)).await.unwrap();
    remote.events.send(chunk(1.0)).await.unwrap();
    eventually("two chunks scheduled", || rig.speaker.started().len() == 2).await;

    remote.events.send(ServerEvent::Interrupted).await.unwrap();
    eventually("playback flushed", || rig.speaker.stopped().len() == 2).await;
    tokio::time::timeout(WAIT, status.wait_for(|s| !s.ai_speaking))
        .await
        .unwrap()
        .unwrap();

    // The next reply starts now, not after the discarded audio
    remote.events.send(chunk(0.5)).await.unwrap();
    eventually("third chunk scheduled", || rig.speaker.started().len() == 3).await;
    assert!((rig.speaker.started()[2].1 - 5.0).abs() < 1e-9);

    handle.disconnect().await;
    let events = events_until_ended(&mut events).await;
    let Some(VoiceEvent::Ended(stats)) = events.last() else {
        panic!("missing end of call");
    };
    assert_eq!(stats.interruptions, 1);
    assert_eq!(stats.chunks_scheduled, 3);
}

#[tokio::test]
async fn test_undecodable_chunk_is_skipped() {
    let rig = Rig::new(Behaviour::Accept);
    let (handle, mut events) = rig.spawn();
    handle.connect().await.unwrap();
    let remote = rig.connector.remote();

    let mut bad = encode_media_blob(&[0.1; 10], 24_000);
    bad.data = "%%% not base64 %%%".into();
    remote.events.send(ServerEvent::AudioChunk(bad)).await.unwrap();
    remote.events.send(chunk(0.1)).await.unwrap();
    eventually("good chunk scheduled", || rig.speaker.started().len() == 1).await;
    assert!(handle.status().connected);

    handle.disconnect().await;
    let events = events_until_ended(&mut events).await;
    let Some(VoiceEvent::Ended(stats)) = events.last() else {
        panic!("missing end of call");
    };
    assert_eq!(stats.decode_errors, 1);
    assert_eq!(stats.chunks_received, 2);
}

#[tokio::test]
async fn test_transcripts_one_event_per_turn() {
    let rig = Rig::new(Behaviour::Accept);
    let (handle, mut events) = rig.spawn();
    handle.connect().await.unwrap();
    let remote = rig.connector.remote();

    for event in [
        ServerEvent::InputTranscript("Tell me".into()),
        ServerEvent::InputTranscript(" about it".into()),
        ServerEvent::OutputTranscript("Sure,".into()),
        ServerEvent::OutputTranscript(" happily.".into()),
        ServerEvent::TurnComplete,
    ] {
        remote.events.send(event).await.unwrap();
    }

    assert_eq!(
        next_event(&mut events).await,
        VoiceEvent::Transcript {
            role: Role::User,
            text: "Tell me about it".into()
        }
    );
    assert_eq!(
        next_event(&mut events).await,
        VoiceEvent::Transcript {
            role: Role::Assistant,
            text: "Sure, happily.".into()
        }
    );
}

#[tokio::test]
async fn test_remote_close_fires_once() {
    let rig = Rig::new(Behaviour::Accept);
    let (handle, mut events) = rig.spawn();
    handle.connect().await.unwrap();
    let remote = rig.connector.remote();

    remote
        .events
        .send(ServerEvent::Closed {
            code: Some(1000),
            reason: "session over".into(),
        })
        .await
        .unwrap();

    let seen = events_until_ended(&mut events).await;
    let closes = seen
        .iter()
        .filter(|e| matches!(e, VoiceEvent::Closed { .. }))
        .count();
    assert_eq!(closes, 1);
    assert!(seen.contains(&VoiceEvent::Closed {
        reason: "session over".into()
    }));
    assert!(!rig.mic.held());

    // A later disconnect is a no-op
    handle.disconnect().await;
    handle.disconnect().await;
    assert!(events.try_recv().is_err());
    assert_eq!(handle.status().phase, CallPhase::Idle);
}

#[tokio::test]
async fn test_remote_error_mid_call() {
    let rig = Rig::new(Behaviour::Accept);
    let (handle, mut events) = rig.spawn();
    handle.connect().await.unwrap();
    let remote = rig.connector.remote();

    remote
        .events
        .send(ServerEvent::Error("stream reset".into()))
        .await
        .unwrap();

    let seen = events_until_ended(&mut events).await;
    assert!(seen
        .iter()
        .any(|e| matches!(e, VoiceEvent::Error(VoiceError::Stream(m)) if m.contains("stream reset"))));
    assert!(!seen.iter().any(|e| matches!(e, VoiceEvent::Closed { .. })));
    assert!(!rig.mic.held());
}

#[tokio::test]
async fn test_new_call_after_previous_ended() {
    let rig = Rig::new(Behaviour::Accept);
    let (handle, mut events) = rig.spawn();

    handle.connect().await.unwrap();
    handle.disconnect().await;
    events_until_ended(&mut events).await;

    handle.connect().await.unwrap();
    assert_eq!(rig.mic.opens(), 2);
    assert_eq!(rig.connector.calls(), 2);
    assert!(handle.status().connected);
}

#[tokio::test]
async fn test_shutdown_releases_everything() {
    let rig = Rig::new(Behaviour::Accept);
    let (handle, mut events) = rig.spawn();
    handle.connect().await.unwrap();

    handle.shutdown().await;

    assert!(!rig.mic.held());
    assert_eq!(rig.speaker.log.lock().unwrap().closes, 1);
    assert!(matches!(next_event(&mut events).await, VoiceEvent::Ended(_)));
}
