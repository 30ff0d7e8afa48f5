//! Voice session controller
//!
//! One actor task owns every piece of call state and serialises all event
//! sources through a single `select!` loop:
//!
//! ```text
//!  host commands ──┐
//!  devices opened ─┤
//!  handshake done ─┤
//!  transport notices┤
//!  inbound events ─┼──▶ VoiceController ──▶ watch<VoiceStatus>
//!  capture frames ─┤          │           └─▶ VoiceEvent channel
//!  playback ended ─┤          ▼
//!  meter tick ─────┘     teardown()
//! ```
//!
//! Opening and closing audio devices can block (a permission prompt, a
//! driver starting up), so both run on the blocking pool. The actor keeps
//! serving commands while a microphone is being acquired, and devices that
//! arrive after the call was cancelled are released where they land.
//!
//! Every exit path (local disconnect, remote close, error, handle dropped)
//! runs the same `teardown`, which stops capture, flushes and closes
//! playback, and disconnects the transport.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};

use super::metrics::{CallStats, CallTimer};
use super::{CallPhase, VoiceDevices, VoiceError, VoiceEvent, VoiceStatus};
use crate::audio::codec::{decode_media_blob, encode_media_blob};
use crate::audio::{
    AudioOutput, CaptureFrame, CapturePipeline, OutputDevice, PlaybackScheduler, VoiceId,
    CAPTURE_FRAME_SAMPLES,
};
use crate::live::{
    ClientMessage, CloseInfo, HandshakeResult, LiveError, ServerEvent, SessionConfig,
    TransportSession,
};
use crate::transcript::{CompletedTurn, TurnTracker};

/// Volume refresh cadence (~30fps)
const METER_INTERVAL: Duration = Duration::from_millis(33);

/// Decoded model audio is mono
const OUTPUT_CHANNELS: u16 = 1;

enum Command {
    Connect(oneshot::Sender<Result<(), VoiceError>>),
    Disconnect(oneshot::Sender<()>),
}

/// Transport callback, tagged with the session it came from
enum Notice {
    Opened(u64),
    Closed(u64, CloseInfo),
    Errored(u64, LiveError),
}

/// Devices opened for one call on the blocking pool
struct Devices {
    capture: CapturePipeline,
    frames: mpsc::Receiver<CaptureFrame>,
    output: Box<dyn AudioOutput>,
    ended: mpsc::UnboundedReceiver<VoiceId>,
}

impl Devices {
    fn release(mut self) {
        self.capture.stop();
        self.output.close();
    }
}

/// Outcome of device acquisition, tagged with the call it was started for
type Acquisition = (u64, Result<Devices, VoiceError>);

/// Why a call is being torn down
enum Outcome {
    Local,
    Shutdown,
    RemoteClosed(CloseInfo),
    Failed(VoiceError),
}

enum Wake {
    Command(Option<Command>),
    Acquired(Acquisition),
    Handshake(HandshakeResult),
    Notice(Notice),
    Inbound(Option<ServerEvent>),
    Frame(Option<CaptureFrame>),
    Ended(Option<VoiceId>),
    Tick,
}

/// Cheap handle to a running voice controller.
///
/// Dropping the handle shuts the controller down and releases any active
/// call.
pub struct VoiceSessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<VoiceStatus>,
    task: JoinHandle<()>,
}

impl VoiceSessionHandle {
    /// Start a controller for calls using `config`
    pub fn spawn(
        config: SessionConfig,
        devices: VoiceDevices,
    ) -> (Self, mpsc::UnboundedReceiver<VoiceEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(VoiceStatus::default());

        let controller = VoiceController::new(config, devices, commands_rx, events_tx, status_tx);
        let task = tokio::spawn(controller.run());

        (
            Self {
                commands: commands_tx,
                status: status_rx,
                task,
            },
            events_rx,
        )
    }

    /// Acquire the microphone and speaker, then open the session.
    ///
    /// Resolves once the remote acknowledged the session, or with the error
    /// that stopped it. A concurrent `disconnect()` resolves it with
    /// [`VoiceError::Cancelled`], even while the microphone is still being
    /// opened.
    pub async fn connect(&self) -> Result<(), VoiceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Connect(reply_tx))
            .map_err(|_| VoiceError::Shutdown)?;
        reply_rx.await.map_err(|_| VoiceError::Shutdown)?
    }

    /// End the current call, if any. Safe to call at any time, repeatedly.
    ///
    /// Returns once every resource of the call has been released. Devices
    /// still opening at that point are closed as soon as they are ready.
    pub async fn disconnect(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect(reply_tx)).is_ok() {
            let _ = reply_rx.await;
        }
    }

    /// Latest status snapshot
    pub fn status(&self) -> VoiceStatus {
        *self.status.borrow()
    }

    /// Watch status changes
    pub fn subscribe(&self) -> watch::Receiver<VoiceStatus> {
        self.status.clone()
    }

    /// Stop the controller and wait for its teardown to finish
    pub async fn shutdown(self) {
        let Self { commands, task, .. } = self;
        drop(commands);
        if let Err(e) = task.await {
            log::warn!("Voice: controller task failed: {}", e);
        }
    }
}

/// State of one call, from connect to teardown
struct Call {
    id: u64,
    transport: TransportSession,
    /// Empty until acquisition completes
    capture: Option<CapturePipeline>,
    frames: Option<mpsc::Receiver<CaptureFrame>>,
    playback: Option<PlaybackScheduler>,
    ended: Option<mpsc::UnboundedReceiver<VoiceId>>,
    inbound: Option<mpsc::Receiver<ServerEvent>>,
    turns: TurnTracker,
    stats: CallStats,
    timer: CallTimer,
    pending_connect: Option<oneshot::Sender<Result<(), VoiceError>>>,
    phase: CallPhase,
}

struct VoiceController {
    config: SessionConfig,
    devices: VoiceDevices,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<VoiceEvent>,
    status: watch::Sender<VoiceStatus>,
    acquired_tx: mpsc::UnboundedSender<Acquisition>,
    acquired_rx: mpsc::UnboundedReceiver<Acquisition>,
    handshakes_tx: mpsc::UnboundedSender<HandshakeResult>,
    handshakes_rx: mpsc::UnboundedReceiver<HandshakeResult>,
    notices_tx: mpsc::UnboundedSender<Notice>,
    notices_rx: mpsc::UnboundedReceiver<Notice>,
    meter: Interval,
    next_call_id: u64,
    call: Option<Call>,
}

impl VoiceController {
    fn new(
        config: SessionConfig,
        devices: VoiceDevices,
        commands: mpsc::UnboundedReceiver<Command>,
        events: mpsc::UnboundedSender<VoiceEvent>,
        status: watch::Sender<VoiceStatus>,
    ) -> Self {
        let (acquired_tx, acquired_rx) = mpsc::unbounded_channel();
        let (handshakes_tx, handshakes_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let mut meter = interval(METER_INTERVAL);
        meter.set_missed_tick_behavior(MissedTickBehavior::Skip);

        Self {
            config,
            devices,
            commands,
            events,
            status,
            acquired_tx,
            acquired_rx,
            handshakes_tx,
            handshakes_rx,
            notices_tx,
            notices_rx,
            meter,
            next_call_id: 0,
            call: None,
        }
    }

    async fn run(mut self) {
        log::debug!("Voice: controller started");

        loop {
            match self.next_wake().await {
                Wake::Command(None) => {
                    self.teardown(Outcome::Shutdown).await;
                    break;
                }
                Wake::Command(Some(Command::Connect(reply))) => self.start_call(reply),
                Wake::Command(Some(Command::Disconnect(reply))) => {
                    self.teardown(Outcome::Local).await;
                    let _ = reply.send(());
                }
                Wake::Acquired((id, result)) => self.on_acquired(id, result).await,
                Wake::Handshake((id, result)) => self.on_handshake(id, result).await,
                Wake::Notice(notice) => self.on_notice(notice).await,
                Wake::Inbound(event) => self.on_inbound(event).await,
                Wake::Frame(frame) => self.on_frame(frame),
                Wake::Ended(id) => self.on_playback_ended(id),
                Wake::Tick => self.publish_status(),
            }
        }

        log::debug!("Voice: controller stopped");
    }

    async fn next_wake(&mut self) -> Wake {
        let (inbound, frames, ended) = match &mut self.call {
            Some(call) => (
                call.inbound.as_mut(),
                call.frames.as_mut(),
                call.ended.as_mut(),
            ),
            None => (None, None, None),
        };
        let call_active = inbound.is_some() || frames.is_some();

        tokio::select! {
            cmd = self.commands.recv() => Wake::Command(cmd),
            Some(acquired) = self.acquired_rx.recv() => Wake::Acquired(acquired),
            Some(result) = self.handshakes_rx.recv() => Wake::Handshake(result),
            Some(notice) = self.notices_rx.recv() => Wake::Notice(notice),
            event = recv_opt(inbound) => Wake::Inbound(event),
            frame = recv_opt(frames) => Wake::Frame(frame),
            id = recv_opt_unbounded(ended) => Wake::Ended(id),
            _ = self.meter.tick(), if call_active => Wake::Tick,
        }
    }

    fn start_call(&mut self, reply: oneshot::Sender<Result<(), VoiceError>>) {
        if self.call.is_some() {
            let _ = reply.send(Err(VoiceError::AlreadyActive));
            return;
        }

        log::info!("Voice: connecting ({:?})", self.config);

        self.next_call_id += 1;
        let call_id = self.next_call_id;
        let capture = CapturePipeline::new(self.devices.microphone.clone())
            .with_format(self.config.input_sample_rate, CAPTURE_FRAME_SAMPLES);
        let gate = capture.emit_gate();
        let output = self.devices.output.clone();
        let output_rate = self.config.output_sample_rate;
        let acquired = self.acquired_tx.clone();

        tokio::task::spawn_blocking(move || {
            let result = acquire_devices(capture, output.as_ref(), output_rate);
            // The controller is gone: nobody else will close these
            let sent = acquired.send((call_id, result));
            if let Err(mpsc::error::SendError((_, Ok(devices)))) = sent {
                devices.release();
            }
        });

        let transport = TransportSession::new(self.config.clone());
        let session_id = transport.id();
        let (opened, closed, errored) = (
            self.notices_tx.clone(),
            self.notices_tx.clone(),
            self.notices_tx.clone(),
        );
        let transport = transport
            .on_open(move || {
                // Capture starts feeding the send path once the session is open
                gate.store(true, Ordering::Release);
                let _ = opened.send(Notice::Opened(session_id));
            })
            .on_close(move |info| {
                let _ = closed.send(Notice::Closed(session_id, info));
            })
            .on_error(move |err| {
                let _ = errored.send(Notice::Errored(session_id, err));
            });

        self.call = Some(Call {
            id: call_id,
            transport,
            capture: None,
            frames: None,
            playback: None,
            ended: None,
            inbound: None,
            turns: TurnTracker::new(),
            stats: CallStats::default(),
            timer: CallTimer::start(),
            pending_connect: Some(reply),
            phase: CallPhase::Connecting,
        });
        self.publish_status();
    }

    /// Devices are ready: wire them into the call and start the handshake
    async fn on_acquired(&mut self, id: u64, result: Result<Devices, VoiceError>) {
        let current = self
            .call
            .as_ref()
            .filter(|call| call.capture.is_none())
            .map(|call| call.id);
        if current != Some(id) {
            if let Ok(devices) = result {
                log::debug!("Voice: releasing devices opened for a cancelled call");
                tokio::task::spawn_blocking(move || devices.release());
            }
            return;
        }

        let devices = match result {
            Ok(devices) => devices,
            Err(e) => {
                self.teardown(Outcome::Failed(e)).await;
                return;
            }
        };

        let connected = match self.call.as_mut() {
            Some(call) => {
                call.capture = Some(devices.capture);
                call.frames = Some(devices.frames);
                call.playback = Some(PlaybackScheduler::new(devices.output));
                call.ended = Some(devices.ended);
                call.transport
                    .connect(self.devices.connector.clone(), self.handshakes_tx.clone())
            }
            None => return,
        };

        match connected {
            Ok(()) => self.publish_status(),
            Err(e) => self.teardown(Outcome::Failed(e.into())).await,
        }
    }

    async fn on_handshake(&mut self, id: u64, result: Result<crate::live::LiveLink, LiveError>) {
        let Some(call) = self.call.as_mut() else {
            log::debug!("Voice: handshake finished after teardown, dropping");
            return;
        };
        if let Some(inbound) = call.transport.complete_handshake(id, result).await {
            call.inbound = Some(inbound);
        }
    }

    async fn on_notice(&mut self, notice: Notice) {
        let current = self.call.as_ref().map(|c| c.transport.id());

        match notice {
            Notice::Opened(id) if Some(id) == current => {
                if let Some(call) = self.call.as_mut() {
                    call.phase = CallPhase::Live;
                    if let Some(reply) = call.pending_connect.take() {
                        let _ = reply.send(Ok(()));
                    }
                    log::info!("Voice: call is live");
                }
                self.publish_status();
            }
            Notice::Closed(id, info) if Some(id) == current => {
                if !info.initiated_locally {
                    self.teardown(Outcome::RemoteClosed(info)).await;
                }
            }
            Notice::Errored(id, err) if Some(id) == current => {
                let is_live = self
                    .call
                    .as_ref()
                    .map(|c| c.phase == CallPhase::Live)
                    .unwrap_or(false);
                let voice_err = if is_live {
                    VoiceError::Stream(err.to_string())
                } else {
                    VoiceError::from(err)
                };
                self.teardown(Outcome::Failed(voice_err)).await;
            }
            _ => log::debug!("Voice: ignoring notice from a previous call"),
        }
    }

    async fn on_inbound(&mut self, event: Option<ServerEvent>) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        if event.is_none() {
            call.inbound = None;
        }

        let Some(event) = call.transport.handle_inbound(event).await else {
            return;
        };

        let mut completed: Vec<CompletedTurn> = Vec::new();
        match event {
            ServerEvent::SetupComplete => {}
            ServerEvent::InputTranscript(text) => call.turns.on_input_transcript(&text),
            ServerEvent::AudioChunk(blob) => {
                call.stats.chunks_received += 1;
                completed.extend(call.turns.on_model_audio());

                match decode_media_blob(&blob, self.config.output_sample_rate, OUTPUT_CHANNELS) {
                    Ok(buffer) => {
                        if let Some(playback) = call.playback.as_mut() {
                            playback.enqueue(buffer);
                            call.stats.chunks_scheduled += 1;
                        }
                    }
                    Err(e) => {
                        call.stats.decode_errors += 1;
                        log::warn!("Voice: skipping undecodable audio chunk: {}", e);
                    }
                }
            }
            ServerEvent::OutputTranscript(text) => {
                completed.extend(call.turns.on_output_transcript(&text));
            }
            ServerEvent::Interrupted => {
                if let Some(playback) = call.playback.as_mut() {
                    playback.flush();
                }
                call.stats.interruptions += 1;
                completed.extend(call.turns.on_interrupted());
            }
            ServerEvent::TurnComplete => completed.extend(call.turns.on_turn_complete()),
            ServerEvent::GoAway { time_left } => {
                log::warn!("Voice: server will close the session soon ({:?})", time_left);
            }
            // Consumed by the transport session
            ServerEvent::Error(_) | ServerEvent::Closed { .. } => {}
        }

        call.stats.turns += completed.len() as u64;
        for turn in completed {
            self.emit(VoiceEvent::Transcript {
                role: turn.role,
                text: turn.text,
            });
        }
        self.publish_status();
    }

    fn on_frame(&mut self, frame: Option<CaptureFrame>) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        let Some(frame) = frame else {
            call.frames = None;
            return;
        };

        let blob = encode_media_blob(&frame.samples, self.config.input_sample_rate);
        if call.transport.send(ClientMessage::audio(blob)) {
            call.stats.frames_sent += 1;
        } else {
            call.stats.frames_unsent += 1;
        }
    }

    fn on_playback_ended(&mut self, id: Option<VoiceId>) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        match id {
            Some(id) => {
                let finished = call
                    .playback
                    .as_mut()
                    .map(|playback| playback.on_ended(id))
                    .unwrap_or(false);
                if finished {
                    self.publish_status();
                }
            }
            None => call.ended = None,
        }
    }

    /// Release everything the call holds. Runs on every exit path.
    async fn teardown(&mut self, outcome: Outcome) {
        let Some(mut call) = self.call.take() else {
            return;
        };

        if let Some(capture) = call.capture.as_ref() {
            call.stats.frames_dropped = capture.frames_dropped();
        }
        release_devices(call.capture.take(), call.playback.take()).await;
        call.transport.disconnect().await;

        for turn in call.turns.flush() {
            call.stats.turns += 1;
            self.emit(VoiceEvent::Transcript {
                role: turn.role,
                text: turn.text,
            });
        }

        call.stats.duration_ms = call.timer.elapsed().as_millis() as u64;

        match outcome {
            Outcome::Local => log::info!("Voice: call ended locally"),
            Outcome::Shutdown => log::info!("Voice: call ended by shutdown"),
            Outcome::RemoteClosed(ref info) => {
                log::info!("Voice: call closed by remote ({})", info.reason)
            }
            Outcome::Failed(ref err) => log::warn!("Voice: call failed: {}", err),
        }
        log::info!("Voice: {}", call.stats.summary());

        match (call.pending_connect.take(), outcome) {
            (Some(reply), Outcome::Failed(err)) => {
                let _ = reply.send(Err(err));
            }
            (Some(reply), Outcome::Shutdown) => {
                let _ = reply.send(Err(VoiceError::Shutdown));
            }
            (Some(reply), Outcome::RemoteClosed(info)) => {
                let _ = reply.send(Err(VoiceError::Connection(info.reason)));
            }
            (Some(reply), Outcome::Local) => {
                let _ = reply.send(Err(VoiceError::Cancelled));
            }
            (None, Outcome::Failed(err)) => self.emit(VoiceEvent::Error(err)),
            (None, Outcome::RemoteClosed(info)) => {
                self.emit(VoiceEvent::Closed {
                    reason: info.reason,
                })
            }
            (None, _) => {}
        }

        self.emit(VoiceEvent::Ended(call.stats));
        self.publish_status();
    }

    fn emit(&self, event: VoiceEvent) {
        if self.events.send(event).is_err() {
            log::debug!("Voice: event receiver dropped");
        }
    }

    fn publish_status(&mut self) {
        let next = match &self.call {
            Some(call) => VoiceStatus {
                phase: call.phase,
                connected: call.phase == CallPhase::Live,
                ai_speaking: call
                    .playback
                    .as_ref()
                    .map(|playback| playback.is_speaking())
                    .unwrap_or(false),
                volume: call
                    .capture
                    .as_ref()
                    .map(|capture| capture.volume())
                    .unwrap_or(0.0),
            },
            None => VoiceStatus::default(),
        };

        self.status.send_if_modified(|status| {
            if *status != next {
                *status = next;
                true
            } else {
                false
            }
        });
    }
}

/// Open the microphone, then the speaker. Runs on the blocking pool.
///
/// Nothing else is acquired if the microphone is refused, and the microphone
/// is released again if the speaker cannot be opened.
fn acquire_devices(
    mut capture: CapturePipeline,
    output: &dyn OutputDevice,
    output_rate: u32,
) -> Result<Devices, VoiceError> {
    let frames = capture.start().map_err(|e| {
        log::warn!("Voice: microphone unavailable: {}", e);
        VoiceError::from(e)
    })?;

    let (ended_tx, ended_rx) = mpsc::unbounded_channel();
    let output = match output.open(output_rate, ended_tx) {
        Ok(output) => output,
        Err(e) => {
            log::warn!("Voice: speaker unavailable: {}", e);
            capture.stop();
            return Err(e.into());
        }
    };

    Ok(Devices {
        capture,
        frames,
        output,
        ended: ended_rx,
    })
}

/// Stop capture, then flush and close playback, off the async workers
async fn release_devices(capture: Option<CapturePipeline>, playback: Option<PlaybackScheduler>) {
    if capture.is_none() && playback.is_none() {
        return;
    }
    let released = tokio::task::spawn_blocking(move || {
        if let Some(mut capture) = capture {
            capture.stop();
        }
        if let Some(mut playback) = playback {
            playback.close();
        }
    })
    .await;
    if let Err(e) = released {
        log::warn!("Voice: releasing audio devices failed: {}", e);
    }
}

async fn recv_opt<T>(rx: Option<&mut mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_opt_unbounded<T>(rx: Option<&mut mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
