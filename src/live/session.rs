//! Transport session state machine
//!
//! ```text
//!   Idle ──Connect──▶ Connecting ──HandshakeSucceeded──▶ Open
//!                        │  │                             │  │
//!                        │  └─HandshakeFailed─▶ Errored ◀─┘  │ RemoteError
//!                        │                                    │
//!                        └──Disconnect──▶ Closing ◀───────────┘ Disconnect / RemoteClosed
//!                                            │
//!                                         Released
//!                                            ▼
//!                                          Closed
//! ```
//!
//! All transition logic lives in the pure [`reduce`] function. The session
//! routes every entry point (user disconnect, handshake completion, inbound
//! events) through it and only then performs the returned effects, so races
//! between those sources resolve to no-ops instead of double work.
//!
//! `Errored` is absorbing: a later disconnect still releases the link but
//! does not fire on-close.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::client::{LiveConnector, LiveLink};
use super::protocol::{ClientMessage, ServerEvent};
use super::{LiveError, SessionConfig};

/// Bounded wait for a graceful close before resources are dropped
const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(2);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a transport session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Errored,
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connect,
    HandshakeSucceeded,
    HandshakeFailed(LiveError),
    RemoteClosed,
    RemoteError(LiveError),
    Disconnect,
    /// The link (or pending handshake) has been let go
    Released,
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEffect {
    StartHandshake,
    AbortHandshake,
    /// Adopt the link produced by the handshake
    InstallLink,
    /// Drop a link that arrived too late to be used
    DiscardLink,
    ReleaseLink,
    NotifyOpen,
    NotifyClose,
    NotifyError(LiveError),
}

/// Pure transition function: `(state, event) -> (state, effects)`.
///
/// Events that make no sense in a state leave it unchanged with no effects.
pub fn reduce(state: TransportState, event: &TransportEvent) -> (TransportState, Vec<TransportEffect>) {
    use TransportEffect as Fx;
    use TransportEvent as Ev;
    use TransportState as St;

    match (state, event) {
        (St::Idle, Ev::Connect) => (St::Connecting, vec![Fx::StartHandshake]),
        (St::Idle, Ev::Disconnect) => (St::Closing, vec![]),

        (St::Connecting, Ev::HandshakeSucceeded) => {
            (St::Open, vec![Fx::InstallLink, Fx::NotifyOpen])
        }
        (St::Connecting, Ev::HandshakeFailed(err)) => {
            (St::Errored, vec![Fx::NotifyError(err.clone())])
        }
        (St::Connecting, Ev::Disconnect) => (St::Closing, vec![Fx::AbortHandshake]),

        (St::Open, Ev::RemoteClosed) | (St::Open, Ev::Disconnect) => {
            (St::Closing, vec![Fx::ReleaseLink])
        }
        (St::Open, Ev::RemoteError(err)) => (
            St::Errored,
            vec![Fx::ReleaseLink, Fx::NotifyError(err.clone())],
        ),

        (St::Closing, Ev::Released) => (St::Closed, vec![Fx::NotifyClose]),

        (St::Errored, Ev::Disconnect) => (St::Errored, vec![Fx::ReleaseLink]),

        // A handshake that finishes after the session moved on
        (_, Ev::HandshakeSucceeded) => (state, vec![Fx::DiscardLink]),

        _ => (state, vec![]),
    }
}

/// Why the session closed, as passed to the on-close callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: Option<u16>,
    pub reason: String,
    /// True when the close came from a local `disconnect()`
    pub initiated_locally: bool,
}

/// Completion of a handshake started by [`TransportSession::connect`],
/// tagged with the session id
pub type HandshakeResult = (u64, Result<LiveLink, LiveError>);

type OpenCallback = Box<dyn FnOnce() + Send>;
type CloseCallback = Box<dyn FnOnce(CloseInfo) + Send>;
type ErrorCallback = Box<dyn FnOnce(LiveError) + Send>;

/// One persistent duplex session for the lifetime of a call.
///
/// Single use: `connect` is only valid from `Idle`.
pub struct TransportSession {
    id: u64,
    state: TransportState,
    config: SessionConfig,
    link: Option<LiveLink>,
    handshake: Option<JoinHandle<()>>,
    close_info: Option<CloseInfo>,
    close_grace: Duration,
    on_open: Option<OpenCallback>,
    on_close: Option<CloseCallback>,
    on_error: Option<ErrorCallback>,
}

impl TransportSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            state: TransportState::Idle,
            config,
            link: None,
            handshake: None,
            close_info: None,
            close_grace: DEFAULT_CLOSE_GRACE,
            on_open: None,
            on_close: None,
            on_error: None,
        }
    }

    /// Called once when the session opens
    pub fn on_open(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_open = Some(Box::new(f));
        self
    }

    /// Called at most once when the session reaches `Closed`
    pub fn on_close(mut self, f: impl FnOnce(CloseInfo) + Send + 'static) -> Self {
        self.on_close = Some(Box::new(f));
        self
    }

    /// Called at most once when the session fails
    pub fn on_error(mut self, f: impl FnOnce(LiveError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == TransportState::Open
    }

    /// Start the handshake in the background.
    ///
    /// The outcome is delivered on `completions` and must be passed back via
    /// [`complete_handshake`](Self::complete_handshake).
    pub fn connect(
        &mut self,
        connector: Arc<dyn LiveConnector>,
        completions: mpsc::UnboundedSender<HandshakeResult>,
    ) -> Result<(), LiveError> {
        let (next, effects) = reduce(self.state, &TransportEvent::Connect);
        if !effects.contains(&TransportEffect::StartHandshake) {
            return Err(LiveError::InvalidState(format!(
                "connect is only valid from Idle (state: {:?})",
                self.state
            )));
        }
        self.set_state(next);

        let id = self.id;
        let config = self.config.clone();
        self.handshake = Some(tokio::spawn(async move {
            let result = connector.connect(&config).await;
            if completions.send((id, result)).is_err() {
                log::debug!("Transport: handshake result dropped, session gone");
            }
        }));

        Ok(())
    }

    /// Feed back a handshake outcome.
    ///
    /// Returns the inbound event receiver when the session opened.
    pub async fn complete_handshake(
        &mut self,
        id: u64,
        result: Result<LiveLink, LiveError>,
    ) -> Option<mpsc::Receiver<ServerEvent>> {
        if id != self.id {
            log::debug!("Transport: ignoring handshake for stale session {}", id);
            return None;
        }
        self.handshake = None;

        match result {
            Ok(mut link) => {
                let inbound = link.take_inbound();
                let opened = self
                    .dispatch(TransportEvent::HandshakeSucceeded, Some(link))
                    .await;
                if opened {
                    inbound
                } else {
                    None
                }
            }
            Err(err) => {
                log::warn!("Transport: handshake failed: {}", err);
                self.dispatch(TransportEvent::HandshakeFailed(err), None)
                    .await;
                None
            }
        }
    }

    /// Queue an outbound message. A silent no-op unless the session is open.
    ///
    /// Returns whether the message was queued.
    pub fn send(&self, msg: ClientMessage) -> bool {
        if self.state != TransportState::Open {
            return false;
        }
        match &self.link {
            Some(link) => match link.try_send(msg) {
                Ok(()) => true,
                Err(e) => {
                    log::debug!("Transport: send skipped: {}", e);
                    false
                }
            },
            None => false,
        }
    }

    /// Route one inbound event (or end of stream) through the state machine.
    ///
    /// Returns the event when it should be handled by the caller; close and
    /// error events are consumed here.
    pub async fn handle_inbound(&mut self, event: Option<ServerEvent>) -> Option<ServerEvent> {
        match event {
            None => {
                self.remote_closed(None, "connection ended".to_string())
                    .await;
                None
            }
            Some(ServerEvent::Closed { code, reason }) => {
                self.remote_closed(code, reason).await;
                None
            }
            Some(ServerEvent::Error(message)) => {
                self.dispatch(
                    TransportEvent::RemoteError(LiveError::ProtocolError(message)),
                    None,
                )
                .await;
                None
            }
            Some(other) if self.state == TransportState::Open => Some(other),
            Some(_) => None,
        }
    }

    /// Close the session from any state. Idempotent.
    ///
    /// Waits a bounded time for the link to shut down gracefully, then
    /// releases it regardless.
    pub async fn disconnect(&mut self) {
        if self.close_info.is_none() {
            self.close_info = Some(CloseInfo {
                code: None,
                reason: "client disconnected".to_string(),
                initiated_locally: true,
            });
        }
        self.dispatch(TransportEvent::Disconnect, None).await;
        self.dispatch(TransportEvent::Released, None).await;
    }

    async fn remote_closed(&mut self, code: Option<u16>, reason: String) {
        if self.close_info.is_none() {
            self.close_info = Some(CloseInfo {
                code,
                reason,
                initiated_locally: false,
            });
        }
        self.dispatch(TransportEvent::RemoteClosed, None).await;
        self.dispatch(TransportEvent::Released, None).await;
    }

    fn set_state(&mut self, next: TransportState) {
        if next != self.state {
            log::debug!("Transport: {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    /// Run one event through `reduce` and perform its effects.
    /// Returns true if the link passed in was installed.
    async fn dispatch(&mut self, event: TransportEvent, mut link: Option<LiveLink>) -> bool {
        let (next, effects) = reduce(self.state, &event);
        self.set_state(next);

        let mut installed = false;
        for effect in effects {
            match effect {
                // Spawned by connect(), which owns the connector
                TransportEffect::StartHandshake => {}
                TransportEffect::AbortHandshake => {
                    if let Some(task) = self.handshake.take() {
                        task.abort();
                        log::info!("Transport: pending handshake aborted");
                    }
                }
                TransportEffect::InstallLink => {
                    self.link = link.take();
                    installed = self.link.is_some();
                }
                TransportEffect::DiscardLink => {
                    if link.take().is_some() {
                        log::info!("Transport: discarded late link");
                    }
                }
                TransportEffect::ReleaseLink => {
                    if let Some(active) = self.link.take() {
                        active.close(self.close_grace).await;
                    }
                }
                TransportEffect::NotifyOpen => {
                    log::info!("Transport: session {} open", self.id);
                    if let Some(callback) = self.on_open.take() {
                        callback();
                    }
                }
                TransportEffect::NotifyClose => {
                    let info = self.close_info.clone().unwrap_or(CloseInfo {
                        code: None,
                        reason: "closed".to_string(),
                        initiated_locally: true,
                    });
                    log::info!("Transport: session {} closed ({})", self.id, info.reason);
                    if let Some(callback) = self.on_close.take() {
                        callback(info);
                    }
                }
                TransportEffect::NotifyError(err) => {
                    log::warn!("Transport: session {} failed: {}", self.id, err);
                    if let Some(callback) = self.on_error.take() {
                        callback(err);
                    }
                }
            }
        }
        installed
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        if let Some(task) = self.handshake.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio_util::sync::CancellationToken;

    fn config() -> SessionConfig {
        SessionConfig::new("key", "instruction")
    }

    fn fake_link() -> (LiveLink, mpsc::Receiver<ClientMessage>, mpsc::Sender<ServerEvent>) {
        let (out_tx, out_rx) = mpsc::channel(8);
        let (in_tx, in_rx) = mpsc::channel(8);
        let link = LiveLink::new(out_tx, in_rx, CancellationToken::new(), Vec::new());
        (link, out_rx, in_tx)
    }

    struct InstantConnector;

    #[async_trait]
    impl LiveConnector for InstantConnector {
        async fn connect(&self, _config: &SessionConfig) -> Result<LiveLink, LiveError> {
            Ok(fake_link().0)
        }
    }

    struct PendingConnector;

    #[async_trait]
    impl LiveConnector for PendingConnector {
        async fn connect(&self, _config: &SessionConfig) -> Result<LiveLink, LiveError> {
            std::future::pending().await
        }
    }

    #[derive(Default, Clone)]
    struct Counters {
        open: Arc<AtomicUsize>,
        close: Arc<AtomicUsize>,
        error: Arc<AtomicUsize>,
    }

    fn session_with(counters: &Counters) -> TransportSession {
        let (open, close, error) = (
            counters.open.clone(),
            counters.close.clone(),
            counters.error.clone(),
        );
        TransportSession::new(config())
            .on_open(move || {
                open.fetch_add(1, Ordering::SeqCst);
            })
            .on_close(move |_| {
                close.fetch_add(1, Ordering::SeqCst);
            })
            .on_error(move |_| {
                error.fetch_add(1, Ordering::SeqCst);
            })
            .with_close_grace(Duration::from_millis(50))
    }

    async fn open_session(counters: &Counters) -> (TransportSession, mpsc::Receiver<ClientMessage>) {
        let mut session = session_with(counters);
        let (completions_tx, _completions_rx) = mpsc::unbounded_channel();
        session
            .connect(Arc::new(PendingConnector), completions_tx)
            .unwrap();
        let (link, out_rx, _in_tx) = fake_link();
        let id = session.id();
        session.complete_handshake(id, Ok(link)).await;
        (session, out_rx)
    }

    #[test]
    fn test_reduce_happy_path() {
        let (s, fx) = reduce(TransportState::Idle, &TransportEvent::Connect);
        assert_eq!(s, TransportState::Connecting);
        assert_eq!(fx, vec![TransportEffect::StartHandshake]);

        let (s, fx) = reduce(s, &TransportEvent::HandshakeSucceeded);
        assert_eq!(s, TransportState::Open);
        assert_eq!(
            fx,
            vec![TransportEffect::InstallLink, TransportEffect::NotifyOpen]
        );

        let (s, fx) = reduce(s, &TransportEvent::Disconnect);
        assert_eq!(s, TransportState::Closing);
        assert_eq!(fx, vec![TransportEffect::ReleaseLink]);

        let (s, fx) = reduce(s, &TransportEvent::Released);
        assert_eq!(s, TransportState::Closed);
        assert_eq!(fx, vec![TransportEffect::NotifyClose]);
    }

    #[test]
    fn test_reduce_connect_only_from_idle() {
        for state in [
            TransportState::Connecting,
            TransportState::Open,
            TransportState::Closing,
            TransportState::Closed,
            TransportState::Errored,
        ] {
            let (next, fx) = reduce(state, &TransportEvent::Connect);
            assert_eq!(next, state);
            assert!(fx.is_empty());
        }
    }

    #[test]
    fn test_reduce_errored_is_absorbing() {
        let err = LiveError::ProtocolError("boom".into());
        let (s, fx) = reduce(TransportState::Open, &TransportEvent::RemoteError(err.clone()));
        assert_eq!(s, TransportState::Errored);
        assert_eq!(
            fx,
            vec![TransportEffect::ReleaseLink, TransportEffect::NotifyError(err)]
        );

        let (s, fx) = reduce(s, &TransportEvent::Disconnect);
        assert_eq!(s, TransportState::Errored);
        assert_eq!(fx, vec![TransportEffect::ReleaseLink]);

        let (s, fx) = reduce(s, &TransportEvent::Released);
        assert_eq!(s, TransportState::Errored);
        assert!(fx.is_empty());
    }

    #[test]
    fn test_reduce_late_handshake_discarded() {
        for state in [TransportState::Closing, TransportState::Closed, TransportState::Errored] {
            let (next, fx) = reduce(state, &TransportEvent::HandshakeSucceeded);
            assert_eq!(next, state);
            assert_eq!(fx, vec![TransportEffect::DiscardLink]);
        }
    }

    #[test]
    fn test_reduce_close_races_fire_once() {
        // Remote close then local disconnect
        let (s, _) = reduce(TransportState::Open, &TransportEvent::RemoteClosed);
        let (s, fx1) = reduce(s, &TransportEvent::Released);
        let (s, fx2) = reduce(s, &TransportEvent::Disconnect);
        let (_, fx3) = reduce(s, &TransportEvent::Released);

        let closes = [fx1, fx2, fx3]
            .iter()
            .flatten()
            .filter(|fx| **fx == TransportEffect::NotifyClose)
            .count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn test_connect_twice_is_invalid() {
        let mut session = TransportSession::new(config());
        let (tx, _rx) = mpsc::unbounded_channel();
        session.connect(Arc::new(PendingConnector), tx.clone()).unwrap();
        let err = session.connect(Arc::new(PendingConnector), tx).unwrap_err();
        assert!(matches!(err, LiveError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_handshake_completion_opens_session() {
        let counters = Counters::default();
        let mut session = session_with(&counters);
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.connect(Arc::new(InstantConnector), tx).unwrap();

        let (id, result) = rx.recv().await.unwrap();
        let inbound = session.complete_handshake(id, result).await;

        assert!(inbound.is_some());
        assert_eq!(session.state(), TransportState::Open);
        assert_eq!(counters.open.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_only_when_open() {
        let counters = Counters::default();
        let blob = crate::audio::codec::encode_media_blob(&[0.0], 16000);

        let idle = session_with(&counters);
        assert!(!idle.send(ClientMessage::audio(blob.clone())));

        let (mut session, mut out_rx) = open_session(&counters).await;
        assert!(session.send(ClientMessage::audio(blob.clone())));
        assert!(out_rx.recv().await.is_some());

        session.disconnect().await;
        assert!(!session.send(ClientMessage::audio(blob)));
    }

    #[tokio::test]
    async fn test_disconnect_twice_closes_once() {
        let counters = Counters::default();
        let (mut session, _out_rx) = open_session(&counters).await;

        session.disconnect().await;
        session.disconnect().await;

        assert_eq!(session.state(), TransportState::Closed);
        assert_eq!(counters.close.load(Ordering::SeqCst), 1);
        assert_eq!(counters.error.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remote_close_then_disconnect_closes_once() {
        let counters = Counters::default();
        let (mut session, _out_rx) = open_session(&counters).await;

        let passed = session
            .handle_inbound(Some(ServerEvent::Closed {
                code: Some(1000),
                reason: "bye".into(),
            }))
            .await;
        assert!(passed.is_none());
        assert_eq!(session.state(), TransportState::Closed);

        session.disconnect().await;
        assert_eq!(counters.close.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remote_close_reports_reason() {
        let reason = Arc::new(std::sync::Mutex::new(None));
        let seen = reason.clone();
        let mut session = TransportSession::new(config()).on_close(move |info| {
            *seen.lock().unwrap() = Some(info);
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        session.connect(Arc::new(PendingConnector), tx).unwrap();
        let id = session.id();
        session.complete_handshake(id, Ok(fake_link().0)).await;

        session.handle_inbound(None).await;
        let info = reason.lock().unwrap().clone().unwrap();
        assert!(!info.initiated_locally);
        assert_eq!(info.reason, "connection ended");
    }

    #[tokio::test]
    async fn test_disconnect_during_connect_aborts_handshake() {
        let counters = Counters::default();
        let mut session = session_with(&counters);
        let (tx, _rx) = mpsc::unbounded_channel();
        session.connect(Arc::new(PendingConnector), tx).unwrap();

        session.disconnect().await;
        assert_eq!(session.state(), TransportState::Closed);
        assert_eq!(counters.open.load(Ordering::SeqCst), 0);
        assert_eq!(counters.close.load(Ordering::SeqCst), 1);

        // A result that raced the abort is discarded, not installed
        let id = session.id();
        assert!(session.complete_handshake(id, Ok(fake_link().0)).await.is_none());
        assert_eq!(counters.open.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handshake_failure_errors_once() {
        let counters = Counters::default();
        let mut session = session_with(&counters);
        let (tx, _rx) = mpsc::unbounded_channel();
        session.connect(Arc::new(PendingConnector), tx).unwrap();

        let id = session.id();
        let inbound = session
            .complete_handshake(id, Err(LiveError::AuthenticationFailed("bad key".into())))
            .await;
        assert!(inbound.is_none());
        assert_eq!(session.state(), TransportState::Errored);

        session.disconnect().await;
        assert_eq!(session.state(), TransportState::Errored);
        assert_eq!(counters.error.load(Ordering::SeqCst), 1);
        assert_eq!(counters.close.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_handshake_ignored() {
        let counters = Counters::default();
        let mut session = session_with(&counters);
        let (tx, _rx) = mpsc::unbounded_channel();
        session.connect(Arc::new(PendingConnector), tx).unwrap();

        let stale = session.id() + 1000;
        assert!(session.complete_handshake(stale, Ok(fake_link().0)).await.is_none());
        assert_eq!(session.state(), TransportState::Connecting);
    }

    #[tokio::test]
    async fn test_inbound_error_is_fatal() {
        let counters = Counters::default();
        let (mut session, _out_rx) = open_session(&counters).await;

        let passed = session
            .handle_inbound(Some(ServerEvent::Error("reset".into())))
            .await;
        assert!(passed.is_none());
        assert_eq!(session.state(), TransportState::Errored);
        assert_eq!(counters.error.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_inbound_passthrough_only_when_open() {
        let counters = Counters::default();
        let (mut session, _out_rx) = open_session(&counters).await;

        let passed = session.handle_inbound(Some(ServerEvent::TurnComplete)).await;
        assert_eq!(passed, Some(ServerEvent::TurnComplete));

        session.disconnect().await;
        let passed = session.handle_inbound(Some(ServerEvent::TurnComplete)).await;
        assert!(passed.is_none());
    }
}
