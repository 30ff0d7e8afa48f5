//! Gemini Live WebSocket client
//!
//! # Connection Flow
//!
//! 1. `connect()` - Open the WebSocket, send `setup`, wait for `setupComplete`
//! 2. Writer task drains the outbound queue into the socket
//! 3. Reader task parses frames into [`ServerEvent`]s, preserving order
//! 4. `close()` - Cancel both tasks, send a close frame, bounded wait
//!
//! No retries: a failed handshake is reported to the caller as is.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{self, client::IntoClientRequest, protocol::CloseFrame, Message},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;

use super::protocol::{parse_server_events, ClientMessage, ServerEvent, LIVE_API_URL};
use super::{LiveError, SessionConfig};

/// Connection timeout for the WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the `setupComplete` acknowledgment
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound frames queued ahead of the socket
const OUTBOUND_CAPACITY: usize = 64;

/// Inbound events queued ahead of the controller
const INBOUND_CAPACITY: usize = 256;

/// Close codes the service uses for rejected keys and bad setup
const CLOSE_INVALID_PAYLOAD: u16 = 1007;
const CLOSE_POLICY_VIOLATION: u16 = 1008;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens handshaken links to the remote model.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    /// Connect and complete the setup handshake.
    ///
    /// Cancel-safe: dropping the future releases any half-open socket.
    async fn connect(&self, config: &SessionConfig) -> Result<LiveLink, LiveError>;
}

/// An established duplex link.
///
/// Outbound messages go through a bounded queue drained by a writer task;
/// inbound events arrive in order on a channel fed by a reader task.
pub struct LiveLink {
    outbound: mpsc::Sender<ClientMessage>,
    inbound: Option<mpsc::Receiver<ServerEvent>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl LiveLink {
    /// Assemble a link from its channels and background tasks
    pub fn new(
        outbound: mpsc::Sender<ClientMessage>,
        inbound: mpsc::Receiver<ServerEvent>,
        cancel: CancellationToken,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound,
            inbound: Some(inbound),
            cancel,
            tasks,
        }
    }

    /// Take the inbound event receiver (once)
    pub fn take_inbound(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.inbound.take()
    }

    /// Queue a message without waiting
    pub fn try_send(&self, msg: ClientMessage) -> Result<(), LiveError> {
        self.outbound.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                LiveError::SendFailed("outbound queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                LiveError::Disconnected("writer stopped".to_string())
            }
        })
    }

    /// Close the link, waiting at most `grace` for a clean shutdown.
    ///
    /// Tasks still running after the grace period are aborted.
    pub async fn close(mut self, grace: Duration) {
        self.cancel.cancel();

        let tasks = std::mem::take(&mut self.tasks);
        for mut task in tasks {
            if timeout(grace, &mut task).await.is_err() {
                log::warn!("LiveLink: task did not stop within {:?}, aborting", grace);
                task.abort();
            }
        }
        log::debug!("LiveLink: closed");
    }
}

impl Drop for LiveLink {
    fn drop(&mut self) {
        self.cancel.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Connector for the Gemini Live service.
#[derive(Debug, Clone)]
pub struct GeminiLiveConnector {
    endpoint: String,
}

impl GeminiLiveConnector {
    pub fn new() -> Self {
        Self {
            endpoint: LIVE_API_URL.to_string(),
        }
    }

    /// Use a different endpoint (local test servers, proxies)
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

impl Default for GeminiLiveConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LiveConnector for GeminiLiveConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<LiveLink, LiveError> {
        if config.api_key.trim().is_empty() {
            return Err(LiveError::MissingApiKey);
        }

        // The URL carries the key: never log it
        let url = format!("{}?key={}", self.endpoint, config.api_key.trim());
        let request = url
            .into_client_request()
            .map_err(|e| LiveError::ConnectionFailed(e.to_string()))?;

        log::info!("Connecting to Gemini Live ({})...", config.model);

        let (ws_stream, _response) = timeout(
            CONNECTION_TIMEOUT,
            connect_async_with_config(request, None, false),
        )
        .await
        .map_err(|_| LiveError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(map_connect_error)?;

        let (mut write, mut read) = ws_stream.split();

        let setup = serde_json::to_string(&ClientMessage::setup(config))
            .map_err(|e| LiveError::ProtocolError(e.to_string()))?;
        write
            .send(Message::Text(setup))
            .await
            .map_err(|e| LiveError::SendFailed(e.to_string()))?;

        log::info!("WebSocket connected, waiting for setupComplete...");

        timeout(SETUP_TIMEOUT, wait_for_setup(&mut read))
            .await
            .map_err(|_| LiveError::ConnectionFailed("Setup acknowledgment timeout".to_string()))??;

        log::info!("Live session established");

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let cancel = CancellationToken::new();

        let writer = tokio::spawn(run_writer(write, outbound_rx, cancel.clone()));
        let reader = tokio::spawn(run_reader(read, inbound_tx, cancel.clone()));

        Ok(LiveLink::new(
            outbound_tx,
            inbound_rx,
            cancel,
            vec![writer, reader],
        ))
    }
}

fn map_connect_error(err: tungstenite::Error) -> LiveError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                LiveError::AuthenticationFailed(format!("HTTP {}", status))
            } else {
                LiveError::ConnectionFailed(format!("HTTP {}", status))
            }
        }
        other => LiveError::ConnectionFailed(other.to_string()),
    }
}

/// Map a close frame received before the session was acknowledged
fn handshake_close_error(frame: Option<CloseFrame<'static>>) -> LiveError {
    let (code, reason) = close_details(frame);
    match code {
        Some(CLOSE_INVALID_PAYLOAD) | Some(CLOSE_POLICY_VIOLATION) => {
            LiveError::AuthenticationFailed(reason)
        }
        _ => LiveError::ConnectionFailed(format!("Connection closed before setup: {}", reason)),
    }
}

fn close_details(frame: Option<CloseFrame<'static>>) -> (Option<u16>, String) {
    match frame {
        Some(frame) => {
            let reason = if frame.reason.is_empty() {
                "no reason given".to_string()
            } else {
                frame.reason.into_owned()
            };
            (Some(u16::from(frame.code)), reason)
        }
        None => (None, "no reason given".to_string()),
    }
}

async fn wait_for_setup(read: &mut SplitStream<WsStream>) -> Result<(), LiveError> {
    while let Some(msg_result) = read.next().await {
        let payload = match msg_result {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(bytes)) => bytes,
            Ok(Message::Close(frame)) => return Err(handshake_close_error(frame)),
            Ok(_) => continue,
            Err(e) => return Err(LiveError::ConnectionFailed(e.to_string())),
        };

        match parse_server_events(&payload) {
            Ok(events) if events.contains(&ServerEvent::SetupComplete) => return Ok(()),
            Ok(_) => log::debug!("Ignoring message while waiting for setupComplete"),
            Err(e) => log::warn!("Failed to parse message: {}", e),
        }
    }
    Err(LiveError::Disconnected("Stream ended before setup".to_string()))
}

async fn run_writer(
    mut write: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<ClientMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        log::warn!("Failed to serialize outbound message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    log::warn!("WebSocket send failed: {}", e);
                    break;
                }
            }
        }
    }

    if let Err(e) = write.close().await {
        log::debug!("Error closing WebSocket: {}", e);
    }
    log::debug!("Writer task exiting");
}

async fn run_reader(
    mut read: SplitStream<WsStream>,
    inbound: mpsc::Sender<ServerEvent>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = read.next() => next,
        };

        let (events, done) = match next {
            Some(Ok(Message::Text(text))) => (parse_or_skip(text.as_bytes()), false),
            Some(Ok(Message::Binary(bytes))) => (parse_or_skip(&bytes), false),
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = close_details(frame);
                log::info!("WebSocket closed by server ({:?}: {})", code, reason);
                (vec![ServerEvent::Closed { code, reason }], true)
            }
            Some(Ok(_)) => continue, // Ping/pong/raw frames
            Some(Err(e)) => {
                log::warn!("WebSocket error: {}", e);
                (vec![ServerEvent::Error(e.to_string())], true)
            }
            None => (
                vec![ServerEvent::Closed {
                    code: None,
                    reason: "connection ended".to_string(),
                }],
                true,
            ),
        };

        for event in events {
            if inbound.send(event).await.is_err() {
                log::debug!("Inbound channel closed");
                return;
            }
        }

        if done {
            break;
        }
    }
    log::debug!("Reader task exiting");
}

fn parse_or_skip(payload: &[u8]) -> Vec<ServerEvent> {
    parse_server_events(payload).unwrap_or_else(|e| {
        log::warn!("Failed to parse server message: {}", e);
        Vec::new()
    })
}
