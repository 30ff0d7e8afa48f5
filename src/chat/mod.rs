//! Text chat engine
//!
//! A [`ChatSession`] owns the conversation and drives one streamed
//! completion per user turn through a [`CompletionBackend`]:
//!
//! - [`OpenAiBackend`]: any OpenAI-compatible `/chat/completions` endpoint
//!   (OpenAI, Groq, custom)
//! - [`GeminiBackend`]: Gemini `streamGenerateContent`, optionally grounded
//!   with web search
//!
//! Replies are accumulated as they stream; the caller sees snapshots of the
//! growing text and the final message is appended once the stream ends.

mod gemini;
mod openai;
pub mod sse;

pub use gemini::GeminiBackend;
pub use openai::OpenAiBackend;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::instruction;
use crate::settings::{ApiConfig, InterviewSettings, Provider};
use crate::transcript::{Message, Transcript, TranscriptAggregator};

static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

/// Shared client; streamed replies have no overall deadline
fn http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Chat: falling back to default HTTP client: {}", e);
                Client::new()
            })
    })
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    #[error("API key not configured. Run `steadycoach config set --api-key` or set the provider's environment variable.")]
    MissingApiKey,
    #[error("Network error: {0}")]
    Network(String),
    #[error("{message}")]
    Api { status: u16, message: String },
    #[error("Stream error: {0}")]
    Stream(String),
    #[error("External context unavailable. Responding using local context only. (Please disable retrieval or try again)")]
    GroundingUnavailable,
}

/// `{"error": {"message": ...}}`, shared by both providers
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Turn a non-2xx response into [`ChatError::Api`]
async fn api_error(response: reqwest::Response) -> ChatError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorResponse>(&body)
        .map(|r| r.error.message)
        .unwrap_or_else(|_| format!("API Error: {}", status));
    ChatError::Api {
        status: status.as_u16(),
        message,
    }
}

/// Result of a completed stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    /// Sources the model consulted, when grounding was used
    pub grounding_metadata: Option<serde_json::Value>,
}

/// A streaming chat completion provider
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Stream a reply to `messages`, whose last entry is the new user turn.
    ///
    /// Text deltas are passed to `on_text` as they arrive.
    async fn complete(
        &self,
        messages: &[Message],
        on_text: &mut (dyn for<'s> FnMut(&'s str) + Send),
    ) -> Result<Completion, ChatError>;
}

/// Backend for the configured provider
pub fn backend_for(config: &ApiConfig) -> Result<Arc<dyn CompletionBackend>, ChatError> {
    if config.api_key.trim().is_empty() {
        return Err(ChatError::MissingApiKey);
    }

    let backend: Arc<dyn CompletionBackend> = match config.provider {
        Provider::Gemini => Arc::new(GeminiBackend::new(
            &config.api_key,
            &config.model,
            config.enable_contextual_grounding,
        )),
        Provider::OpenAi | Provider::Groq | Provider::Custom => Arc::new(OpenAiBackend::new(
            &config.base_url,
            &config.api_key,
            &config.model,
        )),
    };
    Ok(backend)
}

/// One text conversation
pub struct ChatSession {
    backend: Arc<dyn CompletionBackend>,
    transcript: Transcript,
    grounding_enabled: bool,
}

impl ChatSession {
    pub fn new(backend: Arc<dyn CompletionBackend>, grounding_enabled: bool) -> Self {
        Self::resume(backend, grounding_enabled, Transcript::new())
    }

    /// Continue an existing conversation
    pub fn resume(
        backend: Arc<dyn CompletionBackend>,
        grounding_enabled: bool,
        transcript: Transcript,
    ) -> Self {
        Self {
            backend,
            transcript,
            grounding_enabled,
        }
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn messages(&self) -> &[Message] {
        self.transcript.messages()
    }

    /// Seed a fresh conversation with the system instruction and send the
    /// opening prompt. Does nothing if the conversation already started.
    pub async fn start(
        &mut self,
        settings: &InterviewSettings,
        on_snapshot: &mut (dyn FnMut(&str) + Send),
    ) -> Result<Option<&Message>, ChatError> {
        if !self.transcript.is_empty() {
            return Ok(None);
        }
        self.transcript
            .push(Message::system(instruction::text_instruction(settings)));
        self.send(&instruction::opening_prompt(settings), on_snapshot)
            .await
    }

    /// Send a user turn and stream the reply.
    ///
    /// Blank input is ignored. On failure a partial reply is kept, an empty
    /// one is dropped, and the error is returned. No retries.
    pub async fn send(
        &mut self,
        content: &str,
        on_snapshot: &mut (dyn FnMut(&str) + Send),
    ) -> Result<Option<&Message>, ChatError> {
        if content.trim().is_empty() {
            return Ok(None);
        }

        self.transcript.push(Message::user(content));

        let mut reply = TranscriptAggregator::new();
        let result = {
            let mut on_text = |delta: &str| {
                let text = reply.push_delta(delta);
                on_snapshot(text);
            };
            self.backend
                .complete(self.transcript.messages(), &mut on_text)
                .await
        };

        match result {
            Ok(completion) => match reply.take() {
                Some(text) => {
                    log::debug!("Chat: reply complete ({} chars)", text.len());
                    Ok(Some(self.transcript.push(
                        Message::assistant(text).with_grounding(completion.grounding_metadata),
                    )))
                }
                None => {
                    log::warn!("Chat: provider returned an empty reply");
                    Ok(None)
                }
            },
            Err(err) => {
                log::warn!("Chat: completion failed: {}", err);
                if let Some(partial) = reply.take() {
                    self.transcript.push(Message::assistant(partial));
                }
                Err(self.classify(err))
            }
        }
    }

    /// Drop the whole conversation
    pub fn reset(&mut self) {
        self.transcript = Transcript::new();
    }

    fn classify(&self, err: ChatError) -> ChatError {
        if self.grounding_enabled && err.to_string().to_lowercase().contains("grounding") {
            ChatError::GroundingUnavailable
        } else {
            err
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::Role;
    use std::sync::Mutex;

    /// Replays scripted deltas, then the scripted outcome
    struct ScriptedBackend {
        deltas: Vec<&'static str>,
        outcome: Result<Completion, ChatError>,
        seen: Mutex<Vec<usize>>,
    }

    impl ScriptedBackend {
        fn new(deltas: Vec<&'static str>, outcome: Result<Completion, ChatError>) -> Arc<Self> {
            Arc::new(Self {
                deltas,
                outcome,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete(
            &self,
            messages: &[Message],
            on_text: &mut (dyn for<'s> FnMut(&'s str) + Send),
        ) -> Result<Completion, ChatError> {
            self.seen.lock().unwrap().push(messages.len());
            for delta in &self.deltas {
                on_text(delta);
            }
            self.outcome.clone()
        }
    }

    fn settings() -> InterviewSettings {
        InterviewSettings {
            role: "Designer".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_send_streams_snapshots() {
        let backend = ScriptedBackend::new(vec!["Hel", "lo"], Ok(Completion::default()));
        let mut session = ChatSession::new(backend, false);

        let mut snapshots = Vec::new();
        let reply = session
            .send("Hi", &mut |s| snapshots.push(s.to_string()))
            .await
            .unwrap()
            .cloned();

        assert_eq!(snapshots, vec!["Hel", "Hello"]);
        assert_eq!(reply.unwrap().content, "Hello");
        let roles: Vec<_> = session.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
    }

    #[tokio::test]
    async fn test_stored_reply_matches_last_snapshot() {
        let backend = ScriptedBackend::new(
            vec!["\n1. Situation", "\n2. Action\n\n"],
            Ok(Completion::default()),
        );
        let mut session = ChatSession::new(backend, false);

        let mut last = String::new();
        let reply = session
            .send("How should I structure it?", &mut |s| last = s.to_string())
            .await
            .unwrap()
            .cloned()
            .unwrap();

        assert_eq!(reply.content, last);
        assert_eq!(reply.content, "\n1. Situation\n2. Action\n\n");
    }

    #[tokio::test]
    async fn test_blank_input_ignored() {
        let backend = ScriptedBackend::new(vec!["x"], Ok(Completion::default()));
        let mut session = ChatSession::new(backend.clone(), false);
        assert!(session.send("   ", &mut |_| {}).await.unwrap().is_none());
        assert!(session.messages().is_empty());
        assert!(backend.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_keeps_partial_reply() {
        let backend = ScriptedBackend::new(
            vec!["Half an"],
            Err(ChatError::Stream("connection reset".into())),
        );
        let mut session = ChatSession::new(backend, false);
        let err = session.send("Question", &mut |_| {}).await.unwrap_err();

        assert!(matches!(err, ChatError::Stream(_)));
        assert_eq!(session.messages().len(), 2);
        assert_eq!(session.messages()[1].content, "Half an");
    }

    #[tokio::test]
    async fn test_failure_drops_empty_reply() {
        let backend = ScriptedBackend::new(
            vec![],
            Err(ChatError::Api {
                status: 401,
                message: "Invalid key".into(),
            }),
        );
        let mut session = ChatSession::new(backend, false);
        let err = session.send("Question", &mut |_| {}).await.unwrap_err();

        assert_eq!(err.to_string(), "Invalid key");
        assert_eq!(session.messages().len(), 1);
        assert_eq!(session.messages()[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_grounding_failure_classified() {
        let failing = || {
            ScriptedBackend::new(
                vec![],
                Err(ChatError::Api {
                    status: 400,
                    message: "Search Grounding is not supported".into(),
                }),
            )
        };

        let mut grounded = ChatSession::new(failing(), true);
        assert_eq!(
            grounded.send("q", &mut |_| {}).await.unwrap_err(),
            ChatError::GroundingUnavailable
        );

        let mut plain = ChatSession::new(failing(), false);
        assert!(matches!(
            plain.send("q", &mut |_| {}).await.unwrap_err(),
            ChatError::Api { status: 400, .. }
        ));
    }

    #[tokio::test]
    async fn test_start_seeds_system_and_opening() {
        let backend = ScriptedBackend::new(vec!["Welcome."], Ok(Completion::default()));
        let mut session = ChatSession::new(backend.clone(), false);
        session.start(&settings(), &mut |_| {}).await.unwrap();

        let messages = session.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[1].content.contains("Designer position"));
        assert_eq!(messages[2].content, "Welcome.");
        // The backend saw the system prompt and the opening prompt
        assert_eq!(*backend.seen.lock().unwrap(), vec![2]);

        // Second start is a no-op
        assert!(session.start(&settings(), &mut |_| {}).await.unwrap().is_none());
        assert_eq!(session.messages().len(), 3);
    }

    #[tokio::test]
    async fn test_reply_keeps_grounding() {
        let metadata = serde_json::json!({"groundingChunks": []});
        let backend = ScriptedBackend::new(
            vec!["Sourced"],
            Ok(Completion {
                grounding_metadata: Some(metadata.clone()),
            }),
        );
        let mut session = ChatSession::new(backend, true);
        let reply = session.send("q", &mut |_| {}).await.unwrap().cloned().unwrap();
        assert_eq!(reply.grounding_metadata, Some(metadata));
    }

    #[tokio::test]
    async fn test_reset_clears() {
        let backend = ScriptedBackend::new(vec!["ok"], Ok(Completion::default()));
        let mut session = ChatSession::new(backend, false);
        session.send("hi", &mut |_| {}).await.unwrap();
        session.reset();
        assert!(session.messages().is_empty());
    }

    #[test]
    fn test_backend_requires_key() {
        let config = ApiConfig::default();
        assert!(matches!(backend_for(&config), Err(ChatError::MissingApiKey)));

        let mut config = ApiConfig::for_provider(Provider::Groq);
        config.api_key = "gsk-test".into();
        assert!(backend_for(&config).is_ok());
    }
}
