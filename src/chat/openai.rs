//! OpenAI-compatible streaming chat completions
//!
//! Works with any endpoint that speaks the `/chat/completions` SSE dialect
//! (OpenAI, Groq, most self-hosted gateways).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::sse::drain_sse;
use super::{api_error, http_client, ChatError, Completion, CompletionBackend};
use crate::transcript::{Message, Role};

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: Role,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Text delta carried by one SSE payload, if any
fn chunk_text(payload: &str) -> Option<String> {
    match serde_json::from_str::<ChatChunk>(payload) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|t| !t.is_empty()),
        Err(e) => {
            log::warn!("OpenAI: skipping malformed stream chunk: {}", e);
            None
        }
    }
}

pub struct OpenAiBackend {
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiBackend {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    async fn complete(
        &self,
        messages: &[Message],
        on_text: &mut (dyn for<'s> FnMut(&'s str) + Send),
    ) -> Result<Completion, ChatError> {
        let request = ChatRequest {
            model: &self.model,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role,
                    content: &m.content,
                })
                .collect(),
            stream: true,
        };

        log::info!(
            "OpenAI: requesting completion from {} ({}, {} messages)",
            self.endpoint,
            self.model,
            messages.len()
        );

        let response = http_client()
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ChatError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        drain_sse(response.bytes_stream(), |payload| {
            if let Some(text) = chunk_text(payload) {
                on_text(&text);
            }
        })
        .await?;

        Ok(Completion::default())
    }
}
