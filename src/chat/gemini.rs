//! Gemini streaming text generation
//!
//! `models/<model>:streamGenerateContent?alt=sse`. The conversation maps to
//! `user`/`model` contents, the system message to `systemInstruction`, and
//! web search grounding is requested as the `googleSearch` tool.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::sse::drain_sse;
use super::{api_error, http_client, ChatError, Completion, CompletionBackend};
use crate::transcript::{Message, Role};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<TextPart<'a>>,
}

#[derive(Debug, Serialize)]
struct SystemInstruction<'a> {
    parts: Vec<TextPart<'a>>,
}

#[derive(Debug, Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    grounding_metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

fn build_request(messages: &[Message], grounding: bool) -> GenerateRequest<'_> {
    let system_instruction = messages
        .iter()
        .find(|m| m.role == Role::System)
        .map(|m| SystemInstruction {
            parts: vec![TextPart { text: &m.content }],
        });

    let contents = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| Content {
            role: if m.role == Role::Assistant { "model" } else { "user" },
            parts: vec![TextPart { text: &m.content }],
        })
        .collect();

    let tools = if grounding {
        vec![serde_json::json!({ "googleSearch": {} })]
    } else {
        Vec::new()
    };

    GenerateRequest {
        contents,
        system_instruction,
        tools,
    }
}

/// Text of the first candidate plus its grounding metadata, if present
fn parse_chunk(payload: &str) -> Option<(String, Option<Value>)> {
    let chunk = match serde_json::from_str::<GenerateChunk>(payload) {
        Ok(chunk) => chunk,
        Err(e) => {
            log::warn!("Gemini: skipping malformed stream chunk: {}", e);
            return None;
        }
    };
    let candidate = chunk.candidates.into_iter().next()?;
    let text = candidate
        .content
        .map(|c| {
            c.parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<String>()
        })
        .unwrap_or_default();
    Some((text, candidate.grounding_metadata))
}

pub struct GeminiBackend {
    endpoint: String,
    api_key: String,
    grounding: bool,
}

impl GeminiBackend {
    pub fn new(api_key: &str, model: &str, grounding: bool) -> Self {
        Self::with_base_url(GEMINI_API_BASE, api_key, model, grounding)
    }

    pub fn with_base_url(base_url: &str, api_key: &str, model: &str, grounding: bool) -> Self {
        let model = model.trim_start_matches("models/");
        Self {
            endpoint: format!(
                "{}/models/{}:streamGenerateContent?alt=sse",
                base_url.trim_end_matches('/'),
                model
            ),
            api_key: api_key.to_string(),
            grounding,
        }
    }
}

#[async_trait]
impl CompletionBackend for GeminiBackend {
    async fn complete(
        &self,
        messages: &[Message],
        on_text: &mut (dyn for<'s> FnMut(&'s str) + Send),
    ) -> Result<Completion, ChatError> {
        let request = build_request(messages, self.grounding);

        log::info!(
            "Gemini: requesting completion ({} turns, grounding {})",
            request.contents.len(),
            if self.grounding { "on" } else { "off" }
        );

        let response = http_client()
            .post(&self.endpoint)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ChatError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let mut grounding_metadata = None;
        drain_sse(response.bytes_stream(), |payload| {
            if let Some((text, metadata)) = parse_chunk(payload) {
                if !text.is_empty() {
                    on_text(&text);
                }
                // The latest metadata supersedes earlier ones
                if metadata.is_some() {
                    grounding_metadata = metadata;
                }
            }
        })
        .await?;

        Ok(Completion { grounding_metadata })
    }
}
