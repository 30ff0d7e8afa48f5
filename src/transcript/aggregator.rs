//! Incremental text accumulation for streamed turns
//!
//! Streamed replies and live transcriptions arrive as many small deltas.
//! An aggregator owns the in-progress text; observers only ever receive
//! snapshots of it.
//!
//! # Voice turn commits
//!
//! - The user's turn is committed when the model starts answering (first
//!   model audio or output transcription) or when the model's turn completes
//! - The assistant's turn is committed on `turnComplete`, or on interruption
//!   with whatever was spoken so far
//! - Empty turns are never committed

use super::Role;

/// Accumulates text deltas for one in-progress turn
#[derive(Debug, Clone, Default)]
pub struct TranscriptAggregator {
    text: String,
    delta_count: u64,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta and return the accumulated text
    pub fn push_delta(&mut self, delta: &str) -> &str {
        if !delta.is_empty() {
            self.text.push_str(delta);
            self.delta_count += 1;

            if self.delta_count % 10 == 0 {
                log::debug!(
                    "TranscriptAggregator: {} deltas, {} chars accumulated",
                    self.delta_count,
                    self.text.len()
                );
            }
        }
        &self.text
    }

    /// Take the accumulated text as streamed, leaving the aggregator empty.
    ///
    /// Returns `None` when nothing but whitespace was accumulated.
    pub fn take(&mut self) -> Option<String> {
        let text = std::mem::take(&mut self.text);
        self.delta_count = 0;
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

/// A finished turn ready to be appended to the transcript
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTurn {
    pub role: Role,
    pub text: String,
}

/// Tracks the user and assistant turns of a live voice call
#[derive(Debug, Clone, Default)]
pub struct TurnTracker {
    user: TranscriptAggregator,
    assistant: TranscriptAggregator,
}

impl TurnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recognised speech from the microphone
    pub fn on_input_transcript(&mut self, delta: &str) {
        self.user.push_delta(delta);
    }

    /// The model produced audio: the user's turn is over
    pub fn on_model_audio(&mut self) -> Option<CompletedTurn> {
        self.commit_user()
    }

    /// Transcription of the model's speech
    pub fn on_output_transcript(&mut self, delta: &str) -> Option<CompletedTurn> {
        let user = self.commit_user();
        self.assistant.push_delta(delta);
        user
    }

    /// The model finished its turn
    pub fn on_turn_complete(&mut self) -> Vec<CompletedTurn> {
        self.flush()
    }

    /// The user barged in; keep what the model already said
    pub fn on_interrupted(&mut self) -> Option<CompletedTurn> {
        self.commit_assistant()
    }

    /// Commit anything pending, user first
    pub fn flush(&mut self) -> Vec<CompletedTurn> {
        self.commit_user()
            .into_iter()
            .chain(self.commit_assistant())
            .collect()
    }

    fn commit_user(&mut self) -> Option<CompletedTurn> {
        self.user.take().map(|text| CompletedTurn {
            role: Role::User,
            text: text.trim().to_string(),
        })
    }

    fn commit_assistant(&mut self) -> Option<CompletedTurn> {
        self.assistant.take().map(|text| CompletedTurn {
            role: Role::Assistant,
            text: text.trim().to_string(),
        })
    }
}
