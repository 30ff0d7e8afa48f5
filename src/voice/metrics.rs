//! Per-call counters for diagnostics
//!
//! Reported once at the end of every call, both in the final
//! [`VoiceEvent::Ended`](super::VoiceEvent::Ended) and in a log line.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Counters for one voice call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStats {
    /// Microphone frames handed to the transport
    pub frames_sent: u64,
    /// Frames the transport refused (not open, queue full)
    pub frames_unsent: u64,
    /// Frames dropped at the capture tap because the controller lagged
    pub frames_dropped: u64,
    /// Audio chunks received from the model
    pub chunks_received: u64,
    /// Chunks decoded and scheduled for playback
    pub chunks_scheduled: u64,
    /// Chunks skipped as undecodable
    pub decode_errors: u64,
    /// Server-initiated interruptions
    pub interruptions: u64,
    /// Transcript turns emitted
    pub turns: u64,
    /// Time from connect to teardown
    pub duration_ms: u64,
}

impl CallStats {
    pub fn summary(&self) -> String {
        format!(
            "{} frames sent ({} unsent, {} dropped), {} chunks received ({} played, {} undecodable), {} interruptions, {} turns in {:.1}s",
            self.frames_sent,
            self.frames_unsent,
            self.frames_dropped,
            self.chunks_received,
            self.chunks_scheduled,
            self.decode_errors,
            self.interruptions,
            self.turns,
            self.duration_ms as f64 / 1000.0
        )
    }
}

/// Measures call duration
#[derive(Debug, Clone, Copy)]
pub(crate) struct CallTimer {
    started: Instant,
}

impl CallTimer {
    pub(crate) fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_mentions_counters() {
        let stats = CallStats {
            frames_sent: 12,
            chunks_received: 7,
            decode_errors: 1,
            interruptions: 2,
            turns: 4,
            duration_ms: 2500,
            ..Default::default()
        };
        let summary = stats.summary();
        assert!(summary.contains("12 frames sent"));
        assert!(summary.contains("1 undecodable"));
        assert!(summary.contains("2 interruptions"));
        assert!(summary.contains("2.5s"));
    }

    #[test]
    fn test_timer_advances() {
        let timer = CallTimer::start();
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.elapsed() >= Duration::from_millis(5));
    }
}
