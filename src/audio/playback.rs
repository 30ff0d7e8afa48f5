//! Gapless playback scheduling for streamed model audio
//!
//! Decoded buffers arrive independently and are placed back to back on the
//! output clock. A cursor tracks where the next buffer starts:
//!
//! ```text
//! start_at = max(cursor, now)
//! cursor   = start_at + duration
//! ```
//!
//! Buffers that have started but not ended form the in-flight set; the model
//! is "speaking" exactly while that set is non-empty. An interruption flushes
//! everything and pulls the cursor back to the current clock time.

use std::collections::HashSet;
use std::sync::Arc;

use super::codec::PlaybackBuffer;
use super::output::{next_voice_id, AudioOutput, VoiceId};

/// Where a buffer landed on the output clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledPlayback {
    pub id: VoiceId,
    pub start_at: f64,
    pub duration: f64,
}

/// Sole writer to the output device during a call.
pub struct PlaybackScheduler {
    output: Box<dyn AudioOutput>,
    cursor: f64,
    in_flight: HashSet<VoiceId>,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn AudioOutput>) -> Self {
        let cursor = output.current_time();
        Self {
            output,
            cursor,
            in_flight: HashSet::new(),
        }
    }

    /// Schedule a decoded buffer directly after everything already queued.
    pub fn enqueue(&mut self, buffer: PlaybackBuffer) -> ScheduledPlayback {
        let now = self.output.current_time();
        let start_at = self.cursor.max(now);
        let duration = buffer.duration();
        let id = next_voice_id();

        let was_speaking = self.is_speaking();
        self.output.start(id, Arc::new(buffer), start_at);
        self.cursor = start_at + duration;
        self.in_flight.insert(id);

        if !was_speaking {
            log::debug!("Playback: speaking started at {:.3}s", start_at);
        }

        ScheduledPlayback {
            id,
            start_at,
            duration,
        }
    }

    /// End-of-playback hook. Returns true when this ends the speaking burst.
    ///
    /// Ids that are no longer in flight (already flushed) are ignored.
    pub fn on_ended(&mut self, id: VoiceId) -> bool {
        if !self.in_flight.remove(&id) {
            return false;
        }
        let finished = self.in_flight.is_empty();
        if finished {
            log::debug!("Playback: speaking finished");
        }
        finished
    }

    /// Stop every in-flight buffer now and reset the cursor to the clock.
    ///
    /// Safe at any time; a second call is a no-op.
    pub fn flush(&mut self) {
        let stopped = self.in_flight.len();
        for id in self.in_flight.drain() {
            self.output.stop(id);
        }
        self.cursor = self.output.current_time();

        if stopped > 0 {
            log::info!("Playback: flushed {} buffers", stopped);
        }
    }

    /// Flush and release the output device
    pub fn close(&mut self) {
        self.flush();
        self.output.close();
    }

    pub fn is_speaking(&self) -> bool {
        !self.in_flight.is_empty()
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn current_time(&self) -> f64 {
        self.output.current_time()
    }
}
