//! Gap-free playback scheduling for streamed reply audio
//!
//! Reply audio arrives as discrete chunks at irregular intervals. Each chunk
//! is scheduled to start exactly where the previous one ends, tracked by a
//! cursor on the output clock. An interruption stops everything that is
//! scheduled or playing and pulls the cursor back to the current clock.

use std::collections::HashSet;

use super::pcm::AudioBuffer;
use crate::Result;

/// Identifier for one scheduled chunk
pub type HandleId = u64;

/// An audio output that can start buffers at precise clock times
///
/// The clock is in seconds and only moves forward. Implementations report
/// natural completion of a handle out of band (see [`PlaybackScheduler::finished`]).
pub trait AudioOutput {
    /// Current playback clock in seconds
    fn now(&self) -> f64;

    /// Schedule `buffer` to start at clock time `at`
    ///
    /// # Errors
    ///
    /// Returns error if the output cannot accept the buffer
    fn start(&mut self, id: HandleId, buffer: AudioBuffer, at: f64) -> Result<()>;

    /// Stop a scheduled or playing handle
    ///
    /// # Errors
    ///
    /// Returns error if the handle is unknown or already finished
    fn stop(&mut self, id: HandleId) -> Result<()>;

    /// Release the output device
    fn close(&mut self);
}

impl<T: AudioOutput + ?Sized> AudioOutput for Box<T> {
    fn now(&self) -> f64 {
        (**self).now()
    }

    fn start(&mut self, id: HandleId, buffer: AudioBuffer, at: f64) -> Result<()> {
        (**self).start(id, buffer, at)
    }

    fn stop(&mut self, id: HandleId) -> Result<()> {
        (**self).stop(id)
    }

    fn close(&mut self) {
        (**self).close();
    }
}

/// Where and when a chunk was placed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    /// Handle for the chunk
    pub id: HandleId,
    /// Start time on the output clock
    pub start: f64,
    /// Chunk duration in seconds
    pub duration: f64,
}

impl ScheduledChunk {
    /// Clock time at which the chunk ends
    #[must_use]
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Schedules reply chunks back to back and supports interruption
pub struct PlaybackScheduler<O: AudioOutput> {
    output: O,
    next_start_time: f64,
    active: HashSet<HandleId>,
    next_id: HandleId,
    closed: bool,
}

impl<O: AudioOutput> PlaybackScheduler<O> {
    /// Create a scheduler over an output
    pub fn new(output: O) -> Self {
        Self {
            output,
            next_start_time: 0.0,
            active: HashSet::new(),
            next_id: 1,
            closed: false,
        }
    }

    /// Schedule a decoded chunk immediately after everything already queued
    ///
    /// The start time is `max(cursor, now)` so a stalled pipeline never
    /// schedules into the past. The cursor only advances if the output
    /// accepted the chunk.
    ///
    /// # Errors
    ///
    /// Returns error if the scheduler is closed or the output rejects the chunk
    pub fn schedule(&mut self, buffer: AudioBuffer) -> Result<ScheduledChunk> {
        if self.closed {
            return Err(crate::Error::Audio("playback is closed".to_string()));
        }

        let now = self.output.now();
        let start = self.next_start_time.max(now);
        let duration = buffer.duration();
        let id = self.next_id;
        self.next_id += 1;

        self.output.start(id, buffer, start)?;
        self.active.insert(id);
        self.next_start_time = start + duration;

        tracing::trace!(
            id,
            start,
            duration,
            active = self.active.len(),
            "scheduled reply chunk"
        );

        Ok(ScheduledChunk {
            id,
            start,
            duration,
        })
    }

    /// Record natural completion of a handle
    ///
    /// Returns whether the handle was still tracked. Completion of a handle
    /// that was already removed (for example by an interruption) is a no-op.
    pub fn finished(&mut self, id: HandleId) -> bool {
        let removed = self.active.remove(&id);
        if removed {
            tracing::trace!(id, remaining = self.active.len(), "reply chunk finished");
        }
        removed
    }

    /// Stop all scheduled and playing audio
    ///
    /// Every active handle is stopped (errors from handles that already
    /// ended are ignored), the set is cleared, and the cursor is reset to
    /// the current clock so the next chunk plays immediately. Returns the
    /// number of handles that were active.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.active.len();

        for id in self.active.drain() {
            if let Err(e) = self.output.stop(id) {
                tracing::trace!(id, error = %e, "stop ignored for finished chunk");
            }
        }
        self.next_start_time = self.output.now();

        tracing::debug!(stopped, cursor = self.next_start_time, "playback interrupted");
        stopped
    }

    /// Stop everything and release the output
    ///
    /// Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.interrupt();
        self.output.close();
        self.closed = true;
    }

    /// Clock time at which the next chunk will start (at the earliest)
    #[must_use]
    pub const fn cursor(&self) -> f64 {
        self.next_start_time
    }

    /// Number of scheduled or playing handles
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Whether a handle is scheduled or playing
    #[must_use]
    pub fn is_active(&self, id: HandleId) -> bool {
        self.active.contains(&id)
    }

    /// Whether [`close`](Self::close) has run
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Current output clock
    #[must_use]
    pub fn now(&self) -> f64 {
        self.output.now()
    }

    /// Borrow the underlying output
    #[must_use]
    pub const fn output(&self) -> &O {
        &self.output
    }

    /// Mutably borrow the underlying output
    pub const fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::Error;

    /// Output with a hand-driven clock
    #[derive(Default)]
    struct ManualOutput {
        clock: f64,
        playing: HashMap<HandleId, (f64, f64)>,
        stopped: Vec<HandleId>,
        reject_next: bool,
        closed: bool,
    }

    impl ManualOutput {
        /// Advance the clock, returning handles that ended naturally
        fn advance(&mut self, secs: f64) -> Vec<HandleId> {
            self.clock += secs;
            let clock = self.clock;
            let mut ended: Vec<HandleId> = self
                .playing
                .iter()
                .filter(|(_, (start, duration))| start + duration <= clock)
                .map(|(id, _)| *id)
                .collect();
            ended.sort_unstable();
            for id in &ended {
                self.playing.remove(id);
            }
            ended
        }
    }

    impl AudioOutput for ManualOutput {
        fn now(&self) -> f64 {
            self.clock
        }

        fn start(&mut self, id: HandleId, buffer: AudioBuffer, at: f64) -> Result<()> {
            if std::mem::take(&mut self.reject_next) {
                return Err(Error::Audio("device gone".to_string()));
            }
            self.playing.insert(id, (at, buffer.duration()));
            Ok(())
        }

        fn stop(&mut self, id: HandleId) -> Result<()> {
            self.stopped.push(id);
            self.playing
                .remove(&id)
                .map(|_| ())
                .ok_or_else(|| Error::Audio(format!("handle {id} not playing")))
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    fn seconds(secs: f64) -> AudioBuffer {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let len = (secs * 24_000.0) as usize;
        AudioBuffer::new(vec![0.1; len], 24_000)
    }

    #[test]
    fn test_chunks_play_back_to_back() {
        let mut scheduler = PlaybackScheduler::new(ManualOutput::default());

        let a = scheduler.schedule(seconds(0.5)).unwrap();
        let b = scheduler.schedule(seconds(0.25)).unwrap();
        let c = scheduler.schedule(seconds(1.0)).unwrap();

        assert!((a.start - 0.0).abs() < 1e-9);
        assert!((b.start - a.end()).abs() < 1e-9);
        assert!((c.start - b.end()).abs() < 1e-9);
        assert!((scheduler.cursor() - 1.75).abs() < 1e-9);
        assert_eq!(scheduler.active_count(), 3);
    }

    #[test]
    fn test_stall_never_schedules_in_the_past() {
        let mut scheduler = PlaybackScheduler::new(ManualOutput::default());

        scheduler.schedule(seconds(0.5)).unwrap();
        // Pipeline stalls well past the end of queued audio
        scheduler.output.advance(2.0);

        let late = scheduler.schedule(seconds(0.5)).unwrap();
        assert!((late.start - 2.0).abs() < 1e-9);
        assert!((scheduler.cursor() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_interrupt_clears_and_resets_cursor() {
        let mut scheduler = PlaybackScheduler::new(ManualOutput::default());

        scheduler.schedule(seconds(1.0)).unwrap();
        scheduler.schedule(seconds(1.0)).unwrap();
        scheduler.output.advance(0.3);

        assert_eq!(scheduler.interrupt(), 2);
        assert_eq!(scheduler.active_count(), 0);
        assert!((scheduler.cursor() - 0.3).abs() < 1e-9);
        assert_eq!(scheduler.output.stopped.len(), 2);

        let next = scheduler.schedule(seconds(0.5)).unwrap();
        assert!(scheduler.cursor() >= next.start);
        assert!((next.start - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_interrupt_ignores_already_finished_handles() {
        let mut scheduler = PlaybackScheduler::new(ManualOutput::default());

        let a = scheduler.schedule(seconds(0.1)).unwrap();
        scheduler.schedule(seconds(1.0)).unwrap();
        // `a` ends in the output but its completion has not been delivered yet
        let ended = scheduler.output.advance(0.2);
        assert_eq!(ended, vec![a.id]);

        assert_eq!(scheduler.interrupt(), 2);
        assert_eq!(scheduler.active_count(), 0);

        // Late completion after the interrupt is a no-op
        assert!(!scheduler.finished(a.id));
    }

    #[test]
    fn test_finished_is_idempotent() {
        let mut scheduler = PlaybackScheduler::new(ManualOutput::default());
        let chunk = scheduler.schedule(seconds(0.1)).unwrap();

        assert!(scheduler.finished(chunk.id));
        assert!(!scheduler.finished(chunk.id));
        assert!(!scheduler.finished(9999));
        assert_eq!(scheduler.active_count(), 0);
    }

    #[test]
    fn test_rejected_chunk_leaves_cursor() {
        let mut scheduler = PlaybackScheduler::new(ManualOutput::default());
        scheduler.schedule(seconds(0.5)).unwrap();

        scheduler.output.reject_next = true;
        assert!(scheduler.schedule(seconds(0.5)).is_err());
        assert!((scheduler.cursor() - 0.5).abs() < 1e-9);
        assert_eq!(scheduler.active_count(), 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut scheduler = PlaybackScheduler::new(ManualOutput::default());
        scheduler.schedule(seconds(0.5)).unwrap();

        scheduler.close();
        scheduler.close();

        assert!(scheduler.is_closed());
        assert!(scheduler.output().closed);
        assert_eq!(scheduler.active_count(), 0);
        assert!(scheduler.schedule(seconds(0.5)).is_err());
    }
}
