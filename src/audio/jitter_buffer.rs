//! Adaptive jitter buffer and playback scheduler.
//!
//! Chunks are held back until `target_latency` worth of audio has arrived,
//! then the whole queue is scheduled back to back on the output clock. Once
//! playing, every new chunk is scheduled as soon as it arrives. When the last
//! scheduled chunk has finished and nothing new arrived for a grace period
//! the buffer returns to `Ready` and the next chunk re-arms the delay.
//!
//! The buffer performs no I/O and owns no timers. Completions and grace
//! expirations are fed back in by the caller (see [`crate::audio::player`]),
//! each tagged with the generation it was issued under so that callbacks
//! from before a [`JitterBuffer::reset`] are discarded.

use super::pcm::AudioChunk;
use crate::error::Result;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Slack for float accumulation when comparing buffered audio to the target.
const DURATION_EPSILON: f64 = 1e-9;

/// Real-time output that plays chunks at positions on its own clock.
pub trait PlaybackSink {
    /// Current position of the output clock, in seconds.
    fn now(&self) -> f64;

    /// Start `chunk` at clock position `at`. Fire and forget: the sink
    /// reports `ticket` back once the chunk has finished playing.
    fn schedule(&mut self, chunk: AudioChunk, at: f64, ticket: PlaybackTicket);

    /// Drop pending completion reports. Audio already handed to the device
    /// may still be heard.
    fn reset(&mut self) {}

    /// Release the output device. Called before a replacement sink is
    /// opened. Chunks scheduled after closing must still be reported
    /// complete.
    fn close(&mut self) {}
}

impl<S: PlaybackSink + ?Sized> PlaybackSink for Box<S> {
    fn now(&self) -> f64 {
        (**self).now()
    }

    fn schedule(&mut self, chunk: AudioChunk, at: f64, ticket: PlaybackTicket) {
        (**self).schedule(chunk, at, ticket)
    }

    fn reset(&mut self) {
        (**self).reset()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferStatus {
    Ready,
    Buffering,
    Playing,
}

/// Observable buffer state, recomputed on every mutation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BufferState {
    pub status: BufferStatus,
    /// Buffered audio relative to the target latency, in `[0, 100]`.
    pub fill_percent: f64,
}

impl Default for BufferState {
    fn default() -> Self {
        Self {
            status: BufferStatus::Ready,
            fill_percent: 0.0,
        }
    }
}

/// Identifies one scheduled chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaybackTicket {
    pub generation: u64,
    pub seq: u64,
}

/// Issued when the buffer may have drained. Valid only if nothing was
/// enqueued (and no reset happened) before it comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainCheck {
    pub generation: u64,
    pub epoch: u64,
}

pub struct JitterBuffer<S> {
    sink: S,
    target_latency: f64,
    start_lead: f64,

    queue: VecDeque<AudioChunk>,
    /// Sum of durations of the queued chunks.
    buffered: f64,
    next_playback_time: f64,
    state: BufferState,

    generation: u64,
    /// Bumped by every enqueue and reset; invalidates outstanding drain checks.
    drain_epoch: u64,
    next_seq: u64,
    /// Scheduled chunks whose completion has not been reported yet.
    in_flight: usize,
}

impl<S: PlaybackSink> JitterBuffer<S> {
    pub fn new(sink: S, target_latency: Duration) -> Self {
        Self {
            sink,
            target_latency: target_latency.as_secs_f64(),
            start_lead: 0.0,
            queue: VecDeque::new(),
            buffered: 0.0,
            next_playback_time: 0.0,
            state: BufferState::default(),
            generation: 0,
            drain_epoch: 0,
            next_seq: 0,
            in_flight: 0,
        }
    }

    /// Headroom added in front of the first chunk when playback starts.
    pub fn with_start_lead(mut self, lead: Duration) -> Self {
        self.start_lead = lead.as_secs_f64();
        self
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn buffered_duration(&self) -> f64 {
        self.buffered
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn next_playback_time(&self) -> f64 {
        self.next_playback_time
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn enqueue(&mut self, chunk: AudioChunk) -> BufferState {
        self.buffered += chunk.duration_secs();
        self.queue.push_back(chunk);
        self.drain_epoch += 1;
        self.refresh_fill();

        match self.state.status {
            BufferStatus::Ready | BufferStatus::Buffering
                if self.buffered + DURATION_EPSILON >= self.target_latency =>
            {
                log::debug!(
                    "Buffer primed with {:.3}s (target {:.3}s), starting playback",
                    self.buffered,
                    self.target_latency
                );
                self.state.status = BufferStatus::Playing;
                self.state.fill_percent = 100.0;
                let lead = self.sink.now() + self.start_lead;
                self.next_playback_time = self.next_playback_time.max(lead);
                while !self.queue.is_empty() {
                    self.schedule_next();
                }
            }
            BufferStatus::Ready => {
                self.state.status = BufferStatus::Buffering;
            }
            BufferStatus::Buffering => {}
            BufferStatus::Playing => self.schedule_next(),
        }
        self.state
    }

    fn schedule_next(&mut self) {
        let Some(chunk) = self.queue.pop_front() else {
            return;
        };
        let duration = chunk.duration_secs();
        let play_time = self.next_playback_time.max(self.sink.now());
        let ticket = PlaybackTicket {
            generation: self.generation,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.in_flight += 1;

        self.sink.schedule(chunk, play_time, ticket);

        self.next_playback_time = play_time + duration;
        self.buffered -= duration;
        if self.queue.is_empty() {
            self.buffered = 0.0;
        }
        self.refresh_fill();
    }

    /// The sink finished playing `ticket`. Returns a drain check to be fed
    /// back through [`Self::on_grace_elapsed`] after the grace delay when
    /// nothing is left to play.
    pub fn on_playback_complete(&mut self, ticket: PlaybackTicket) -> Option<DrainCheck> {
        if ticket.generation != self.generation {
            log::debug!(
                "Ignoring completion from generation {} (current {})",
                ticket.generation,
                self.generation
            );
            return None;
        }
        self.in_flight = self.in_flight.saturating_sub(1);

        let drained = self.queue.is_empty() && self.buffered <= 0.0 && self.in_flight == 0;
        if drained && self.state.status != BufferStatus::Ready {
            Some(DrainCheck {
                generation: self.generation,
                epoch: self.drain_epoch,
            })
        } else {
            None
        }
    }

    /// Grace delay for `check` has elapsed. Returns true if the buffer went
    /// back to `Ready`.
    pub fn on_grace_elapsed(&mut self, check: DrainCheck) -> bool {
        if check.generation != self.generation || check.epoch != self.drain_epoch {
            return false;
        }
        if !self.queue.is_empty() || self.in_flight > 0 {
            return false;
        }
        log::debug!("Playback drained, buffer ready");
        self.state = BufferState::default();
        true
    }

    /// Discard everything queued and start a new generation. Completions and
    /// drain checks issued before the reset are ignored from now on.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.buffered = 0.0;
        self.next_playback_time = 0.0;
        self.state = BufferState::default();
        self.generation += 1;
        self.drain_epoch += 1;
        self.in_flight = 0;
        self.sink.reset();
    }

    /// Reset, close the current sink and install the one built by `make`.
    /// The old sink is closed before `make` runs so the device can be
    /// reopened. On error the closed sink stays in place.
    pub fn rebuild_sink(&mut self, make: impl FnOnce() -> Result<S>) -> Result<()> {
        self.reset();
        self.sink.close();
        self.sink = make()?;
        Ok(())
    }

    fn refresh_fill(&mut self) {
        let percent = 100.0 * self.buffered / self.target_latency;
        self.state.fill_percent = percent.clamp(0.0, 100.0);
    }
}
