//! Device-less output that paces chunks on the tokio clock.

use super::jitter_buffer::{PlaybackSink, PlaybackTicket};
use super::pcm::AudioChunk;
use super::player::CompletionSender;
use std::collections::VecDeque;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep_until};

/// Plays nothing, but reports each chunk complete at the moment a real
/// device would have finished it. Used when no ALSA device is available.
///
/// Must be created inside a tokio runtime.
pub struct ClockSink {
    origin: Instant,
    completions: CompletionSender,
    pending: Vec<JoinHandle<()>>,
}

impl ClockSink {
    pub fn new(completions: CompletionSender) -> Self {
        Self {
            origin: Instant::now(),
            completions,
            pending: Vec::new(),
        }
    }

    fn instant_at(&self, secs: f64) -> Instant {
        self.origin + Duration::from_secs_f64(secs.max(0.0))
    }
}

impl PlaybackSink for ClockSink {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn schedule(&mut self, chunk: AudioChunk, at: f64, ticket: PlaybackTicket) {
        let end = self.instant_at(at + chunk.duration_secs());
        let completions = self.completions.clone();
        self.pending.retain(|h| !h.is_finished());
        self.pending.push(tokio::spawn(async move {
            sleep_until(end).await;
            completions.complete(ticket);
        }));
    }

    fn reset(&mut self) {
        for handle in self.pending.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for ClockSink {
    fn drop(&mut self) {
        self.reset();
    }
}

/// Completions held back until the device has actually played the audio
/// written for them. Times are seconds on the sink clock.
#[cfg_attr(not(feature = "alsa"), allow(dead_code))]
#[derive(Debug, Default)]
pub(crate) struct DueCompletions {
    due: VecDeque<(f64, PlaybackTicket)>,
}

#[cfg_attr(not(feature = "alsa"), allow(dead_code))]
impl DueCompletions {
    /// `ticket` is done once the `queued_frames` still ahead of the speaker
    /// have played at `rate`. Never due before an earlier ticket.
    pub fn push(&mut self, now: f64, queued_frames: u64, rate: u32, ticket: PlaybackTicket) {
        let mut at = now + queued_frames as f64 / rate.max(1) as f64;
        if let Some(&(last, _)) = self.due.back() {
            at = at.max(last);
        }
        self.due.push_back((at, ticket));
    }

    /// Remove and return every ticket due at `now`.
    pub fn take_due(&mut self, now: f64) -> Vec<PlaybackTicket> {
        let mut done = Vec::new();
        while let Some(&(at, ticket)) = self.due.front() {
            if at > now {
                break;
            }
            self.due.pop_front();
            done.push(ticket);
        }
        done
    }

    /// Time until the next ticket is due, if any is pending.
    pub fn next_wait(&self, now: f64) -> Option<Duration> {
        self.due
            .front()
            .map(|&(at, _)| Duration::from_secs_f64((at - now).max(0.0)))
    }

    pub fn clear(&mut self) {
        self.due.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.due.is_empty()
    }
}
