//! ALSA playback behind the [`PlaybackSink`] seam.
//!
//! The device is owned by an "audio-play" thread. Scheduled chunks are sent
//! to it tagged with the sink epoch; a reset bumps the epoch so the thread
//! discards everything queued before it and flushes the device.
//!
//! A chunk is reported complete only once the device has played it, i.e.
//! after the frames still queued in the device (`snd_pcm_delay`) and in the
//! resampler have run out.

use super::alsa_device::{self, device_error};
use super::jitter_buffer::{PlaybackSink, PlaybackTicket};
use super::pcm::{AudioChunk, sample_to_pcm16};
use super::player::CompletionSender;
use super::resample::StreamResampler;
use super::sink::DueCompletions;
use crate::error::{Error, Result};
use alsa::pcm::PCM;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

const MAX_WRITE_RETRIES: u32 = 3;

struct Scheduled {
    epoch: u64,
    chunk: AudioChunk,
    at: f64,
    ticket: PlaybackTicket,
}

pub struct AlsaSink {
    origin: Instant,
    epoch: Arc<AtomicU64>,
    completions: CompletionSender,
    tx: Option<std_mpsc::Sender<Scheduled>>,
    handle: Option<JoinHandle<()>>,
}

impl AlsaSink {
    /// Open `device` on the playback thread; fails if the device cannot be
    /// opened.
    pub fn open(device: &str, sample_rate: u32, completions: CompletionSender) -> Result<Self> {
        let origin = Instant::now();
        let epoch = Arc::new(AtomicU64::new(0));
        let (tx, rx) = std_mpsc::channel::<Scheduled>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();

        let handle = {
            let device = device.to_string();
            let epoch = epoch.clone();
            let completions = completions.clone();
            thread::Builder::new()
                .name("audio-play".into())
                .spawn(move || {
                    let output = match Output::open(&device, sample_rate, origin) {
                        Ok(output) => {
                            let _ = ready_tx.send(Ok(()));
                            output
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    output.run(rx, &epoch, &completions);
                })
                .map_err(|e| Error::Device(format!("failed to spawn playback thread: {}", e)))?
        };

        let opened = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(Error::Device("playback thread exited".into())));
        if let Err(e) = opened {
            let _ = handle.join();
            return Err(e);
        }

        Ok(Self {
            origin,
            epoch,
            completions,
            tx: Some(tx),
            handle: Some(handle),
        })
    }
}

impl PlaybackSink for AlsaSink {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn schedule(&mut self, chunk: AudioChunk, at: f64, ticket: PlaybackTicket) {
        let msg = Scheduled {
            epoch: self.epoch.load(Ordering::SeqCst),
            chunk,
            at,
            ticket,
        };
        let sent = match &self.tx {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        };
        if !sent {
            // Nothing will play it; don't leave the buffer waiting.
            log::error!("Playback thread is gone, chunk dropped");
            self.completions.complete(ticket);
        }
    }

    fn reset(&mut self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&mut self) {
        self.reset();
        // Closing the channel ends the playback thread, which releases the
        // device.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            log::info!("Playback device closed");
        }
    }
}

impl Drop for AlsaSink {
    fn drop(&mut self) {
        self.close();
    }
}

struct Output {
    pcm: PCM,
    rate: u32,
    channels: usize,
    period: usize,
    origin: Instant,
    /// Stream time (seconds since origin) at which written audio runs out.
    cursor: f64,
    epoch: u64,
    /// Converts the current stream rate to the device rate. Replaced when
    /// the stream rate changes.
    resampler: Option<StreamResampler>,
    due: DueCompletions,
}

impl Output {
    fn open(device: &str, sample_rate: u32, origin: Instant) -> Result<Self> {
        let (pcm, params) = alsa_device::open_playback(device, sample_rate, 1, None)?;
        Ok(Self {
            pcm,
            rate: params.sample_rate,
            channels: params.channels.max(1) as usize,
            period: params.period_size.max(64),
            origin,
            cursor: 0.0,
            epoch: 0,
            resampler: None,
            due: DueCompletions::default(),
        })
    }

    fn clock(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn run(
        mut self,
        rx: std_mpsc::Receiver<Scheduled>,
        epoch: &AtomicU64,
        completions: &CompletionSender,
    ) {
        log::info!("Playback started: rate={}, ch={}", self.rate, self.channels);

        let mut next = None;
        loop {
            let msg = match next.take() {
                Some(msg) => msg,
                None => match self.wait(&rx, epoch, completions) {
                    Some(msg) => msg,
                    None => break,
                },
            };

            let current = epoch.load(Ordering::SeqCst);
            if msg.epoch != current {
                continue;
            }
            if self.epoch != current {
                self.flush();
                self.epoch = current;
            }

            self.play(msg, epoch);
            self.report(epoch, completions);

            match rx.try_recv() {
                Ok(msg) => next = Some(msg),
                // Nothing follows yet: play out what the resampler holds.
                Err(TryRecvError::Empty) => self.finish_segment(epoch),
                Err(TryRecvError::Disconnected) => {}
            }
        }

        log::info!("Playback stopped");
    }

    /// Block for the next message, reporting completions as they fall due.
    fn wait(
        &mut self,
        rx: &std_mpsc::Receiver<Scheduled>,
        epoch: &AtomicU64,
        completions: &CompletionSender,
    ) -> Option<Scheduled> {
        loop {
            let Some(timeout) = self.due.next_wait(self.clock()) else {
                return rx.recv().ok();
            };
            match rx.recv_timeout(timeout) {
                Ok(msg) => return Some(msg),
                Err(RecvTimeoutError::Timeout) => self.report(epoch, completions),
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn report(&mut self, epoch: &AtomicU64, completions: &CompletionSender) {
        if epoch.load(Ordering::SeqCst) != self.epoch {
            self.due.clear();
            return;
        }
        let now = self.clock();
        for ticket in self.due.take_due(now) {
            completions.complete(ticket);
        }
    }

    fn play(&mut self, msg: Scheduled, epoch: &AtomicU64) {
        self.cursor = self.cursor.max(self.clock());
        if msg.at > self.cursor {
            // The stream paused; its tail goes before the silence.
            self.finish_segment(epoch);
            let gap = (msg.at - self.cursor).max(0.0);
            let silence = vec![0.0; (gap * self.rate as f64) as usize];
            if !self.write_samples(&silence, epoch) {
                return;
            }
        }

        let samples = match self.resample(&msg.chunk, epoch) {
            Ok(samples) => samples,
            Err(e) => {
                log::error!("Dropping chunk: {}", e);
                let now = self.clock();
                self.due.push(now, 0, self.rate, msg.ticket);
                return;
            }
        };
        if !self.write_samples(&samples, epoch) {
            return;
        }

        let owed = self
            .resampler
            .as_ref()
            .map_or(0, |r| r.buffered_frames() as u64);
        let queued = self.device_delay() + owed;
        let now = self.clock();
        self.due.push(now, queued, self.rate, msg.ticket);
    }

    fn resample(&mut self, chunk: &AudioChunk, epoch: &AtomicU64) -> Result<Vec<f32>> {
        let rate = chunk.sample_rate();
        if self
            .resampler
            .as_ref()
            .is_some_and(|r| r.input_rate() != rate)
        {
            self.finish_segment(epoch);
            self.resampler = None;
        }
        if self.resampler.is_none() {
            log::debug!("Resampling {} Hz -> {} Hz", rate, self.rate);
            self.resampler = Some(StreamResampler::new(rate, self.rate)?);
        }
        match self.resampler.as_mut() {
            Some(resampler) => resampler.process(chunk.samples()),
            None => Ok(Vec::new()),
        }
    }

    /// Write out everything the resampler still holds.
    fn finish_segment(&mut self, epoch: &AtomicU64) {
        let tail = match self.resampler.as_mut().map(StreamResampler::flush) {
            Some(Ok(tail)) => tail,
            Some(Err(e)) => {
                log::warn!("Resampler flush failed: {}", e);
                return;
            }
            None => return,
        };
        self.write_samples(&tail, epoch);
    }

    fn device_delay(&self) -> u64 {
        match self.pcm.delay() {
            Ok(frames) => frames.max(0) as u64,
            Err(e) => {
                log::debug!("{}", device_error("playback delay", e));
                0
            }
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.pcm.drop().and_then(|_| self.pcm.prepare()) {
            log::error!("{}", device_error("playback flush", e));
        }
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.clear();
        }
        self.due.clear();
        self.cursor = 0.0;
    }

    /// Write mono samples to every channel and advance the cursor by what
    /// reached the device. Returns false if a reset interrupted the write.
    fn write_samples(&mut self, samples: &[f32], epoch: &AtomicU64) -> bool {
        if samples.is_empty() {
            return true;
        }
        let interleaved: Vec<i16> = samples
            .iter()
            .flat_map(|&s| std::iter::repeat_n(sample_to_pcm16(s), self.channels))
            .collect();
        match self.write(&interleaved, epoch) {
            Some(frames) => {
                self.cursor += frames as f64 / self.rate as f64;
                true
            }
            None => false,
        }
    }

    /// Write interleaved frames one period at a time. Returns the number of
    /// frames written, or `None` if a reset interrupted the write.
    fn write(&self, data: &[i16], epoch: &AtomicU64) -> Option<usize> {
        let io = match self.pcm.io_i16() {
            Ok(io) => io,
            Err(e) => {
                log::error!("{}", device_error("playback io", e));
                return Some(0);
            }
        };

        let total_frames = data.len() / self.channels;
        let mut frames_written = 0;
        let mut retry_count = 0u32;

        while frames_written < total_frames {
            if epoch.load(Ordering::SeqCst) != self.epoch {
                return None;
            }
            let offset = frames_written * self.channels;
            let end = (offset + self.period * self.channels).min(data.len());
            match io.writei(&data[offset..end]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;

                    if let Err(e2) = self.pcm.prepare() {
                        log::error!("Failed to recover PCM playback: {}", e2);
                        break;
                    }

                    if retry_count >= MAX_WRITE_RETRIES {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames",
                            retry_count,
                            total_frames - frames_written
                        );
                        break;
                    }
                }
            }
        }
        Some(frames_written)
    }
}
