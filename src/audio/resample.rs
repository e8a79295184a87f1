//! Streaming sample rate conversion for the output device.
//!
//! Chunks arrive in arbitrary sizes while the FFT resampler works on fixed
//! blocks, so input is accumulated across calls and only whole blocks are
//! converted. [`StreamResampler::flush`] ends a segment: the held-back tail
//! is pushed through with silence and the output is trimmed so that a
//! segment of `n` input frames always yields `round(n * to / from)` frames,
//! however it was split.

use crate::error::Result;
use rubato::{FftFixedInOut, Resampler};

/// Input frames per FFT block. Rounded by rubato to fit the rate ratio.
const BLOCK_FRAMES: usize = 1024;

pub struct StreamResampler {
    from: u32,
    to: u32,
    /// `None` when both rates are equal.
    fft: Option<FftFixedInOut<f32>>,
    pending: Vec<f32>,
    /// Leading output frames still to discard (filter delay).
    skip: usize,
    consumed: u64,
    produced: u64,
}

impl StreamResampler {
    pub fn new(from: u32, to: u32) -> Result<Self> {
        let fft = if from == to {
            None
        } else {
            Some(FftFixedInOut::<f32>::new(
                from as usize,
                to as usize,
                BLOCK_FRAMES,
                1,
            )?)
        };
        let skip = fft.as_ref().map_or(0, |f| f.output_delay());
        Ok(Self {
            from,
            to,
            fft,
            pending: Vec::new(),
            skip,
            consumed: 0,
            produced: 0,
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.from
    }

    pub fn output_rate(&self) -> u32 {
        self.to
    }

    /// Output frames owed for input already accepted but not yet returned.
    pub fn buffered_frames(&self) -> usize {
        (self.expected_output() - self.produced) as usize
    }

    /// Convert `input`, returning every output frame that is complete.
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let Some(fft) = self.fft.as_mut() else {
            return Ok(input.to_vec());
        };
        self.consumed += input.len() as u64;
        self.pending.extend_from_slice(input);

        let mut out = Vec::new();
        let mut start = 0;
        while self.pending.len() - start >= fft.input_frames_next() {
            let end = start + fft.input_frames_next();
            let block = fft.process(&[&self.pending[start..end]], None)?;
            take_block(block, &mut self.skip, &mut out);
            start = end;
        }
        self.pending.drain(..start);
        self.produced += out.len() as u64;
        Ok(out)
    }

    /// End the segment: return the rest of the output and start over.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let expected = self.expected_output();
        let Some(fft) = self.fft.as_mut() else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        while self.produced + (out.len() as u64) < expected {
            let block = if self.pending.is_empty() {
                fft.process_partial(None::<&[&[f32]]>, None)?
            } else {
                let block = fft.process_partial(Some(&[&self.pending[..]]), None)?;
                self.pending.clear();
                block
            };
            take_block(block, &mut self.skip, &mut out);
        }
        out.truncate((expected - self.produced) as usize);
        self.clear();
        Ok(out)
    }

    /// Drop all held input and filter state without producing output.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.consumed = 0;
        self.produced = 0;
        if let Some(fft) = self.fft.as_mut() {
            fft.reset();
            self.skip = fft.output_delay();
        }
    }

    fn expected_output(&self) -> u64 {
        if self.fft.is_none() {
            return self.produced;
        }
        let (from, to) = (self.from as u64, self.to as u64);
        (self.consumed * to + from / 2) / from
    }
}

fn take_block(block: Vec<Vec<f32>>, skip: &mut usize, out: &mut Vec<f32>) {
    let Some(mono) = block.into_iter().next() else {
        return;
    };
    let dropped = (*skip).min(mono.len());
    *skip -= dropped;
    out.extend_from_slice(&mono[dropped..]);
}
