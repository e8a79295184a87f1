//! PCM16 conversion and the decoded audio chunk type.

use crate::error::{Error, Result};
use std::sync::Arc;

const PCM16_SCALE: f32 = 32768.0;

/// Decode little-endian PCM16 bytes into samples in `[-1, 1)`.
///
/// Samples are assembled from byte pairs, so the payload may start at any
/// offset inside the frame (the 9-byte audio header leaves it unaligned).
pub fn decode_pcm16(payload: &[u8]) -> Result<Vec<f32>> {
    if payload.len() % 2 != 0 {
        return Err(Error::malformed(format!(
            "odd PCM16 payload length {}",
            payload.len()
        )));
    }
    Ok(payload
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / PCM16_SCALE)
        .collect())
}

#[inline]
pub fn sample_to_pcm16(sample: f32) -> i16 {
    (sample * PCM16_SCALE).clamp(-32768.0, 32767.0).round() as i16
}

/// Encode float samples as little-endian PCM16 bytes.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        out.extend_from_slice(&sample_to_pcm16(s).to_le_bytes());
    }
    out
}

/// A decoded block of mono audio. Immutable; the sample buffer is shared
/// with the output device without copying.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    samples: Arc<[f32]>,
    sample_rate: u32,
    duration: f64,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Result<Self> {
        if sample_rate == 0 {
            return Err(Error::malformed("sample rate 0"));
        }
        let duration = samples.len() as f64 / sample_rate as f64;
        Ok(Self {
            samples: Arc::from(samples.into_boxed_slice()),
            sample_rate,
            duration,
        })
    }

    /// Decode a PCM16 payload straight into a chunk.
    pub fn from_pcm16(payload: &[u8], sample_rate: u32) -> Result<Self> {
        Self::new(decode_pcm16(payload)?, sample_rate)
    }

    pub fn samples(&self) -> &Arc<[f32]> {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Length in seconds: `samples / sample_rate`.
    pub fn duration_secs(&self) -> f64 {
        self.duration
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_known_values() {
        let data = [
            0x00, 0x10, // 4096
            0x00, 0x80, // -32768
            0xFF, 0x7F, // 32767
            0xFF, 0xFF, // -1
        ];
        let samples = decode_pcm16(&data).unwrap();
        assert_eq!(samples, vec![0.125, -1.0, 32767.0 / 32768.0, -1.0 / 32768.0]);
    }

    #[test]
    fn decode_rejects_odd_length() {
        assert!(matches!(
            decode_pcm16(&[0x00, 0x10, 0x00]),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn encode_clamps_and_rounds() {
        assert_eq!(sample_to_pcm16(2.0), i16::MAX);
        assert_eq!(sample_to_pcm16(-2.0), i16::MIN);
        assert_eq!(sample_to_pcm16(1.0), i16::MAX);
        assert_eq!(sample_to_pcm16(0.125), 4096);
        // 0.6 / 32768 rounds up to one step
        assert_eq!(sample_to_pcm16(0.6 / 32768.0), 1);
        assert_eq!(encode_pcm16(&[0.125, -1.0]), vec![0x00, 0x10, 0x00, 0x80]);
    }

    #[test]
    fn chunk_duration() {
        let chunk = AudioChunk::new(vec![0.0; 1600], 16000).unwrap();
        assert_eq!(chunk.len(), 1600);
        assert!((chunk.duration_secs() - 0.1).abs() < 1e-12);

        assert!(AudioChunk::new(vec![0.0; 10], 0).is_err());
        assert!(AudioChunk::from_pcm16(&[0x01], 16000).is_err());
    }
}
