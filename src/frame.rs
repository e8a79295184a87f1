//! Binary wire codec.
//!
//! Headered layout:
//!
//! ```text
//! audio:   [0x01][sample_rate: u32 LE][len: u32 LE][pcm16: len]
//! control: [0x03][len: u32 LE][json utf-8: len]
//! ```
//!
//! Headerless layout: a frame starting with `{` is JSON, anything else is
//! raw PCM16 at 24 kHz.

use crate::audio::pcm::encode_pcm16;
use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;

pub const FRAME_TYPE_AUDIO: u8 = 0x01;
pub const FRAME_TYPE_JSON: u8 = 0x03;

/// Tag + sample rate + length.
pub const AUDIO_HEADER_LEN: usize = 9;
/// Tag + length.
pub const JSON_HEADER_LEN: usize = 5;

/// Implicit sample rate of headerless audio frames.
pub const HEADERLESS_SAMPLE_RATE: u32 = 24_000;

const JSON_OPEN_BRACE: u8 = b'{';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireMode {
    Headered,
    Headerless,
}

/// One inbound frame after demultiplexing.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Audio { sample_rate: u32, payload: Bytes },
    Control(Value),
}

/// Split a binary frame into audio or control payload.
///
/// Returns `Ok(None)` for headered frames with an unknown type tag: those are
/// skipped without error. The payload of an audio frame is a zero-copy slice
/// of `frame`.
pub fn demux(frame: &Bytes, mode: WireMode) -> Result<Option<WireFrame>> {
    if frame.is_empty() {
        return Err(Error::malformed("empty frame"));
    }

    match mode {
        WireMode::Headered => demux_headered(frame),
        WireMode::Headerless => {
            if frame[0] == JSON_OPEN_BRACE {
                parse_json(frame).map(|v| Some(WireFrame::Control(v)))
            } else {
                Ok(Some(WireFrame::Audio {
                    sample_rate: HEADERLESS_SAMPLE_RATE,
                    payload: frame.clone(),
                }))
            }
        }
    }
}

fn demux_headered(frame: &Bytes) -> Result<Option<WireFrame>> {
    match frame[0] {
        FRAME_TYPE_AUDIO => {
            let sample_rate = read_u32_le(frame, 1)?;
            let len = read_u32_le(frame, 5)? as usize;
            let payload = slice_payload(frame, AUDIO_HEADER_LEN, len)?;
            Ok(Some(WireFrame::Audio {
                sample_rate,
                payload,
            }))
        }
        FRAME_TYPE_JSON => {
            let len = read_u32_le(frame, 1)? as usize;
            let payload = slice_payload(frame, JSON_HEADER_LEN, len)?;
            parse_json(&payload).map(|v| Some(WireFrame::Control(v)))
        }
        tag => {
            log::debug!("Ignoring frame with unknown type tag 0x{:02x}", tag);
            Ok(None)
        }
    }
}

fn read_u32_le(frame: &[u8], offset: usize) -> Result<u32> {
    frame
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| {
            Error::malformed(format!(
                "header truncated: need {} bytes, have {}",
                offset + 4,
                frame.len()
            ))
        })
}

fn slice_payload(frame: &Bytes, start: usize, len: usize) -> Result<Bytes> {
    let end = start
        .checked_add(len)
        .ok_or_else(|| Error::malformed("payload length overflow"))?;
    if end > frame.len() {
        return Err(Error::malformed(format!(
            "declared length {} exceeds {} available bytes",
            len,
            frame.len() - start
        )));
    }
    Ok(frame.slice(start..end))
}

fn parse_json(data: &[u8]) -> Result<Value> {
    serde_json::from_slice(data).map_err(|e| Error::malformed(format!("invalid json: {}", e)))
}

/// Parse a WebSocket text frame. Text frames are JSON in every mode.
pub fn parse_text(text: &str) -> Result<Value> {
    parse_json(text.as_bytes())
}

/// Microphone audio framed for upstream transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPacket {
    pub sample_rate: u32,
    /// PCM16 little-endian.
    pub payload: Bytes,
}

impl OutboundPacket {
    /// Convert float samples in `[-1, 1]` to PCM16 and wrap them.
    pub fn from_samples(samples: &[f32], sample_rate: u32) -> Self {
        Self {
            sample_rate,
            payload: Bytes::from(encode_pcm16(samples)),
        }
    }

    pub fn frame_type(&self) -> u8 {
        FRAME_TYPE_AUDIO
    }

    /// Serialize into the headered audio layout.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(AUDIO_HEADER_LEN + self.payload.len());
        buf.put_u8(FRAME_TYPE_AUDIO);
        buf.put_u32_le(self.sample_rate);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Serialize a control message into the headered JSON layout.
pub fn encode_control(value: &Value) -> Result<Bytes> {
    let json = serde_json::to_vec(value)?;
    let mut buf = BytesMut::with_capacity(JSON_HEADER_LEN + json.len());
    buf.put_u8(FRAME_TYPE_JSON);
    buf.put_u32_le(json.len() as u32);
    buf.put_slice(&json);
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm::decode_pcm16;
    use serde_json::json;

    #[test]
    fn headered_audio_frame() {
        let frame = Bytes::from_static(&[
            0x01, // audio
            0x80, 0x3E, 0x00, 0x00, // 16000
            0x02, 0x00, 0x00, 0x00, // 2 bytes
            0x00, 0x10, // 4096
        ]);

        let parsed = demux(&frame, WireMode::Headered).unwrap().unwrap();
        let WireFrame::Audio {
            sample_rate,
            payload,
        } = parsed
        else {
            panic!("expected audio frame");
        };
        assert_eq!(sample_rate, 16000);

        let samples = decode_pcm16(&payload).unwrap();
        assert_eq!(samples.len(), 1);
        assert!((samples[0] - 0.125).abs() < f32::EPSILON);
    }

    #[test]
    fn headered_control_frame() {
        let frame = encode_control(&json!({"type": "transcription", "text": "hi"})).unwrap();
        let parsed = demux(&frame, WireMode::Headered).unwrap();
        assert_eq!(
            parsed,
            Some(WireFrame::Control(json!({"type": "transcription", "text": "hi"})))
        );
    }

    #[test]
    fn unknown_tag_is_skipped() {
        let frame = Bytes::from_static(&[0x02, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(demux(&frame, WireMode::Headered).unwrap(), None);
    }

    #[test]
    fn declared_length_past_end_is_malformed() {
        let frame = Bytes::from_static(&[0x01, 0x80, 0x3E, 0, 0, 0x10, 0, 0, 0, 0x00, 0x10]);
        assert!(matches!(
            demux(&frame, WireMode::Headered),
            Err(Error::MalformedFrame(_))
        ));

        let frame = Bytes::from_static(&[0x03, 0xFF, 0xFF, 0xFF, 0xFF, b'{', b'}']);
        assert!(matches!(
            demux(&frame, WireMode::Headered),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn truncated_header_is_malformed() {
        let frame = Bytes::from_static(&[0x01, 0x80, 0x3E]);
        assert!(matches!(
            demux(&frame, WireMode::Headered),
            Err(Error::MalformedFrame(_))
        ));
        assert!(demux(&Bytes::new(), WireMode::Headerless).is_err());
    }

    #[test]
    fn trailing_bytes_after_payload_are_ignored() {
        let frame = Bytes::from_static(&[0x01, 0x80, 0x3E, 0, 0, 0x02, 0, 0, 0, 0x00, 0x10, 0xAA]);
        let Some(WireFrame::Audio { payload, .. }) = demux(&frame, WireMode::Headered).unwrap()
        else {
            panic!("expected audio frame");
        };
        assert_eq!(&payload[..], &[0x00, 0x10]);
    }

    #[test]
    fn headerless_brace_is_always_json() {
        // `{"a":1}` is also an even-length byte run that would decode as PCM.
        let frame = Bytes::from_static(br#"{"type":"agent_switched","agent_id":"x1"}"#);
        let parsed = demux(&frame, WireMode::Headerless).unwrap();
        assert_eq!(
            parsed,
            Some(WireFrame::Control(json!({"type": "agent_switched", "agent_id": "x1"})))
        );

        let broken = Bytes::from_static(&[b'{', 0x00, 0x10, 0x00]);
        assert!(matches!(
            demux(&broken, WireMode::Headerless),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn headerless_audio_uses_implicit_rate() {
        let frame = Bytes::from_static(&[0x00, 0x10, 0x00, 0xF0]);
        let parsed = demux(&frame, WireMode::Headerless).unwrap();
        assert_eq!(
            parsed,
            Some(WireFrame::Audio {
                sample_rate: HEADERLESS_SAMPLE_RATE,
                payload: frame.clone(),
            })
        );
    }

    #[test]
    fn outbound_packet_layout() {
        let packet = OutboundPacket::from_samples(&[0.125, -1.0, 1.0], 16000);
        let bytes = packet.encode();

        assert_eq!(packet.frame_type(), FRAME_TYPE_AUDIO);
        assert_eq!(bytes.len(), AUDIO_HEADER_LEN + 6);
        assert_eq!(&bytes[..9], &[0x01, 0x80, 0x3E, 0, 0, 0x06, 0, 0, 0]);
        // 4096, -32768, 32767 (clamped)
        assert_eq!(&bytes[9..], &[0x00, 0x10, 0x00, 0x80, 0xFF, 0x7F]);
    }

    #[test]
    fn bad_frame_does_not_affect_next_frame() {
        let bad = Bytes::from_static(&[0x01, 0x80]);
        let good = OutboundPacket::from_samples(&[0.5], 8000).encode();

        assert!(demux(&bad, WireMode::Headered).is_err());
        assert!(matches!(
            demux(&good, WireMode::Headered),
            Ok(Some(WireFrame::Audio { sample_rate: 8000, .. }))
        ));
    }
}
