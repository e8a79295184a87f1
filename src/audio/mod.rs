//! audio - PCM decoding, playback scheduling and microphone capture
//!
//! Inbound audio is decoded into [`AudioChunk`]s and handed to the
//! [`Player`], which paces them through a [`JitterBuffer`] onto a
//! [`PlaybackSink`]. ALSA devices are used when the `alsa` feature is
//! enabled; otherwise playback runs on the tokio clock.

#[cfg(feature = "alsa")]
pub mod alsa_device;
#[cfg(feature = "alsa")]
pub mod alsa_sink;
pub mod jitter_buffer;
pub mod pcm;
pub mod player;
pub mod record;
pub mod resample;
pub mod sink;

#[cfg(feature = "alsa")]
pub use alsa_device::AlsaCapture;
#[cfg(feature = "alsa")]
pub use alsa_sink::AlsaSink;
pub use jitter_buffer::{BufferState, BufferStatus, JitterBuffer, PlaybackSink, PlaybackTicket};
pub use pcm::AudioChunk;
pub use player::{CompletionSender, Player, PlayerConfig, PlayerHandle};
pub use record::{CaptureDevice, CaptureSource, FileCapture, Recorder};
pub use resample::StreamResampler;
pub use sink::ClockSink;
