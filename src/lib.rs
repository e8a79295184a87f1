//! Streaming voice client for the Ziggy AI server.
//!
//! Microphone audio goes up a WebSocket as PCM16 frames; audio and control
//! frames coming back are demultiplexed, audio is paced through a jitter
//! buffer onto the output device and control messages feed a chat transcript.

pub mod audio;
pub mod chat;
pub mod config;
pub mod controller;
pub mod error;
pub mod frame;
pub mod gui_bridge;
pub mod net_link;
pub mod protocol;

pub use error::{Error, Result};
