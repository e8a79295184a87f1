//! ALSA PCM device wrappers for capture and playback.

use super::record::CaptureDevice;
use crate::error::{Error, Result};
use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};

const EPERM: i32 = 1;
const EACCES: i32 = 13;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Period size in frames
    pub period_size: usize,
}

/// Permission failures become [`Error::DeviceAccessDenied`].
pub fn device_error(what: &str, e: alsa::Error) -> Error {
    let errno = e.errno().abs();
    if errno == EACCES || errno == EPERM {
        Error::DeviceAccessDenied(format!("{}: {}", what, e))
    } else {
        Error::Device(format!("{}: {}", what, e))
    }
}

pub fn open_capture(device: &str, sample_rate: u32, channels: u32) -> Result<(PCM, AlsaParams)> {
    open_pcm(device, Direction::Capture, sample_rate, channels, None)
        .map_err(|e| device_error(&format!("capture device '{}'", device), e))
}

pub fn open_playback(
    device: &str,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams)> {
    open_pcm(device, Direction::Playback, sample_rate, channels, period_size)
        .map_err(|e| device_error(&format!("playback device '{}'", device), e))
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> alsa::Result<(PCM, AlsaParams)> {
    let pcm = PCM::new(device, direction, false)?;

    {
        let hwp = HwParams::any(&pcm)?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(channels)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
        }
        pcm.hw_params(&hwp)?;
    }

    let params = {
        let hwp = pcm.hw_params_current()?;
        AlsaParams {
            sample_rate: hwp.get_rate()?,
            channels: hwp.get_channels()?,
            period_size: hwp.get_period_size()? as usize,
        }
    };

    log::info!(
        "ALSA {:?}: device={}, rate={}, channels={}, period_size={}",
        direction,
        device,
        params.sample_rate,
        params.channels,
        params.period_size,
    );

    Ok((pcm, params))
}

/// Microphone input from an ALSA capture device, downmixed to mono.
pub struct AlsaCapture {
    pcm: PCM,
    params: AlsaParams,
    scratch: Vec<i16>,
}

impl AlsaCapture {
    pub fn open(device: &str, sample_rate: u32) -> Result<Self> {
        let (pcm, params) = open_capture(device, sample_rate, 1)?;
        Ok(Self {
            pcm,
            params,
            scratch: Vec::new(),
        })
    }
}

impl CaptureDevice for AlsaCapture {
    fn sample_rate(&self) -> u32 {
        self.params.sample_rate
    }

    fn read(&mut self, buf: &mut [f32]) -> Result<usize> {
        let channels = self.params.channels.max(1) as usize;
        self.scratch.resize(buf.len() * channels, 0);
        let io = self
            .pcm
            .io_i16()
            .map_err(|e| device_error("capture io", e))?;

        loop {
            match io.readi(&mut self.scratch) {
                Ok(frames) => {
                    for (i, out) in buf.iter_mut().take(frames).enumerate() {
                        let frame = &self.scratch[i * channels..(i + 1) * channels];
                        let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                        *out = (sum / channels as i32) as f32 / 32768.0;
                    }
                    return Ok(frames);
                }
                Err(e) => {
                    log::warn!("ALSA capture error: {}, recovering...", e);
                    self.pcm
                        .prepare()
                        .map_err(|e2| device_error("capture recovery", e2))?;
                }
            }
        }
    }
}
