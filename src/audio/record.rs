//! Microphone capture sessions.
//!
//! A capture device is exclusive: the [`Recorder`] owns at most one session
//! and stops it, releasing the device, before opening the next one. Each
//! session runs on its own OS thread and turns every full buffer of samples
//! into an [`OutboundPacket`].

use crate::error::{Error, Result};
use crate::frame::OutboundPacket;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Source of mono capture samples.
pub trait CaptureDevice {
    fn sample_rate(&self) -> u32;

    /// Block until samples are available and copy them into `buf`.
    /// `Ok(0)` means the source is exhausted.
    fn read(&mut self, buf: &mut [f32]) -> Result<usize>;
}

/// Map an I/O error from opening a capture source.
pub(crate) fn open_error(what: &str, e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::PermissionDenied => Error::DeviceAccessDenied(format!("{}: {}", what, e)),
        _ => Error::Device(format!("{}: {}", what, e)),
    }
}

/// Where microphone samples come from.
#[derive(Debug, Clone)]
pub enum CaptureSource {
    /// Raw PCM16 mono file, replayed in real time.
    File(PathBuf),
    #[cfg(feature = "alsa")]
    Alsa(String),
}

struct Session {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct Recorder {
    frames_per_packet: usize,
    session: Option<Session>,
}

impl Recorder {
    pub fn new(frames_per_packet: usize) -> Self {
        Self {
            frames_per_packet: frames_per_packet.max(1),
            session: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }

    /// Start a new session. The device is opened on the capture thread by
    /// `open`; an open failure (e.g. [`Error::DeviceAccessDenied`]) is
    /// returned here and no session is started.
    pub fn start<D, F>(&mut self, open: F, tx: mpsc::Sender<OutboundPacket>) -> Result<()>
    where
        D: CaptureDevice,
        F: FnOnce() -> Result<D> + Send + 'static,
    {
        self.stop();

        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();
        let frames = self.frames_per_packet;

        let handle = {
            let running = running.clone();
            thread::Builder::new()
                .name("audio-record".into())
                .spawn(move || {
                    let device = match open() {
                        Ok(device) => {
                            let _ = ready_tx.send(Ok(()));
                            device
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    if let Err(e) = record_loop(device, frames, &tx, &running) {
                        log::error!("Recording thread error: {}", e);
                    }
                })
                .map_err(|e| Error::Device(format!("failed to spawn capture thread: {}", e)))?
        };

        let opened = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(Error::Device("capture thread exited".into())));
        if let Err(e) = opened {
            let _ = handle.join();
            return Err(e);
        }

        log::info!("Recording started ({} samples per packet)", frames);
        self.session = Some(Session { running, handle });
        Ok(())
    }

    /// Start a session on `source`, captured at `sample_rate`.
    pub fn start_source(
        &mut self,
        source: &CaptureSource,
        sample_rate: u32,
        tx: mpsc::Sender<OutboundPacket>,
    ) -> Result<()> {
        match source.clone() {
            CaptureSource::File(path) => {
                self.start(move || FileCapture::open(&path, sample_rate), tx)
            }
            #[cfg(feature = "alsa")]
            CaptureSource::Alsa(device) => self.start(
                move || super::alsa_device::AlsaCapture::open(&device, sample_rate),
                tx,
            ),
        }
    }

    /// Stop the current session and wait until its device is released.
    /// Blocks the calling thread; async callers use [`Self::shutdown`].
    pub fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            session.join();
        }
    }

    /// Like [`Self::stop`], but waits for the capture thread on the blocking
    /// pool instead of the runtime worker.
    pub async fn shutdown(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = tokio::task::spawn_blocking(move || session.join()).await {
                log::error!("Capture shutdown failed: {}", e);
            }
        }
    }
}

impl Session {
    fn join(self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.handle.join();
        log::info!("Recording stopped");
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn record_loop<D: CaptureDevice>(
    mut device: D,
    frames: usize,
    tx: &mpsc::Sender<OutboundPacket>,
    running: &AtomicBool,
) -> Result<()> {
    let sample_rate = device.sample_rate();
    let mut buf = vec![0f32; frames];
    let mut filled = 0;

    while running.load(Ordering::Relaxed) {
        let n = device.read(&mut buf[filled..])?;
        if n == 0 {
            log::info!("Capture source exhausted");
            break;
        }
        filled += n;
        if filled < frames {
            continue;
        }
        filled = 0;

        // Never block here: the consumer may be the task waiting in `stop`.
        match tx.try_send(OutboundPacket::from_samples(&buf, sample_rate)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => log::warn!("Capture channel full, dropping packet"),
            Err(TrySendError::Closed(_)) => {
                log::warn!("Capture receiver dropped");
                break;
            }
        }
    }
    Ok(())
}

/// Raw PCM16 little-endian mono file, delivered at real-time pace.
pub struct FileCapture {
    reader: BufReader<File>,
    sample_rate: u32,
    started: Instant,
    delivered: u64,
    bytes: Vec<u8>,
}

impl FileCapture {
    pub fn open(path: &Path, sample_rate: u32) -> Result<Self> {
        if sample_rate == 0 {
            return Err(Error::InvalidConfig("capture sample rate 0".into()));
        }
        let file = File::open(path).map_err(|e| open_error(&path.display().to_string(), e))?;
        Ok(Self {
            reader: BufReader::new(file),
            sample_rate,
            started: Instant::now(),
            delivered: 0,
            bytes: Vec::new(),
        })
    }
}

impl CaptureDevice for FileCapture {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read(&mut self, buf: &mut [f32]) -> Result<usize> {
        self.bytes.resize(buf.len() * 2, 0);
        let mut got = 0;
        while got < self.bytes.len() {
            match self.reader.read(&mut self.bytes[got..]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Device(format!("capture file read: {}", e))),
            }
        }

        // A trailing odd byte cannot form a sample.
        let samples = got / 2;
        for (out, pair) in buf.iter_mut().zip(self.bytes[..samples * 2].chunks_exact(2)) {
            *out = i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0;
        }

        self.delivered += samples as u64;
        let due = self.started
            + Duration::from_secs_f64(self.delivered as f64 / self.sample_rate as f64);
        let now = Instant::now();
        if due > now {
            thread::sleep(due - now);
        }
        Ok(samples)
    }
}
