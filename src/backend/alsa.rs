//! ALSA backend: blocking capture -> callback -> blocking playback on a
//! dedicated real-time thread.
//!
//! Capture is opened mono, playback stereo interleaved, both in f32 at the
//! session rate with a two-period hardware buffer. An `EPIPE`/`ESTRPIPE`
//! from either stream re-prepares it, abandons the iteration and counts
//! one xrun.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use alsa::pcm::{Access, Format, Frames, HwParams, PCM};
use alsa::{Direction, ValueOr};

use super::{AudioBackend, ProcessCallback};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::{rt, CHANNELS};

/// Hardware buffer size, in periods of `buffer_size` frames.
const PERIODS: usize = 2;

/// State handed to the audio thread and handed back on stop, so the
/// session can start the same backend again without reopening devices.
struct Devices {
    capture: PCM,
    playback: PCM,
    callback: ProcessCallback,
}

pub struct AlsaBackend {
    running: Arc<AtomicBool>,
    xruns: Arc<AtomicU64>,
    devices: Option<Devices>,
    thread: Option<JoinHandle<Devices>>,
    frames: usize,
    latency_ms: f64,
}

impl AlsaBackend {
    pub fn new(config: &SessionConfig, callback: ProcessCallback) -> Result<Self> {
        let capture = open_pcm(
            &config.capture_device,
            Direction::Capture,
            config.sample_rate,
            1,
            config.buffer_size,
        )?;
        let playback = open_pcm(
            &config.playback_device,
            Direction::Playback,
            config.sample_rate,
            CHANNELS as u32,
            config.buffer_size,
        )?;

        // One-way device latency: capture buffer plus playback buffer.
        let buffer_frames = (config.buffer_size * PERIODS * 2) as f64;
        let latency_ms = buffer_frames / config.sample_rate as f64 * 1000.0;

        Ok(Self {
            running: Arc::new(AtomicBool::new(false)),
            xruns: Arc::new(AtomicU64::new(0)),
            devices: Some(Devices {
                capture,
                playback,
                callback,
            }),
            thread: None,
            frames: config.buffer_size,
            latency_ms,
        })
    }
}

impl AudioBackend for AlsaBackend {
    fn start(&mut self) -> Result<()> {
        {
            let devices = self.devices.as_ref().ok_or(Error::AlreadyRunning)?;
            devices
                .capture
                .prepare()
                .map_err(|e| Error::Backend(format!("capture prepare: {e}")))?;
            devices
                .playback
                .prepare()
                .map_err(|e| Error::Backend(format!("playback prepare: {e}")))?;
            devices
                .capture
                .start()
                .map_err(|e| Error::Backend(format!("capture start: {e}")))?;
        }
        let Some(devices) = self.devices.take() else {
            return Err(Error::AlreadyRunning);
        };

        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let xruns = self.xruns.clone();
        let frames = self.frames;
        let handle = thread::Builder::new()
            .name("pwar-alsa".into())
            .spawn(move || {
                let mut devices = devices;
                audio_loop(&mut devices, &running, &xruns, frames);
                devices
            })
            .map_err(|e| Error::Backend(format!("audio thread spawn: {e}")))?;

        self.thread = Some(handle);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            match handle.join() {
                Ok(devices) => self.devices = Some(devices),
                Err(_) => return Err(Error::Backend("audio thread panicked".into())),
            }
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn latency_ms(&self) -> f64 {
        self.latency_ms
    }

    fn xruns(&self) -> u64 {
        self.xruns.load(Ordering::Relaxed)
    }
}

impl Drop for AlsaBackend {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn open_pcm(
    device: &str,
    dir: Direction,
    rate: u32,
    channels: u32,
    period: usize,
) -> Result<PCM> {
    let ctx = |what: &str, e: alsa::Error| Error::Backend(format!("{device}: {what}: {e}"));

    let pcm = PCM::new(device, dir, false).map_err(|e| ctx("open", e))?;
    {
        let hwp = HwParams::any(&pcm).map_err(|e| ctx("hw params", e))?;
        hwp.set_channels(channels).map_err(|e| ctx("channels", e))?;
        hwp.set_rate(rate, ValueOr::Nearest)
            .map_err(|e| ctx("rate", e))?;
        hwp.set_format(Format::float())
            .map_err(|e| ctx("format", e))?;
        hwp.set_access(Access::RWInterleaved)
            .map_err(|e| ctx("access", e))?;
        hwp.set_period_size(period as Frames, ValueOr::Nearest)
            .map_err(|e| ctx("period size", e))?;
        hwp.set_buffer_size_near((period * PERIODS) as Frames)
            .map_err(|e| ctx("buffer size", e))?;
        pcm.hw_params(&hwp).map_err(|e| ctx("apply hw params", e))?;
    }
    Ok(pcm)
}

fn audio_loop(devices: &mut Devices, running: &AtomicBool, xruns: &AtomicU64, frames: usize) {
    rt::promote_current_thread("alsa audio");

    let mut input = vec![0.0f32; frames];
    let mut out_left = vec![0.0f32; frames];
    let mut out_right = vec![0.0f32; frames];
    let mut interleaved = vec![0.0f32; frames * CHANNELS];

    let capture_io = match devices.capture.io_f32() {
        Ok(io) => io,
        Err(e) => {
            log::error!("capture io: {e}");
            return;
        }
    };
    let playback_io = match devices.playback.io_f32() {
        Ok(io) => io,
        Err(e) => {
            log::error!("playback io: {e}");
            return;
        }
    };

    while running.load(Ordering::Relaxed) {
        match capture_io.readi(&mut input) {
            Ok(n) => {
                if n < frames {
                    input[n..].fill(0.0);
                }
            }
            Err(e) => {
                if recover(&devices.capture, e, xruns) {
                    continue;
                }
                break;
            }
        }

        (devices.callback)(&input, &mut out_left, &mut out_right);

        for i in 0..frames {
            interleaved[i * CHANNELS] = out_left[i];
            interleaved[i * CHANNELS + 1] = out_right[i];
        }
        if let Err(e) = playback_io.writei(&interleaved) {
            if recover(&devices.playback, e, xruns) {
                continue;
            }
            break;
        }
    }
}

/// Re-prepare a stream after an xrun. Returns true when the loop may go on.
fn recover(pcm: &PCM, err: alsa::Error, xruns: &AtomicU64) -> bool {
    let errno = err.errno();
    if errno == libc::EPIPE || errno == libc::ESTRPIPE {
        xruns.fetch_add(1, Ordering::Relaxed);
        match pcm.try_recover(err, true) {
            Ok(()) => true,
            Err(e) => {
                log::error!("stream recovery failed: {e}");
                false
            }
        }
    } else {
        log::error!("alsa i/o error: {err}");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;

    #[test]
    fn test_open_missing_device_fails_cleanly() {
        let config = SessionConfig {
            backend: BackendKind::Alsa,
            capture_device: "pwar-no-such-device".into(),
            playback_device: "pwar-no-such-device".into(),
            ..SessionConfig::default()
        };
        config.validate().unwrap();

        let callback: ProcessCallback = Box::new(|_, _, _| {});
        match AlsaBackend::new(&config, callback) {
            Err(Error::Backend(msg)) => assert!(msg.contains("pwar-no-such-device")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("open of a bogus device succeeded"),
        }
    }
}
