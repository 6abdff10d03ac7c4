//! Simulated backend: drives the process callback from a paced thread
//! with a synthetic 10 Hz test tone, no hardware involved.
//!
//! The driver also verifies that the output is an echo of its own input:
//! rising zero crossings are matched between input and output to estimate
//! the round trip in frames, and a sine-recurrence prediction flags
//! discontinuities (dropped or corrupted chunks) in the returned audio.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{AudioBackend, ProcessCallback};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::rt;

/// Test tone frequency. Low enough that one period spans many buffers, so
/// a crossing match is unambiguous for any realistic round trip.
const TEST_TONE_HZ: f64 = 10.0;
const AMPLITUDE: f64 = 0.5;

/// Samples with magnitude below this are treated as silence by the
/// discontinuity detector.
const SILENCE_EPS: f32 = 1e-4;

/// Allowed deviation from the sine-recurrence prediction.
const TOLERANCE: f32 = 0.05;

/// Counters exposed by the simulated driver.
#[derive(Debug)]
pub struct SimStats {
    pub callbacks: AtomicU64,
    pub discontinuities: AtomicU64,
    /// Latest zero-crossing round-trip estimate in frames; -1 until seen.
    pub round_trip_frames: AtomicI64,
}

impl Default for SimStats {
    fn default() -> Self {
        Self {
            callbacks: AtomicU64::new(0),
            discontinuities: AtomicU64::new(0),
            round_trip_frames: AtomicI64::new(-1),
        }
    }
}

/// Matches output against expected echoes of the generated input.
struct EchoVerifier {
    /// Sine recurrence coefficient 2*cos(omega).
    k: f32,
    in_crossings: VecDeque<u64>,
    prev_in: f32,
    prev_out: f32,
    prev1: f32,
    prev2: f32,
    stats: Arc<SimStats>,
}

impl EchoVerifier {
    fn new(omega: f64, stats: Arc<SimStats>) -> Self {
        Self {
            k: (2.0 * omega.cos()) as f32,
            in_crossings: VecDeque::with_capacity(64),
            prev_in: 0.0,
            prev_out: 0.0,
            prev1: 0.0,
            prev2: 0.0,
            stats,
        }
    }

    /// Record rising zero crossings of the generated input.
    fn observe_input(&mut self, samples: &[f32], base: u64) {
        for (i, &s) in samples.iter().enumerate() {
            if self.prev_in <= 0.0 && s > 0.0 {
                self.in_crossings.push_back(base + i as u64);
                if self.in_crossings.len() > 64 {
                    self.in_crossings.pop_front();
                }
            }
            self.prev_in = s;
        }
    }

    /// Match output crossings to input crossings and check continuity.
    fn observe_output(&mut self, samples: &[f32], base: u64) {
        for (i, &x) in samples.iter().enumerate() {
            let idx = base + i as u64;

            if self.prev_out <= 0.0 && x > 0.0 {
                // The newest input crossing at or before this output sample
                // is the one being echoed.
                let mut matched = None;
                while let Some(&c) = self.in_crossings.front() {
                    if c <= idx {
                        matched = Some(c);
                        self.in_crossings.pop_front();
                    } else {
                        break;
                    }
                }
                if let Some(c) = matched {
                    self.stats
                        .round_trip_frames
                        .store((idx - c) as i64, Ordering::Relaxed);
                }
            }
            self.prev_out = x;

            // A pure sine obeys x[n] = k*x[n-1] - x[n-2]; silence regions
            // (prefill, underrun fills) are exempt.
            if self.prev1.abs() > SILENCE_EPS && self.prev2.abs() > SILENCE_EPS {
                let predicted = self.k * self.prev1 - self.prev2;
                if (x - predicted).abs() > TOLERANCE {
                    self.stats.discontinuities.fetch_add(1, Ordering::Relaxed);
                }
            }
            self.prev2 = self.prev1;
            self.prev1 = x;
        }
    }
}

pub struct SimulatedBackend {
    running: Arc<AtomicBool>,
    stats: Arc<SimStats>,
    callback: Option<ProcessCallback>,
    thread: Option<JoinHandle<ProcessCallback>>,
    frames: usize,
    rate: u32,
    latency_ms: f64,
}

impl SimulatedBackend {
    pub fn new(config: &SessionConfig, callback: ProcessCallback) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(SimStats::default()),
            callback: Some(callback),
            thread: None,
            frames: config.buffer_size,
            rate: config.sample_rate,
            latency_ms: config.buffer_size as f64 / config.sample_rate as f64 * 1000.0,
        }
    }

    pub fn stats(&self) -> Arc<SimStats> {
        self.stats.clone()
    }
}

impl AudioBackend for SimulatedBackend {
    fn start(&mut self) -> Result<()> {
        let mut callback = self.callback.take().ok_or(Error::AlreadyRunning)?;

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let stats = self.stats.clone();
        let frames = self.frames;
        let rate = self.rate;

        let handle = thread::Builder::new()
            .name("pwar-sim".into())
            .spawn(move || {
                drive(&mut callback, &running, &stats, frames, rate);
                callback
            })
            .map_err(|e| Error::Backend(format!("sim thread spawn: {e}")))?;

        self.thread = Some(handle);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            match handle.join() {
                Ok(callback) => self.callback = Some(callback),
                Err(_) => return Err(Error::Backend("sim thread panicked".into())),
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
        0
    }
}

impl Drop for SimulatedBackend {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn drive(
    callback: &mut ProcessCallback,
    running: &AtomicBool,
    stats: &Arc<SimStats>,
    frames: usize,
    rate: u32,
) {
    rt::promote_current_thread("simulated audio");

    let period = Duration::from_nanos(frames as u64 * 1_000_000_000 / rate as u64);
    let omega = 2.0 * std::f64::consts::PI * TEST_TONE_HZ / rate as f64;

    let mut verifier = EchoVerifier::new(omega, stats.clone());
    let mut input = vec![0.0f32; frames];
    let mut out_left = vec![0.0f32; frames];
    let mut out_right = vec![0.0f32; frames];

    let mut phase = 0.0f64;
    let mut sample_index = 0u64;
    let mut next_tick = Instant::now() + period;

    while running.load(Ordering::Relaxed) {
        for slot in input.iter_mut() {
            *slot = (phase.sin() * AMPLITUDE) as f32;
            phase += omega;
            if phase >= 2.0 * std::f64::consts::PI {
                phase -= 2.0 * std::f64::consts::PI;
            }
        }
        verifier.observe_input(&input, sample_index);

        callback(&input, &mut out_left, &mut out_right);
        stats.callbacks.fetch_add(1, Ordering::Relaxed);

        verifier.observe_output(&out_left, sample_index);
        sample_index += frames as u64;

        // Hybrid sleep-spin pacing, resnapping if we fell behind.
        let now = Instant::now();
        if next_tick > now {
            let wait = next_tick - now;
            if wait > Duration::from_millis(2) {
                thread::sleep(wait - Duration::from_millis(1));
            }
            while Instant::now() < next_tick {
                std::hint::spin_loop();
            }
        } else if now > next_tick + period {
            next_tick = now;
        }
        next_tick += period;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;

    fn sine(n: usize, start: u64, omega: f64) -> Vec<f32> {
        (0..n)
            .map(|i| ((start + i as u64) as f64 * omega).sin() as f32 * AMPLITUDE as f32)
            .collect()
    }

    #[test]
    fn test_verifier_measures_pure_delay() {
        let omega = 2.0 * std::f64::consts::PI * TEST_TONE_HZ / 48000.0;
        let stats = Arc::new(SimStats::default());
        let mut verifier = EchoVerifier::new(omega, stats.clone());

        // 10000 samples of tone, echoed 96 samples late.
        let delay = 96u64;
        let tone = sine(10000, 0, omega);
        let mut echo = vec![0.0f32; delay as usize];
        echo.extend_from_slice(&tone[..10000 - delay as usize]);

        let mut base = 0u64;
        for (chunk_in, chunk_out) in tone.chunks(64).zip(echo.chunks(64)) {
            verifier.observe_input(chunk_in, base);
            verifier.observe_output(chunk_out, base);
            base += 64;
        }

        assert_eq!(stats.round_trip_frames.load(Ordering::Relaxed), delay as i64);
        assert_eq!(stats.discontinuities.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_verifier_flags_a_dropped_chunk() {
        let omega = 2.0 * std::f64::consts::PI * TEST_TONE_HZ / 48000.0;
        let stats = Arc::new(SimStats::default());
        let mut verifier = EchoVerifier::new(omega, stats.clone());

        // Echo with a glitch: 64 samples replaced by a constant mid-tone.
        let tone = sine(6000, 0, omega);
        let mut echo = tone.clone();
        for s in echo[3000..3064].iter_mut() {
            *s = 0.4;
        }

        let mut base = 0u64;
        for (chunk_in, chunk_out) in tone.chunks(64).zip(echo.chunks(64)) {
            verifier.observe_input(chunk_in, base);
            verifier.observe_output(chunk_out, base);
            base += 64;
        }

        assert!(stats.discontinuities.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_backend_paces_and_measures_an_echo_callback() {
        let config = SessionConfig {
            backend: BackendKind::Simulated,
            buffer_size: 64,
            packet_size: 64,
            ..SessionConfig::default()
        };

        // Callback echoing input back with a 96-sample FIFO delay.
        let delay = 96usize;
        let mut fifo: VecDeque<f32> = std::iter::repeat(0.0).take(delay).collect();
        let callback: ProcessCallback = Box::new(move |input, out_l, out_r| {
            for &s in input {
                fifo.push_back(s);
            }
            for i in 0..input.len() {
                let v = fifo.pop_front().unwrap_or(0.0);
                out_l[i] = v;
                out_r[i] = v;
            }
        });

        let mut backend = SimulatedBackend::new(&config, callback);
        let stats = backend.stats();

        backend.start().unwrap();
        assert!(backend.is_running());
        // One rising crossing every 4800 samples at 48 kHz; 300 ms covers a few.
        thread::sleep(Duration::from_millis(300));
        backend.stop().unwrap();
        assert!(!backend.is_running());

        assert!(stats.callbacks.load(Ordering::Relaxed) > 100);
        assert_eq!(stats.round_trip_frames.load(Ordering::Relaxed), delay as i64);
        assert_eq!(stats.discontinuities.load(Ordering::Relaxed), 0);

        // A stopped backend can be started again.
        backend.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        backend.stop().unwrap();
    }
}
