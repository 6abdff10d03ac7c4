//! Latency accounting over the four wire timestamps and the ring fill level.
//!
//! Five signals are tracked: round trip (t4-t1), peer audio processing
//! (t3-t2), packet inter-arrival on the peer side (delta t2), packet
//! inter-arrival on the local side (delta t4), and the ring-buffer fill
//! after each push. Each signal accumulates min/max/total/count in a
//! rolling window; every two wall-clock seconds the window is reported,
//! copied into the current snapshot and reset.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::clock;
use crate::wire::AudioPacket;

const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Min/avg/max triple of one snapshot window, in milliseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Stat {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
}

/// Rolling accumulator for one signal.
#[derive(Clone, Copy, Debug, Default)]
struct Window {
    min: f64,
    max: f64,
    total: f64,
    count: u64,
}

impl Window {
    fn record(&mut self, value: f64) {
        if self.count == 0 || value < self.min {
            self.min = value;
        }
        if self.count == 0 || value > self.max {
            self.max = value;
        }
        self.total += value;
        self.count += 1;
    }

    /// Snapshot with the given unit scale applied. Empty windows are all-zero.
    fn snapshot(&self, scale: f64) -> Stat {
        if self.count == 0 {
            return Stat::default();
        }
        Stat {
            min: self.min * scale,
            avg: self.total / self.count as f64 * scale,
            max: self.max * scale,
        }
    }
}

/// The last flushed two-second window, all values in milliseconds.
#[derive(Clone, Copy, Debug, Default)]
pub struct LatencyMetrics {
    /// t4 - t1: full network + peer round trip.
    pub round_trip: Stat,
    /// t3 - t2: time the peer spent on one packet.
    pub audio_processing: Stat,
    /// delta t2: packet inter-arrival spread at the peer.
    pub peer_jitter: Stat,
    /// delta t4: reply inter-arrival spread locally.
    pub local_jitter: Stat,
    /// Ring-buffer fill after each push.
    pub ring_fill: Stat,
}

struct Accumulator {
    round_trip: Window,
    audio_processing: Window,
    peer_jitter: Window,
    local_jitter: Window,
    ring_fill: Window,
    prev_t2: u64,
    prev_t4: u64,
    last_flush: Instant,
}

/// Aggregates packet timings and fill levels; written by the receiver,
/// read by the control thread via [`LatencyManager::current_metrics`].
pub struct LatencyManager {
    sample_rate: u32,
    /// Expected interval between process callbacks, for the report line.
    callback_interval_ms: f64,
    /// Nominal one-way device latency, recorded for reference.
    backend_latency_ms: Mutex<f64>,
    accum: Mutex<Accumulator>,
    current: Mutex<LatencyMetrics>,
}

impl LatencyManager {
    pub fn new(sample_rate: u32, buffer_size: usize, backend_latency_ms: f64) -> Self {
        Self {
            sample_rate,
            callback_interval_ms: buffer_size as f64 / sample_rate as f64 * 1000.0,
            backend_latency_ms: Mutex::new(backend_latency_ms),
            accum: Mutex::new(Accumulator {
                round_trip: Window::default(),
                audio_processing: Window::default(),
                peer_jitter: Window::default(),
                local_jitter: Window::default(),
                ring_fill: Window::default(),
                prev_t2: 0,
                prev_t4: 0,
                last_flush: Instant::now(),
            }),
            current: Mutex::new(LatencyMetrics::default()),
        }
    }

    /// Monotonic nanoseconds; the clock every wire timestamp uses.
    pub fn timestamp_now() -> u64 {
        clock::monotonic_ns()
    }

    /// Record the device latency once the backend is constructed.
    pub fn set_backend_latency_ms(&self, ms: f64) {
        *self.backend_latency_ms.lock() = ms;
    }

    pub fn backend_latency_ms(&self) -> f64 {
        *self.backend_latency_ms.lock()
    }

    pub fn callback_interval_ms(&self) -> f64 {
        self.callback_interval_ms
    }

    /// Stamp `t4` into a freshly received reply and fold its timings into
    /// the window. Deltas that would be negative (possible only under clock
    /// misuse) are discarded, never recorded.
    pub fn process_packet(&self, pkt: &mut AudioPacket) {
        let t4 = clock::monotonic_ns();
        pkt.t4_local_recv = t4;

        let mut accum = self.accum.lock();

        if t4 >= pkt.t1_local_send {
            accum.round_trip.record((t4 - pkt.t1_local_send) as f64);
        }
        if pkt.t3_remote_send >= pkt.t2_remote_recv {
            accum
                .audio_processing
                .record((pkt.t3_remote_send - pkt.t2_remote_recv) as f64);
        }
        if accum.prev_t2 != 0 && pkt.t2_remote_recv >= accum.prev_t2 {
            let dt2 = pkt.t2_remote_recv - accum.prev_t2;
            accum.peer_jitter.record(dt2 as f64);
        }
        if accum.prev_t4 != 0 && t4 >= accum.prev_t4 {
            let dt4 = t4 - accum.prev_t4;
            accum.local_jitter.record(dt4 as f64);
        }
        accum.prev_t2 = pkt.t2_remote_recv;
        accum.prev_t4 = t4;

        self.maybe_flush(&mut accum);
    }

    /// Record the fill level (in frames) after a successful push.
    pub fn report_ring_buffer_fill(&self, frames: usize) {
        let mut accum = self.accum.lock();
        accum.ring_fill.record(frames as f64);
        self.maybe_flush(&mut accum);
    }

    /// The last flushed snapshot, in milliseconds.
    pub fn current_metrics(&self) -> LatencyMetrics {
        *self.current.lock()
    }

    fn maybe_flush(&self, accum: &mut Accumulator) {
        if accum.last_flush.elapsed() < FLUSH_INTERVAL {
            return;
        }
        self.flush(accum);
    }

    fn flush(&self, accum: &mut Accumulator) {
        const NS_TO_MS: f64 = 1e-6;
        let frames_to_ms = 1000.0 / self.sample_rate as f64;

        let metrics = LatencyMetrics {
            round_trip: accum.round_trip.snapshot(NS_TO_MS),
            audio_processing: accum.audio_processing.snapshot(NS_TO_MS),
            peer_jitter: accum.peer_jitter.snapshot(NS_TO_MS),
            local_jitter: accum.local_jitter.snapshot(NS_TO_MS),
            ring_fill: accum.ring_fill.snapshot(frames_to_ms),
        };

        log::info!(
            "latency: rtt {:.2}/{:.2}/{:.2} ms | peer dsp {:.2}/{:.2}/{:.2} ms | \
             peer jitter {:.2}/{:.2}/{:.2} ms | local jitter {:.2}/{:.2}/{:.2} ms | \
             ring fill {:.1}/{:.1}/{:.1} ms",
            metrics.round_trip.min,
            metrics.round_trip.avg,
            metrics.round_trip.max,
            metrics.audio_processing.min,
            metrics.audio_processing.avg,
            metrics.audio_processing.max,
            metrics.peer_jitter.min,
            metrics.peer_jitter.avg,
            metrics.peer_jitter.max,
            metrics.local_jitter.min,
            metrics.local_jitter.avg,
            metrics.local_jitter.max,
            metrics.ring_fill.min,
            metrics.ring_fill.avg,
            metrics.ring_fill.max,
        );

        *self.current.lock() = metrics;

        accum.round_trip = Window::default();
        accum.audio_processing = Window::default();
        accum.peer_jitter = Window::default();
        accum.local_jitter = Window::default();
        accum.ring_fill = Window::default();
        accum.last_flush = Instant::now();
    }
}
