//! Relay core: the process callback of the bridge.
//!
//! Each invocation stages the captured chunk into the outbound packet,
//! ships the packet once it holds a full `packet_size` worth of frames,
//! and feeds the output lanes from the ring buffer. Nothing here blocks
//! beyond the single `sendto` and the one ring-buffer pop; nothing here
//! allocates.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock;
use crate::net::BridgeSocket;
use crate::ring::AudioRing;
use crate::wire::{AudioPacket, PACKET_SIZE};
use crate::{CHANNELS, MAX_CHUNK};

/// Outbound counters, shared with the session for the shutdown summary.
#[derive(Debug, Default)]
pub struct RelayStats {
    pub packets_sent: AtomicU64,
    pub send_errors: AtomicU64,
}

/// Owns the send socket and the outbound staging state; lives on the
/// audio thread inside the backend's process callback.
pub struct Relay {
    socket: BridgeSocket,
    peer_addr: SocketAddr,
    ring: Arc<AudioRing>,
    passthrough: Arc<AtomicBool>,
    stats: Arc<RelayStats>,
    staging: AudioPacket,
    staged_frames: usize,
    packet_frames: usize,
    wire_buf: [u8; PACKET_SIZE],
    pop_buf: Vec<f32>,
}

impl Relay {
    pub fn new(
        socket: BridgeSocket,
        peer_addr: SocketAddr,
        ring: Arc<AudioRing>,
        passthrough: Arc<AtomicBool>,
        device_frames: usize,
        packet_frames: usize,
        stats: Arc<RelayStats>,
    ) -> Self {
        debug_assert!(packet_frames <= MAX_CHUNK);
        debug_assert!(packet_frames % device_frames == 0);
        Self {
            socket,
            peer_addr,
            ring,
            passthrough,
            stats,
            staging: AudioPacket::new(packet_frames as u16),
            staged_frames: 0,
            packet_frames,
            wire_buf: [0; PACKET_SIZE],
            pop_buf: vec![0.0; device_frames * CHANNELS],
        }
    }

    /// One backend invocation: mono input in, two output lanes out.
    pub fn process(&mut self, input: &[f32], out_left: &mut [f32], out_right: &mut [f32]) {
        let frames = input.len();
        debug_assert_eq!(out_left.len(), frames);
        debug_assert_eq!(out_right.len(), frames);

        if self.passthrough.load(Ordering::Relaxed) {
            out_left.copy_from_slice(input);
            out_right.copy_from_slice(input);
            return;
        }

        // Duplicate the mono capture into both interleaved stereo lanes.
        debug_assert!(self.staged_frames + frames <= MAX_CHUNK);
        for (i, &s) in input.iter().enumerate() {
            let at = (self.staged_frames + i) * CHANNELS;
            self.staging.samples[at] = s;
            self.staging.samples[at + 1] = s;
        }
        self.staged_frames += frames;

        if self.staged_frames >= self.packet_frames {
            self.staging.n_samples = self.packet_frames as u16;
            self.staging.t1_local_send = clock::monotonic_ns();
            self.staging.write_into(&mut self.wire_buf);
            match self.socket.send_to(&self.wire_buf, self.peer_addr) {
                Ok(_) => {
                    self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                    log::warn!("send to {} failed: {e}", self.peer_addr);
                }
            }
            self.staged_frames = 0;
        }

        // One pop per callback; underruns are resolved inside the ring.
        match self.ring.pop(&mut self.pop_buf, frames, CHANNELS) {
            Ok(_) => {
                for i in 0..frames {
                    out_left[i] = self.pop_buf[i * CHANNELS];
                    out_right[i] = self.pop_buf[i * CHANNELS + 1];
                }
            }
            Err(_) => {
                out_left.fill(0.0);
                out_right.fill(0.0);
            }
        }
    }
}
