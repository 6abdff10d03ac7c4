//! Wire packet: one PCM chunk plus four monotonic timestamps per datagram.
//!
//! The packet is always transmitted at its full size; slots past
//! `n_samples` frames are ignored by the receiver. Fields are packed
//! native-endian: the protocol is LAN-local between peers built from the
//! same layout and is not defined cross-endian.

use crate::{CHANNELS, MAX_CHUNK, MIN_CHUNK};

/// Interleaved sample slots in every packet.
pub const MAX_SAMPLES: usize = CHANNELS * MAX_CHUNK;

const TIMESTAMPS_OFFSET: usize = 8;
const SAMPLES_OFFSET: usize = TIMESTAMPS_OFFSET + 4 * 8;

/// Size in bytes of every datagram on the wire.
pub const PACKET_SIZE: usize = SAMPLES_OFFSET + MAX_SAMPLES * 4;

/// A single audio chunk in flight.
///
/// Timestamps are monotonic nanoseconds on whichever host wrote them:
/// `t1`/`t4` on the bridge host, `t2`/`t3` on the peer. On a correct round
/// trip `t1 <= t2 <= t3 <= t4` holds per-host; deltas are only ever taken
/// between timestamps written by the same clock.
#[derive(Clone, Copy)]
pub struct AudioPacket {
    /// PCM frames carried in this packet (MIN_CHUNK..=MAX_CHUNK).
    pub n_samples: u16,
    /// Stamped by the bridge just before the datagram is sent.
    pub t1_local_send: u64,
    /// Stamped by the peer on receipt.
    pub t2_remote_recv: u64,
    /// Stamped by the peer just before the reply is sent.
    pub t3_remote_send: u64,
    /// Stamped by the bridge when the reply arrives.
    pub t4_local_recv: u64,
    /// Interleaved f32 PCM; only the first `n_samples * CHANNELS` are defined.
    pub samples: [f32; MAX_SAMPLES],
}

impl AudioPacket {
    /// An all-zero packet carrying `n_samples` frames of silence.
    pub fn new(n_samples: u16) -> Self {
        Self {
            n_samples,
            t1_local_send: 0,
            t2_remote_recv: 0,
            t3_remote_send: 0,
            t4_local_recv: 0,
            samples: [0.0; MAX_SAMPLES],
        }
    }

    /// Serialize into a full-size wire buffer.
    pub fn write_into(&self, buf: &mut [u8; PACKET_SIZE]) {
        buf[0..2].copy_from_slice(&self.n_samples.to_ne_bytes());
        buf[2..TIMESTAMPS_OFFSET].fill(0);

        let ts = [
            self.t1_local_send,
            self.t2_remote_recv,
            self.t3_remote_send,
            self.t4_local_recv,
        ];
        for (i, t) in ts.iter().enumerate() {
            let at = TIMESTAMPS_OFFSET + i * 8;
            buf[at..at + 8].copy_from_slice(&t.to_ne_bytes());
        }

        for (i, s) in self.samples.iter().enumerate() {
            let at = SAMPLES_OFFSET + i * 4;
            buf[at..at + 4].copy_from_slice(&s.to_ne_bytes());
        }
    }

    /// Parse a datagram. Returns `None` unless the length is exactly
    /// [`PACKET_SIZE`] and the chunk size is within relay bounds.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() != PACKET_SIZE {
            return None;
        }

        let n_samples = u16::from_ne_bytes([data[0], data[1]]);
        if (n_samples as usize) < MIN_CHUNK || (n_samples as usize) > MAX_CHUNK {
            return None;
        }

        let mut ts = [0u64; 4];
        for (i, t) in ts.iter_mut().enumerate() {
            let at = TIMESTAMPS_OFFSET + i * 8;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[at..at + 8]);
            *t = u64::from_ne_bytes(raw);
        }

        let mut samples = [0.0f32; MAX_SAMPLES];
        for (i, s) in samples.iter_mut().enumerate() {
            let at = SAMPLES_OFFSET + i * 4;
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&data[at..at + 4]);
            *s = f32::from_ne_bytes(raw);
        }

        Some(Self {
            n_samples,
            t1_local_send: ts[0],
            t2_remote_recv: ts[1],
            t3_remote_send: ts[2],
            t4_local_recv: ts[3],
            samples,
        })
    }

    /// Interleaved samples actually carried by this packet.
    pub fn payload(&self) -> &[f32] {
        &self.samples[..self.n_samples as usize * CHANNELS]
    }
}

impl std::fmt::Debug for AudioPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioPacket")
            .field("n_samples", &self.n_samples)
            .field("t1_local_send", &self.t1_local_send)
            .field("t2_remote_recv", &self.t2_remote_recv)
            .field("t3_remote_send", &self.t3_remote_send)
            .field("t4_local_recv", &self.t4_local_recv)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_roundtrip() {
        let mut pkt = AudioPacket::new(64);
        pkt.t1_local_send = 1_000;
        pkt.t2_remote_recv = 2_000;
        pkt.t3_remote_send = 3_000;
        pkt.t4_local_recv = 4_000;
        for i in 0..64 * CHANNELS {
            pkt.samples[i] = i as f32 * 0.125;
        }

        let mut buf = [0u8; PACKET_SIZE];
        pkt.write_into(&mut buf);

        let parsed = AudioPacket::parse(&buf).unwrap();
        assert_eq!(parsed.n_samples, 64);
        assert_eq!(parsed.t1_local_send, 1_000);
        assert_eq!(parsed.t2_remote_recv, 2_000);
        assert_eq!(parsed.t3_remote_send, 3_000);
        assert_eq!(parsed.t4_local_recv, 4_000);
        assert_eq!(parsed.payload(), pkt.payload());
    }

    #[test]
    fn test_rejects_wrong_length() {
        let buf = [0u8; PACKET_SIZE];
        assert!(AudioPacket::parse(&buf[..PACKET_SIZE - 1]).is_none());

        let long = [0u8; PACKET_SIZE + 1];
        assert!(AudioPacket::parse(&long).is_none());
    }

    #[test]
    fn test_rejects_chunk_out_of_bounds() {
        let mut buf = [0u8; PACKET_SIZE];

        AudioPacket::new(MIN_CHUNK as u16 - 1).write_into(&mut buf);
        assert!(AudioPacket::parse(&buf).is_none());

        AudioPacket::new(MAX_CHUNK as u16 + 1).write_into(&mut buf);
        assert!(AudioPacket::parse(&buf).is_none());

        AudioPacket::new(MIN_CHUNK as u16).write_into(&mut buf);
        assert!(AudioPacket::parse(&buf).is_some());

        AudioPacket::new(MAX_CHUNK as u16).write_into(&mut buf);
        assert!(AudioPacket::parse(&buf).is_some());
    }

    #[test]
    fn test_payload_is_bounded_by_chunk() {
        let pkt = AudioPacket::new(MIN_CHUNK as u16);
        assert_eq!(pkt.payload().len(), MIN_CHUNK * CHANNELS);
    }
}
