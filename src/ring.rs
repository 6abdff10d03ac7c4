//! Audio ring buffer between the network receiver and the audio callback.
//!
//! Bounded queue of interleaved PCM frames. Created fully prefilled with
//! silence so the consumer has a full buffer of safety margin before the
//! network producer delivers anything. An underrun hands out silence and
//! re-prefills the whole buffer, restoring that margin in one step instead
//! of letting the consumer starve repeatedly while the producer catches up.
//! An overrun drops the oldest frames so the freshest audio survives.

use parking_lot::Mutex;

use crate::error::{Error, Result};

struct RingState {
    /// `depth * channels` interleaved sample slots.
    buf: Vec<f32>,
    depth: usize,
    channels: usize,
    /// Nominal frames consumed per callback; kept for diagnostics.
    expected_buffer_size: usize,
    write_index: usize,
    read_index: usize,
    /// Readable frames, 0..=depth.
    available: usize,
    overruns: u64,
    underruns: u64,
}

impl RingState {
    fn new(depth: usize, channels: usize, expected_buffer_size: usize) -> Self {
        Self {
            buf: vec![0.0; depth * channels],
            depth,
            channels,
            expected_buffer_size,
            write_index: 0,
            read_index: 0,
            available: depth,
            overruns: 0,
            underruns: 0,
        }
    }

    /// Zero everything and restore the full prefill margin.
    fn prefill(&mut self) {
        self.buf.fill(0.0);
        self.write_index = 0;
        self.read_index = 0;
        self.available = self.depth;
    }
}

/// Bounded interleaved PCM queue; the single point of shared state between
/// the receiver thread (sole producer) and the audio callback (sole
/// consumer). All operations take one mutex for their duration.
pub struct AudioRing {
    state: Mutex<Option<RingState>>,
}

impl AudioRing {
    /// Allocate a ring of `depth` frames, prefilled with silence
    /// (`available == depth`).
    pub fn new(depth: usize, channels: usize, expected_buffer_size: usize) -> Self {
        Self {
            state: Mutex::new(Some(RingState::new(depth, channels, expected_buffer_size))),
        }
    }

    /// Re-initialize. A prior buffer, if any, is freed first; stats reset.
    pub fn init(&self, depth: usize, channels: usize, expected_buffer_size: usize) {
        *self.state.lock() = Some(RingState::new(depth, channels, expected_buffer_size));
    }

    /// Release the storage. Subsequent operations fail with
    /// [`Error::RingNotInitialized`] until `init` is called again.
    pub fn free(&self) {
        *self.state.lock() = None;
    }

    /// Append `n_samples` frames from `src` (interleaved, `channels` wide).
    ///
    /// When the free space is short, the oldest frames are dropped to make
    /// room and `overruns` is incremented once for the whole push; the most
    /// recent frames always survive.
    pub fn push(&self, src: &[f32], n_samples: usize, channels: usize) -> Result<()> {
        let mut guard = self.state.lock();
        let st = guard.as_mut().ok_or(Error::RingNotInitialized)?;

        if channels != st.channels {
            return Err(Error::ChannelMismatch {
                got: channels,
                configured: st.channels,
            });
        }
        if n_samples == 0 {
            return Ok(());
        }
        debug_assert!(src.len() >= n_samples * channels);

        let free = st.depth - st.available;
        if n_samples > free {
            let deficit = (n_samples - free).min(st.available);
            st.read_index = (st.read_index + deficit) % st.depth;
            st.available -= deficit;
            st.overruns += 1;
        }

        for frame in 0..n_samples {
            let dst = ((st.write_index + frame) % st.depth) * channels;
            let s = frame * channels;
            st.buf[dst..dst + channels].copy_from_slice(&src[s..s + channels]);
        }
        st.write_index = (st.write_index + n_samples) % st.depth;
        st.available = (st.available + n_samples).min(st.depth);
        if n_samples > st.depth {
            // The push lapped the whole ring; only the tail survives.
            st.read_index = st.write_index;
        }

        Ok(())
    }

    /// Copy `n_samples` frames into `dst` and consume them.
    ///
    /// When fewer frames are available, the full request is served as
    /// silence, `underruns` is incremented once, and the ring is hard-reset
    /// to the prefilled state. Returns the frames written to `dst`.
    pub fn pop(&self, dst: &mut [f32], n_samples: usize, channels: usize) -> Result<usize> {
        let mut guard = self.state.lock();
        let st = guard.as_mut().ok_or(Error::RingNotInitialized)?;

        if channels != st.channels {
            return Err(Error::ChannelMismatch {
                got: channels,
                configured: st.channels,
            });
        }
        if n_samples == 0 {
            return Ok(0);
        }
        debug_assert!(dst.len() >= n_samples * channels);

        if n_samples > st.available {
            dst[..n_samples * channels].fill(0.0);
            st.underruns += 1;
            st.prefill();
            return Ok(n_samples);
        }

        for frame in 0..n_samples {
            let src = ((st.read_index + frame) % st.depth) * channels;
            let d = frame * channels;
            dst[d..d + channels].copy_from_slice(&st.buf[src..src + channels]);
        }
        st.read_index = (st.read_index + n_samples) % st.depth;
        st.available -= n_samples;

        Ok(n_samples)
    }

    /// Readable frames.
    pub fn available(&self) -> Result<usize> {
        self.with_state(|st| st.available)
    }

    /// Capacity in frames.
    pub fn depth(&self) -> Result<usize> {
        self.with_state(|st| st.depth)
    }

    /// Nominal per-callback consumption this ring was sized for.
    pub fn expected_buffer_size(&self) -> Result<usize> {
        self.with_state(|st| st.expected_buffer_size)
    }

    /// Pushes that had to drop old frames.
    pub fn overruns(&self) -> Result<u64> {
        self.with_state(|st| st.overruns)
    }

    /// Pops that came up short and triggered a hard reset.
    pub fn underruns(&self) -> Result<u64> {
        self.with_state(|st| st.underruns)
    }

    /// Zero both event counters; audio content is untouched.
    pub fn reset_stats(&self) -> Result<()> {
        self.with_state(|st| {
            st.overruns = 0;
            st.underruns = 0;
        })
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut RingState) -> T) -> Result<T> {
        let mut guard = self.state.lock();
        let st = guard.as_mut().ok_or(Error::RingNotInitialized)?;
        Ok(f(st))
    }
}
