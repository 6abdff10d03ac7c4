//! pwar: low-latency bidirectional PCM audio bridge over UDP.
//!
//! A Linux host captures audio locally, ships it to a remote peer for
//! processing or monitoring, and plays back the audio the peer returns,
//! with round-trip delays on the order of a few buffer periods.
//!
//! ## Modules
//!
//! - **wire**: fixed-layout packet carrying one PCM chunk and four timestamps
//! - **ring**: mutex-protected PCM ring buffer decoupling network and audio
//! - **latency**: four-point timing and fill-level accounting
//! - **backend**: ALSA, PipeWire and simulated audio drivers behind one trait
//! - **relay** / **receiver**: the two real-time halves of the bridge
//! - **session**: lifecycle state machine and control API
//! - **peer**: loopback peer implementing the reply side of the wire contract

pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod latency;
pub mod net;
pub mod peer;
pub mod receiver;
pub mod relay;
pub mod ring;
pub mod rt;
pub mod session;
pub mod wire;

pub use config::{BackendKind, SessionConfig};
pub use error::{Error, Result};
pub use latency::{LatencyManager, LatencyMetrics, Stat};
pub use ring::AudioRing;
pub use session::{ConfigUpdate, Session, SessionMetrics};
pub use wire::AudioPacket;

// ============================================================================
// Protocol Constants
// ============================================================================

/// Interleaved channel count carried on the wire and in the ring buffer.
pub const CHANNELS: usize = 2;

/// Smallest chunk (in frames) a packet may carry and still be relayed.
pub const MIN_CHUNK: usize = 32;

/// Largest chunk (in frames) a single packet can carry.
pub const MAX_CHUNK: usize = 128;

/// Default UDP port the remote peer listens on.
pub const DEFAULT_PORT: u16 = 8321;
