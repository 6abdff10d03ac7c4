//! Error type shared across the bridge.

use thiserror::Error;

/// Errors surfaced by lifecycle operations.
///
/// Transient conditions (send failures, malformed datagrams, xruns) are
/// handled where they occur and never reach this type.
#[derive(Debug, Error)]
pub enum Error {
    /// Rejected configuration; the session stays uninitialized.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Socket or thread creation failure during init.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Audio backend failure (device open, stream setup, start/stop).
    #[error("audio backend: {0}")]
    Backend(String),

    /// Operation on a ring buffer whose storage has been freed.
    #[error("ring buffer is not initialized")]
    RingNotInitialized,

    /// Push/pop with a channel count other than the ring was built with.
    #[error("channel count mismatch: got {got}, configured {configured}")]
    ChannelMismatch { got: usize, configured: usize },

    /// `start` on a session that is already running.
    #[error("already running")]
    AlreadyRunning,

    /// `stop` on a session that is not running.
    #[error("not running")]
    NotRunning,
}

pub type Result<T> = std::result::Result<T, Error>;
