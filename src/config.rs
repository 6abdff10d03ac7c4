//! Session configuration and validation.

use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::{DEFAULT_PORT, MAX_CHUNK, MIN_CHUNK};

/// Which audio driver backs the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// Direct ALSA capture/playback on a dedicated real-time thread.
    Alsa,
    /// PipeWire streams driven by the PipeWire DSP thread.
    Pipewire,
    /// Synthetic test-tone driver, no hardware required.
    Simulated,
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "alsa" => Ok(BackendKind::Alsa),
            "pipewire" => Ok(BackendKind::Pipewire),
            "simulated" => Ok(BackendKind::Simulated),
            other => Err(Error::Config(format!(
                "unknown backend '{other}' (expected alsa, pipewire or simulated)"
            ))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Alsa => write!(f, "alsa"),
            BackendKind::Pipewire => write!(f, "pipewire"),
            BackendKind::Simulated => write!(f, "simulated"),
        }
    }
}

/// Bridge session configuration.
///
/// `passthrough_test` may be changed on a live session; every other field
/// requires a restart (see [`SessionConfig::restart_required`]).
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Audio driver variant.
    pub backend: BackendKind,
    /// Remote peer IPv4 address.
    pub stream_ip: Ipv4Addr,
    /// Remote peer UDP port.
    pub stream_port: u16,
    /// Sample rate in Hz, agreed with the peer.
    pub sample_rate: u32,
    /// Frames delivered to the process callback per invocation.
    pub buffer_size: usize,
    /// Frames per wire packet; a multiple of `buffer_size`.
    pub packet_size: usize,
    /// Ring buffer capacity in frames.
    pub ring_buffer_depth: usize,
    /// Bypass the network and copy input straight to output.
    pub passthrough_test: bool,
    /// ALSA capture device name.
    pub capture_device: String,
    /// ALSA playback device name.
    pub playback_device: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Pipewire,
            stream_ip: Ipv4Addr::LOCALHOST,
            stream_port: DEFAULT_PORT,
            sample_rate: 48000,
            buffer_size: 64,
            packet_size: 64,
            ring_buffer_depth: 1024,
            passthrough_test: false,
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
        }
    }
}

impl SessionConfig {
    /// Validate the configuration. Called by `Session::init`.
    pub fn validate(&self) -> Result<()> {
        if self.stream_port == 0 {
            return Err(Error::Config("stream port must be nonzero".into()));
        }
        if self.sample_rate < 8000 || self.sample_rate > 192_000 {
            return Err(Error::Config(format!(
                "sample rate {} out of range 8000..=192000",
                self.sample_rate
            )));
        }
        if self.buffer_size == 0 {
            return Err(Error::Config("device buffer must be nonzero".into()));
        }
        if self.packet_size < MIN_CHUNK || self.packet_size > MAX_CHUNK {
            return Err(Error::Config(format!(
                "packet buffer {} out of range {MIN_CHUNK}..={MAX_CHUNK} frames",
                self.packet_size
            )));
        }
        if self.packet_size % self.buffer_size != 0 {
            return Err(Error::Config(format!(
                "packet buffer {} is not a multiple of device buffer {}",
                self.packet_size, self.buffer_size
            )));
        }
        if self.ring_buffer_depth < MAX_CHUNK || self.ring_buffer_depth < self.buffer_size * 2 {
            return Err(Error::Config(format!(
                "ring depth {} too small (need at least {MAX_CHUNK} and twice the device buffer)",
                self.ring_buffer_depth
            )));
        }
        Ok(())
    }

    /// True when switching to `new` needs a session restart.
    ///
    /// Only `passthrough_test` is runtime-mutable.
    pub fn restart_required(&self, new: &SessionConfig) -> bool {
        self.backend != new.backend
            || self.stream_ip != new.stream_ip
            || self.stream_port != new.stream_port
            || self.sample_rate != new.sample_rate
            || self.buffer_size != new.buffer_size
            || self.packet_size != new.packet_size
            || self.ring_buffer_depth != new.ring_buffer_depth
            || self.capture_device != new.capture_device
            || self.playback_device != new.playback_device
    }

    /// Nominal callback interval in milliseconds.
    pub fn callback_interval_ms(&self) -> f64 {
        self.buffer_size as f64 / self.sample_rate as f64 * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("alsa".parse::<BackendKind>().unwrap(), BackendKind::Alsa);
        assert_eq!(
            "pipewire".parse::<BackendKind>().unwrap(),
            BackendKind::Pipewire
        );
        assert_eq!(
            "simulated".parse::<BackendKind>().unwrap(),
            BackendKind::Simulated
        );
        assert!("jack".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_packet_must_be_multiple_of_buffer() {
        let mut config = SessionConfig::default();
        config.buffer_size = 48;
        config.packet_size = 64;
        assert!(config.validate().is_err());

        config.buffer_size = 32;
        config.packet_size = 128;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_chunk_bounds() {
        let mut config = SessionConfig::default();
        config.buffer_size = 16;
        config.packet_size = 16;
        assert!(config.validate().is_err()); // below MIN_CHUNK

        config.buffer_size = 256;
        config.packet_size = 256;
        assert!(config.validate().is_err()); // above MAX_CHUNK
    }

    #[test]
    fn test_restart_required_fields() {
        let base = SessionConfig::default();

        let mut runtime = base.clone();
        runtime.passthrough_test = true;
        assert!(!base.restart_required(&runtime));

        let mut restart = base.clone();
        restart.stream_port = 9000;
        assert!(base.restart_required(&restart));

        let mut restart = base.clone();
        restart.ring_buffer_depth = 2048;
        assert!(base.restart_required(&restart));

        let mut restart = base.clone();
        restart.backend = BackendKind::Simulated;
        assert!(base.restart_required(&restart));
    }
}
