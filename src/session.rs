//! Session lifecycle and control API.
//!
//! A [`Session`] is an explicit handle: `init` builds the whole pipeline
//! (socket, ring, receiver, backend, in that order), `start`/`stop` gate
//! the audio callback, and `cleanup` (or drop) releases everything in
//! reverse. Multiple sessions can coexist, which the tests rely on.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::backend::{self, AudioBackend, ProcessCallback};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::latency::{LatencyManager, LatencyMetrics};
use crate::net::BridgeSocket;
use crate::receiver::{self, ReceiverStats};
use crate::relay::{Relay, RelayStats};
use crate::ring::AudioRing;
use crate::CHANNELS;

/// Outcome of [`Session::update_config`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigUpdate {
    /// Runtime-mutable fields were applied in place.
    Applied,
    /// A restart-only field differs; nothing was changed.
    RestartRequired,
}

/// Metrics snapshot handed to front-ends.
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionMetrics {
    /// Five min/avg/max windows, in milliseconds.
    pub latency: LatencyMetrics,
    /// Hardware-level xruns reported by the backend.
    pub xruns: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Initialized,
    Running,
}

/// One bridge session: config, pipeline and its two real-time actors.
pub struct Session {
    config: SessionConfig,
    state: State,
    ring: Arc<AudioRing>,
    latency: Arc<LatencyManager>,
    backend: Option<Box<dyn AudioBackend>>,
    receiver: Option<JoinHandle<()>>,
    should_stop: Arc<AtomicBool>,
    passthrough: Arc<AtomicBool>,
    peer_chunk_frames: Arc<AtomicUsize>,
    relay_stats: Arc<RelayStats>,
    receiver_stats: Arc<ReceiverStats>,
}

impl Session {
    /// Build the pipeline. Any failure tears down the part that already
    /// succeeded and leaves no session behind.
    pub fn init(config: SessionConfig) -> Result<Session> {
        config.validate()?;

        // One bound socket; the relay and the receiver each get a handle.
        let socket = BridgeSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
        let recv_socket = socket.try_clone()?;

        let ring = Arc::new(AudioRing::new(
            config.ring_buffer_depth,
            CHANNELS,
            config.buffer_size,
        ));
        let latency = Arc::new(LatencyManager::new(
            config.sample_rate,
            config.buffer_size,
            0.0,
        ));

        let should_stop = Arc::new(AtomicBool::new(false));
        let peer_chunk_frames = Arc::new(AtomicUsize::new(0));
        let receiver_stats = Arc::new(ReceiverStats::default());
        let receiver = receiver::spawn(
            recv_socket,
            ring.clone(),
            latency.clone(),
            should_stop.clone(),
            peer_chunk_frames.clone(),
            receiver_stats.clone(),
        )?;

        let passthrough = Arc::new(AtomicBool::new(config.passthrough_test));
        let relay_stats = Arc::new(RelayStats::default());
        let peer_addr = SocketAddr::V4(SocketAddrV4::new(config.stream_ip, config.stream_port));
        let mut relay = Relay::new(
            socket,
            peer_addr,
            ring.clone(),
            passthrough.clone(),
            config.buffer_size,
            config.packet_size,
            relay_stats.clone(),
        );
        let callback: ProcessCallback =
            Box::new(move |input, out_left, out_right| relay.process(input, out_left, out_right));

        let backend = match backend::create(&config, callback) {
            Ok(backend) => backend,
            Err(e) => {
                // Tear down the prefix that succeeded.
                should_stop.store(true, Ordering::Relaxed);
                let _ = receiver.join();
                ring.free();
                return Err(e);
            }
        };
        latency.set_backend_latency_ms(backend.latency_ms());

        log::info!(
            "session initialized: {} backend, peer {}, {} frames/callback, {} frames/packet, ring {} frames",
            config.backend,
            peer_addr,
            config.buffer_size,
            config.packet_size,
            config.ring_buffer_depth,
        );

        Ok(Session {
            config,
            state: State::Initialized,
            ring,
            latency,
            backend: Some(backend),
            receiver: Some(receiver),
            should_stop,
            passthrough,
            peer_chunk_frames,
            relay_stats,
            receiver_stats,
        })
    }

    /// Begin audio callbacks.
    pub fn start(&mut self) -> Result<()> {
        if self.state == State::Running {
            return Err(Error::AlreadyRunning);
        }
        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| Error::Backend("backend already torn down".into()))?;
        backend.start()?;
        self.state = State::Running;
        log::info!("session started");
        Ok(())
    }

    /// Stop audio callbacks; the session stays initialized.
    pub fn stop(&mut self) -> Result<()> {
        if self.state != State::Running {
            return Err(Error::NotRunning);
        }
        if let Some(backend) = self.backend.as_mut() {
            backend.stop()?;
        }
        self.state = State::Initialized;
        log::info!("session stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.state == State::Running
            && self
                .backend
                .as_ref()
                .map(|b| b.is_running())
                .unwrap_or(false)
    }

    /// Apply runtime-mutable fields, or report that a restart is needed.
    /// Repeating the same runtime values is a no-op.
    pub fn update_config(&mut self, new: &SessionConfig) -> Result<ConfigUpdate> {
        if self.config.restart_required(new) {
            return Ok(ConfigUpdate::RestartRequired);
        }
        self.passthrough
            .store(new.passthrough_test, Ordering::Relaxed);
        self.config.passthrough_test = new.passthrough_test;
        Ok(ConfigUpdate::Applied)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Latest two-second latency snapshot plus the backend xrun count.
    pub fn metrics(&self) -> SessionMetrics {
        SessionMetrics {
            latency: self.latency.current_metrics(),
            xruns: self.backend.as_ref().map(|b| b.xruns()).unwrap_or(0),
        }
    }

    /// Chunk size (frames) of the most recent reply from the peer.
    pub fn current_peer_buffer_size(&self) -> usize {
        self.peer_chunk_frames.load(Ordering::Relaxed)
    }

    /// Release everything: backend first (its stop joins the audio
    /// thread), then the receiver, then the ring. Equivalent to drop, but
    /// explicit.
    pub fn cleanup(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.state == State::Running {
            if let Some(backend) = self.backend.as_mut() {
                let _ = backend.stop();
            }
            self.state = State::Initialized;
        }
        let xruns = self.backend.as_ref().map(|b| b.xruns()).unwrap_or(0);
        // Dropping the backend drops the relay and with it the send socket.
        self.backend = None;

        self.should_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.receiver.take() {
            let _ = handle.join();
        }

        log::info!(
            "session summary: {} packets sent ({} send errors), {} received, {} invalid, \
             {} xruns, {} overruns, {} underruns",
            self.relay_stats.packets_sent.load(Ordering::Relaxed),
            self.relay_stats.send_errors.load(Ordering::Relaxed),
            self.receiver_stats.packets_received.load(Ordering::Relaxed),
            self.receiver_stats.invalid_datagrams.load(Ordering::Relaxed),
            xruns,
            self.ring.overruns().unwrap_or(0),
            self.ring.underruns().unwrap_or(0),
        );

        self.ring.free();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.backend.is_some() || self.receiver.is_some() {
            self.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use crate::peer::LoopbackPeer;
    use crate::wire::PACKET_SIZE;
    use std::thread;
    use std::time::Duration;

    fn local() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    }

    fn sim_config(peer: &LoopbackPeer, ring_depth: usize) -> SessionConfig {
        SessionConfig {
            backend: BackendKind::Simulated,
            stream_ip: Ipv4Addr::LOCALHOST,
            stream_port: peer.local_addr().port(),
            buffer_size: 64,
            packet_size: 64,
            ring_buffer_depth: ring_depth,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_lifecycle_against_loopback_peer() {
        let peer = LoopbackPeer::spawn(local()).unwrap();
        let mut session = Session::init(sim_config(&peer, 1024)).unwrap();
        assert!(!session.is_running());

        session.start().unwrap();
        assert!(session.is_running());
        assert!(matches!(session.start(), Err(Error::AlreadyRunning)));

        thread::sleep(Duration::from_millis(300));

        // Replies flowed back: the receiver saw the peer's chunk size.
        assert_eq!(session.current_peer_buffer_size(), 64);
        assert!(
            session
                .receiver_stats
                .packets_received
                .load(Ordering::Relaxed)
                > 50
        );
        assert_eq!(session.metrics().xruns, 0);

        session.stop().unwrap();
        assert!(!session.is_running());
        assert!(matches!(session.stop(), Err(Error::NotRunning)));

        // stop -> start is a legal transition.
        session.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        session.stop().unwrap();
        session.cleanup();
    }

    #[test]
    fn test_update_config_runtime_vs_restart() {
        let peer = LoopbackPeer::spawn(local()).unwrap();
        let mut session = Session::init(sim_config(&peer, 1024)).unwrap();

        let mut runtime = session.config().clone();
        runtime.passthrough_test = true;
        assert_eq!(
            session.update_config(&runtime).unwrap(),
            ConfigUpdate::Applied
        );
        assert!(session.config().passthrough_test);
        // Same runtime values again: a no-op.
        assert_eq!(
            session.update_config(&runtime).unwrap(),
            ConfigUpdate::Applied
        );
        assert!(session.config().passthrough_test);

        let mut restart = session.config().clone();
        restart.ring_buffer_depth *= 2;
        assert_eq!(
            session.update_config(&restart).unwrap(),
            ConfigUpdate::RestartRequired
        );
        // Nothing changed.
        assert_ne!(
            session.config().ring_buffer_depth,
            restart.ring_buffer_depth
        );
    }

    #[test]
    fn test_init_rejects_invalid_config() {
        let peer = LoopbackPeer::spawn(local()).unwrap();
        let mut config = sim_config(&peer, 1024);
        config.packet_size = 63; // not a multiple, and odd chunk
        assert!(matches!(Session::init(config), Err(Error::Config(_))));
    }

    /// End-to-end echo: everything the session wires up, driven by hand so
    /// the output content can be asserted sample for sample.
    #[test]
    fn test_echo_content_survives_the_roundtrip() {
        let peer = LoopbackPeer::spawn(local()).unwrap();

        let socket = BridgeSocket::bind(local()).unwrap();
        let recv_socket = socket.try_clone().unwrap();
        let ring = Arc::new(AudioRing::new(256, CHANNELS, 64));
        let latency = Arc::new(LatencyManager::new(48000, 64, 0.0));
        let should_stop = Arc::new(AtomicBool::new(false));
        let peer_chunk = Arc::new(AtomicUsize::new(0));
        let rx_stats = Arc::new(ReceiverStats::default());
        let _rx = receiver::spawn(
            recv_socket,
            ring.clone(),
            latency.clone(),
            should_stop.clone(),
            peer_chunk.clone(),
            rx_stats.clone(),
        )
        .unwrap();

        let mut relay = Relay::new(
            socket,
            peer.local_addr(),
            ring.clone(),
            Arc::new(AtomicBool::new(false)),
            64,
            64,
            Arc::new(RelayStats::default()),
        );

        let steps = 40;
        let mut sent = Vec::new();
        let mut collected = Vec::new();
        let mut out_l = [0.0f32; 64];
        let mut out_r = [0.0f32; 64];
        for step in 0..steps {
            let input: Vec<f32> = (0..64)
                .map(|i| 1.0 + (step * 64 + i) as f32 * 0.001)
                .collect();
            sent.extend_from_slice(&input);
            relay.process(&input, &mut out_l, &mut out_r);
            collected.extend_from_slice(&out_l);
            // Let the echo land before the next callback.
            thread::sleep(Duration::from_millis(5));
        }

        should_stop.store(true, Ordering::Relaxed);

        // The ring was prefilled with 256 frames of silence, so the echo
        // appears after exactly four 64-frame buffers of zeros.
        let prefill = 256;
        assert!(collected[..prefill].iter().all(|&s| s == 0.0));
        let echoed = &collected[prefill..];
        assert_eq!(echoed, &sent[..sent.len() - prefill]);
    }

    /// Losing a burst of packets costs one silent buffer and one underrun,
    /// then the bridge recovers on its own.
    #[test]
    fn test_packet_loss_burst_recovers_with_one_underrun() {
        let peer = LoopbackPeer::spawn(local()).unwrap();
        let mut session = Session::init(sim_config(&peer, 256)).unwrap();
        session.start().unwrap();

        thread::sleep(Duration::from_millis(300));
        let underruns_before = session.ring.underruns().unwrap();
        let received_before = session
            .receiver_stats
            .packets_received
            .load(Ordering::Relaxed);
        assert!(received_before > 0);

        // Peer swallows 5 consecutive packets: a 320-frame hole against a
        // 256-frame ring. One hard reset covers the whole burst.
        peer.drop_next(5);
        thread::sleep(Duration::from_millis(300));

        let underruns_after = session.ring.underruns().unwrap();
        assert!(underruns_after > underruns_before);

        // Audio resumed: replies keep arriving and the session is healthy.
        let received_mid = session
            .receiver_stats
            .packets_received
            .load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(200));
        let received_end = session
            .receiver_stats
            .packets_received
            .load(Ordering::Relaxed);
        assert!(received_end > received_mid);
        assert!(session.is_running());

        session.stop().unwrap();
        session.cleanup();
    }

    #[test]
    fn test_passthrough_session_sends_nothing() {
        let peer = LoopbackPeer::spawn(local()).unwrap();
        let mut config = sim_config(&peer, 1024);
        config.passthrough_test = true;
        let mut session = Session::init(config).unwrap();
        session.start().unwrap();
        thread::sleep(Duration::from_millis(200));

        assert_eq!(
            session.relay_stats.packets_sent.load(Ordering::Relaxed),
            0
        );
        // Nothing was sent, so nothing came back.
        assert_eq!(
            session
                .receiver_stats
                .packets_received
                .load(Ordering::Relaxed),
            0
        );
        session.stop().unwrap();
    }

    #[test]
    fn test_two_sessions_coexist() {
        let peer_a = LoopbackPeer::spawn(local()).unwrap();
        let peer_b = LoopbackPeer::spawn(local()).unwrap();
        let mut a = Session::init(sim_config(&peer_a, 1024)).unwrap();
        let mut b = Session::init(sim_config(&peer_b, 1024)).unwrap();

        a.start().unwrap();
        b.start().unwrap();
        thread::sleep(Duration::from_millis(200));
        assert!(a.is_running());
        assert!(b.is_running());
        assert!(a.relay_stats.packets_sent.load(Ordering::Relaxed) > 0);
        assert!(b.relay_stats.packets_sent.load(Ordering::Relaxed) > 0);

        a.stop().unwrap();
        b.stop().unwrap();
    }

    #[test]
    fn test_session_survives_peer_side_noise() {
        let peer = LoopbackPeer::spawn(local()).unwrap();
        let mut session = Session::init(sim_config(&peer, 1024)).unwrap();
        session.start().unwrap();
        thread::sleep(Duration::from_millis(100));

        // Garbage datagrams at the peer must not disturb the stream.
        let noise = BridgeSocket::bind(local()).unwrap();
        noise.send_to(&[0u8; 10], peer.local_addr()).unwrap();
        noise
            .send_to(&[0u8; PACKET_SIZE - 1], peer.local_addr())
            .unwrap();

        let received_before = session
            .receiver_stats
            .packets_received
            .load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(100));
        let received_after = session
            .receiver_stats
            .packets_received
            .load(Ordering::Relaxed);
        assert!(received_after > received_before);
        assert!(session.is_running());
        session.stop().unwrap();
    }
}
