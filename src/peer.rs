//! Loopback peer: the reply side of the wire contract.
//!
//! On receipt of a valid packet the peer stamps `t2`, leaves the audio and
//! `t1` untouched, stamps `t3` just before replying, and sends the packet
//! back to the datagram's source address. This is the identity peer the
//! simulator and the end-to-end tests run against; a processing peer obeys
//! the same contract with transformed audio.

use std::io::{self, BufRead, BufReader, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::clock;
use crate::net::BridgeSocket;
use crate::wire::{AudioPacket, PACKET_SIZE};

/// Identity echo peer on its own thread.
pub struct LoopbackPeer {
    local_addr: SocketAddr,
    should_stop: Arc<AtomicBool>,
    drop_replies: Arc<AtomicBool>,
    drop_budget: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl LoopbackPeer {
    /// Bind `addr` (port 0 = auto) and start echoing.
    pub fn spawn(addr: SocketAddr) -> io::Result<Self> {
        let socket = BridgeSocket::bind(addr)?;
        let local_addr = socket.local_addr();
        let should_stop = Arc::new(AtomicBool::new(false));
        let drop_replies = Arc::new(AtomicBool::new(false));
        let drop_budget = Arc::new(AtomicU64::new(0));

        let stop = should_stop.clone();
        let drop_flag = drop_replies.clone();
        let budget = drop_budget.clone();
        let thread = thread::Builder::new()
            .name("pwar-peer".into())
            .spawn(move || run(socket, stop, drop_flag, budget))?;

        Ok(Self {
            local_addr,
            should_stop,
            drop_replies,
            drop_budget,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Swallow incoming packets instead of replying; simulates loss.
    pub fn set_drop_replies(&self, drop: bool) {
        self.drop_replies.store(drop, Ordering::Relaxed);
    }

    /// Swallow exactly the next `n` packets, then resume replying.
    pub fn drop_next(&self, n: u64) {
        self.drop_budget.store(n, Ordering::Relaxed);
    }
}

impl Drop for LoopbackPeer {
    fn drop(&mut self) {
        self.should_stop.store(true, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

fn run(
    socket: BridgeSocket,
    should_stop: Arc<AtomicBool>,
    drop_replies: Arc<AtomicBool>,
    drop_budget: Arc<AtomicU64>,
) {
    let mut buf = [0u8; PACKET_SIZE + 1];
    let mut wire = [0u8; PACKET_SIZE];

    loop {
        match socket.recv_from(&mut buf) {
            Ok((len, src)) if len == PACKET_SIZE => {
                if let Some(mut pkt) = AudioPacket::parse(&buf[..PACKET_SIZE]) {
                    pkt.t2_remote_recv = clock::monotonic_ns();
                    if drop_replies.load(Ordering::Relaxed) {
                        continue;
                    }
                    if drop_budget.load(Ordering::Relaxed) > 0 {
                        drop_budget.fetch_sub(1, Ordering::Relaxed);
                        continue;
                    }
                    // Identity processing; t1 and the audio pass through.
                    pkt.t3_remote_send = clock::monotonic_ns();
                    pkt.write_into(&mut wire);
                    if let Err(e) = socket.send_to(&wire, src) {
                        log::warn!("peer reply to {src} failed: {e}");
                    }
                }
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(e) => {
                if !should_stop.load(Ordering::Relaxed) {
                    log::warn!("peer receive error: {e}");
                }
            }
        }

        if should_stop.load(Ordering::Relaxed) {
            return;
        }
    }
}

// ============================================================================
// Peer config file
// ============================================================================

/// Settings read from the peer's `key=value` config file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerFileConfig {
    pub target_ip: Option<Ipv4Addr>,
    pub port: Option<u16>,
}

/// Parse a `key=value` config file. Blank lines and `#` comments are
/// skipped; unknown keys are ignored; malformed values fail.
pub fn read_peer_config(path: &Path) -> io::Result<PeerFileConfig> {
    let file = std::fs::File::open(path)?;
    let mut config = PeerFileConfig::default();

    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("malformed line: {line}"),
            ));
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "target_ip" => {
                config.target_ip = Some(value.parse().map_err(|_| {
                    io::Error::new(ErrorKind::InvalidData, format!("bad target_ip: {value}"))
                })?);
            }
            "port" => {
                config.port = Some(value.parse().map_err(|_| {
                    io::Error::new(ErrorKind::InvalidData, format!("bad port: {value}"))
                })?);
            }
            _ => {}
        }
    }

    Ok(config)
}
