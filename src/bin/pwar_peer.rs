//! pwar-peer: standalone identity loopback peer.
//!
//! Echoes every valid packet back to its sender with `t2`/`t3` stamped.
//! Stands in for the remote processing host on a bench or in tests.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use pwar::peer::{read_peer_config, LoopbackPeer};

#[derive(Parser, Debug)]
#[command(name = "pwar-peer", version, about = "Loopback peer for the pwar bridge")]
struct Args {
    /// Interface address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: Ipv4Addr,

    /// UDP port to listen on
    #[arg(long, default_value_t = pwar::DEFAULT_PORT)]
    port: u16,

    /// Optional key=value config file (keys: target_ip, port)
    #[arg(long)]
    config: Option<PathBuf>,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn handle_signal(_signum: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

#[cfg(unix)]
fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut port = args.port;
    if let Some(path) = &args.config {
        let file = read_peer_config(path).with_context(|| format!("reading {}", path.display()))?;
        if let Some(p) = file.port {
            port = p;
        }
        if let Some(ip) = file.target_ip {
            // The loopback peer replies to the datagram source; the
            // configured target is informational here.
            log::info!("configured target_ip {ip} (replies go to the packet source)");
        }
    }

    install_signal_handlers();

    let peer = LoopbackPeer::spawn(SocketAddr::from((args.bind, port)))?;
    log::info!("peer listening on {}", peer.local_addr());

    while !SHUTDOWN.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }

    log::info!("peer shutting down");
    drop(peer);
    Ok(())
}
