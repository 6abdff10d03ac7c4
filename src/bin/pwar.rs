//! pwar: run the audio bridge until SIGINT/SIGTERM.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use pwar::{BackendKind, Session, SessionConfig};

#[derive(Parser, Debug)]
#[command(
    name = "pwar",
    version,
    about = "Low-latency bidirectional PCM audio bridge over UDP"
)]
struct Args {
    /// Audio backend: alsa, pipewire or simulated
    #[arg(long, default_value = "pipewire")]
    backend: String,

    /// Remote peer IPv4 address
    #[arg(long, default_value = "127.0.0.1")]
    ip: Ipv4Addr,

    /// Remote peer UDP port
    #[arg(long, default_value_t = pwar::DEFAULT_PORT)]
    port: u16,

    /// Frames per audio callback
    #[arg(long = "device-buffer", default_value_t = 64)]
    device_buffer: usize,

    /// Frames per wire packet; a multiple of the device buffer
    /// (defaults to one packet per callback)
    #[arg(long = "packet-buffer")]
    packet_buffer: Option<usize>,

    /// Sample rate in Hz
    #[arg(long, default_value_t = 48000)]
    rate: u32,

    /// Ring buffer depth in frames
    #[arg(long = "ring-depth", default_value_t = 1024)]
    ring_depth: usize,

    /// Copy input straight to output, bypassing the network
    #[arg(long)]
    passthrough: bool,

    /// ALSA capture device
    #[arg(long = "capture-device", default_value = "default")]
    capture_device: String,

    /// ALSA playback device
    #[arg(long = "playback-device", default_value = "default")]
    playback_device: String,
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
    let backend: BackendKind = args.backend.parse()?;

    let config = SessionConfig {
        backend,
        stream_ip: args.ip,
        stream_port: args.port,
        sample_rate: args.rate,
        buffer_size: args.device_buffer,
        packet_size: args.packet_buffer.unwrap_or(args.device_buffer),
        ring_buffer_depth: args.ring_depth,
        passthrough_test: args.passthrough,
        capture_device: args.capture_device,
        playback_device: args.playback_device,
    };

    install_signal_handlers();

    let mut session = Session::init(config).context("session init")?;
    session.start().context("session start")?;
    log::info!("bridge running; ctrl-c to stop");

    while !SHUTDOWN.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }

    log::info!("shutting down");
    let _ = session.stop();
    let metrics = session.metrics();
    log::info!(
        "final: rtt {:.2}/{:.2}/{:.2} ms, ring fill {:.1}/{:.1}/{:.1} ms, {} xruns",
        metrics.latency.round_trip.min,
        metrics.latency.round_trip.avg,
        metrics.latency.round_trip.max,
        metrics.latency.ring_fill.min,
        metrics.latency.ring_fill.avg,
        metrics.latency.ring_fill.max,
        metrics.xruns,
    );
    session.cleanup();
    Ok(())
}
