//! Audio backend capability: the uniform surface the relay core runs on.
//!
//! A backend drives the pipeline by invoking the process callback at the
//! device cadence with exactly the configured frame count, mono input and
//! two non-interleaved output lanes. Invocations are strictly sequential
//! for one backend instance. Concrete variants: ALSA, PipeWire, Simulated.

#[cfg(target_os = "linux")]
pub mod alsa;
#[cfg(target_os = "linux")]
pub mod pipewire;
pub mod sim;

use crate::config::{BackendKind, SessionConfig};
use crate::error::Result;

/// Process callback: `(input, out_left, out_right)`, all `buffer_size`
/// frames long. State travels in the closure's captures.
pub type ProcessCallback = Box<dyn FnMut(&[f32], &mut [f32], &mut [f32]) + Send>;

/// Uniform start/stop/stats surface over the concrete drivers.
///
/// Construction is `init`; dropping a backend is `cleanup` and is safe at
/// any point after construction, including after a failed `start`.
pub trait AudioBackend: Send {
    /// Begin invoking the process callback at the device cadence.
    fn start(&mut self) -> Result<()>;

    /// Stop callback delivery; joins the driving thread.
    fn stop(&mut self) -> Result<()>;

    fn is_running(&self) -> bool;

    /// Nominal one-way device latency in milliseconds.
    fn latency_ms(&self) -> f64;

    /// Hardware-level under/overruns observed so far.
    fn xruns(&self) -> u64;
}

/// Build the configured backend variant around the process callback.
pub fn create(config: &SessionConfig, callback: ProcessCallback) -> Result<Box<dyn AudioBackend>> {
    match config.backend {
        BackendKind::Simulated => Ok(Box::new(sim::SimulatedBackend::new(config, callback))),
        #[cfg(target_os = "linux")]
        BackendKind::Alsa => Ok(Box::new(alsa::AlsaBackend::new(config, callback)?)),
        #[cfg(target_os = "linux")]
        BackendKind::Pipewire => Ok(Box::new(pipewire::PipewireBackend::new(config, callback)?)),
        #[cfg(not(target_os = "linux"))]
        other => {
            let _ = callback;
            Err(crate::error::Error::Backend(format!(
                "{other} backend is only available on Linux"
            )))
        }
    }
}
