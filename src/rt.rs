//! Best-effort real-time scheduling for the audio and network threads.
//!
//! Failure to obtain a real-time class is a warning, never a fatal: the
//! bridge keeps working at normal priority, just with weaker timing
//! guarantees.

/// SCHED_FIFO priority requested for hot-path threads (1..=99 on Linux).
#[cfg(unix)]
const RT_PRIORITY: libc::c_int = 70;

/// Promote the calling thread to a real-time scheduling class.
///
/// `role` names the thread in the warning emitted when the request is
/// denied (typically for missing RLIMIT_RTPRIO).
#[cfg(unix)]
pub fn promote_current_thread(role: &str) {
    let param = libc::sched_param {
        sched_priority: RT_PRIORITY,
    };
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc == 0 {
        log::debug!("{role} thread: SCHED_FIFO priority {RT_PRIORITY}");
    } else {
        log::warn!(
            "{role} thread: real-time scheduling denied ({}), continuing at normal priority",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
pub fn promote_current_thread(role: &str) {
    log::warn!("{role} thread: real-time scheduling not implemented for this platform");
}
