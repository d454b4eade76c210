//! Signal handling (SIGINT/SIGTERM/SIGHUP).
//!
//! We let the first SIGINT reach child processes, which ought to build-fail
//! and let the planner report that progress properly.  The handler only sets
//! a cancellation flag; workers read it before spawning anything further.

use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn cancel_handler(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Relaxed);
    // SA_RESETHAND clears the handler, so a second signal kills us.
}

#[cfg(unix)]
pub fn register() {
    // Safety: registering a signal handler is libc unsafe code.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = cancel_handler as libc::sighandler_t;
        sa.sa_flags = libc::SA_RESETHAND;
        for sig in [libc::SIGINT, libc::SIGTERM, libc::SIGHUP] {
            libc::sigaction(sig, &sa, std::ptr::null_mut());
        }
    }
}

#[cfg(not(unix))]
pub fn register() {}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}
