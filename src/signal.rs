//! Signal handling: clears the process-wide running flag on SIGTERM/SIGINT,
//! ignores SIGPIPE.
//!
//! Implemented directly on `libc::sigaction` rather than pulling in a
//! signal-handling crate: the rest of this codebase already talks to the
//! kernel directly for sockets and the completion ring, and a single
//! `sigaction` registration doesn't earn a new dependency.

use std::sync::atomic::{AtomicBool, Ordering};

/// Cleared by a signal handler; the event loop checks it after every
/// completion drain and returns once it goes false.
pub static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn clear_running(_signum: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

/// Install SIGTERM/SIGINT handlers and ignore SIGPIPE.
///
/// Must be called once at startup, before the event loop runs.
pub fn install() -> std::io::Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = clear_running as usize;
        libc::sigemptyset(&mut action.sa_mask);

        if libc::sigaction(libc::SIGTERM, &action, std::ptr::null_mut()) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut()) != 0 {
            return Err(std::io::Error::last_os_error());
        }

        if libc::signal(libc::SIGPIPE, libc::SIG_IGN) == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error());
        }
    }

    Ok(())
}

/// Whether the event loop should keep running.
pub fn running() -> bool {
    RUNNING.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Both assertions share the process-wide RUNNING flag, so they run as
    // one test to avoid racing against other tests in this binary.
    #[test]
    fn running_flag_lifecycle() {
        RUNNING.store(true, Ordering::SeqCst);
        assert!(running());

        clear_running(libc::SIGTERM);
        assert!(!running());

        RUNNING.store(true, Ordering::SeqCst);
    }
}
