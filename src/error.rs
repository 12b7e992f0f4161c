//! Error types for the engine and server.
//!
//! Follows the manual `Display`/`Error` impl style rather than reaching
//! for a derive macro crate, matching how configuration errors are
//! reported elsewhere in this codebase.

use std::fmt;
use std::io;

/// Errors that can abort startup or the event loop.
#[derive(Debug)]
pub enum RingError {
    /// The running kernel is older than the minimum this engine requires.
    SystemOutdated { found: String, required: &'static str },
    /// A kernel registration or syscall failed.
    Io(io::Error),
    /// A fixed resource (ring, buffer group) could not be registered.
    Registration(&'static str),
}

impl fmt::Display for RingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RingError::SystemOutdated { found, required } => write!(
                f,
                "kernel {found} is too old; this engine requires at least {required}"
            ),
            RingError::Io(e) => write!(f, "I/O error: {e}"),
            RingError::Registration(what) => write!(f, "failed to register {what} with the ring"),
        }
    }
}

impl std::error::Error for RingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RingError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RingError {
    fn from(e: io::Error) -> Self {
        RingError::Io(e)
    }
}
