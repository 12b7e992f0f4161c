//! Completion-based I/O runtime: the ring-backed engine and its recv
//! buffer group. Linux-only; there is no portable fallback.

pub mod buffer;
pub mod engine;
