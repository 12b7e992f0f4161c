//! Configuration for the ringkv server.
//!
//! Wire-level parameters (listen port, ring depth, buffer pool sizing)
//! are compile-time constants, not configuration, and aren't exposed on
//! the CLI. The only thing an operator controls is log verbosity.

use clap::Parser;

/// TCP port the server listens on (dual-stack `[::]:PORT`).
pub const PORT: u16 = 6379;

/// Maximum number of in-flight submission queue entries.
pub const RING_ENTRIES: u32 = 64;

/// Number of buffers in the receive buffer group.
pub const RECV_BUFFER_COUNT: u16 = 1024;

/// Size in bytes of each receive buffer.
pub const RECV_BUFFER_SIZE: usize = 512;

/// Buffer group id registered for receive buffer selection.
pub const RECV_BUFFER_GROUP_ID: u16 = 0;

/// Minimum kernel version this engine requires.
pub const MIN_KERNEL_VERSION: (u32, u32) = (5, 19);

/// Command-line arguments for the ringkv server.
#[derive(Parser, Debug)]
#[command(name = "ringkv")]
#[command(author = "ringkv authors")]
#[command(version = "0.1.0")]
#[command(about = "A RESP 2.0 key-value server built on a completion-based io_uring engine")]
pub struct CliArgs {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl CliArgs {
    /// Parse CLI arguments from `std::env::args`.
    pub fn load() -> Self {
        CliArgs::parse()
    }
}
