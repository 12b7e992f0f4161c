//! Completion-based I/O engine on top of io_uring.
//!
//! Owns the submission/completion ring and the recv buffer group, exposes
//! the six-operation submission API, and drives the event loop. Operation
//! identity travels through a `slab::Slab<OpKind>` indexed by `user_data`
//! rather than a reinterpreted raw pointer, so a stale or forged
//! `user_data` produces a checked `None` instead of undefined behavior.

use crate::config::{MIN_KERNEL_VERSION, RECV_BUFFER_COUNT, RECV_BUFFER_GROUP_ID, RECV_BUFFER_SIZE, RING_ENTRIES};
use crate::error::RingError;
use crate::runtime::buffer::BufferGroup;
use crate::signal;
use io_uring::{cqueue, opcode, squeue, types, IoUring};
use slab::Slab;
use std::ffi::CStr;
use std::io;
use std::os::unix::io::RawFd;
use tracing::{debug, trace, warn};

/// Discriminates the kind of completion delivered to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Nop,
    Accept,
    Read,
    Write,
    Close,
    Recv,
}

/// The per-operation context allocated for each in-flight submission.
///
/// This is the concrete representation of what the design calls
/// `IoContext`: instead of a user pointer cast back from `user_data`, the
/// slab index itself is the `user_data`, and looking it up is a checked
/// `Slab::try_remove` rather than an unchecked pointer dereference.
#[derive(Debug, Clone, Copy)]
pub enum OpKind {
    Nop,
    Accept,
    Recv { conn_id: usize },
    Read { conn_id: usize },
    Write { conn_id: usize },
    Close { conn_id: usize },
}

impl OpKind {
    pub fn kind(&self) -> IoKind {
        match self {
            OpKind::Nop => IoKind::Nop,
            OpKind::Accept => IoKind::Accept,
            OpKind::Recv { .. } => IoKind::Recv,
            OpKind::Read { .. } => IoKind::Read,
            OpKind::Write { .. } => IoKind::Write,
            OpKind::Close { .. } => IoKind::Close,
        }
    }

    pub fn conn_id(&self) -> Option<usize> {
        match self {
            OpKind::Recv { conn_id } | OpKind::Read { conn_id } | OpKind::Write { conn_id } | OpKind::Close { conn_id } => {
                Some(*conn_id)
            }
            OpKind::Nop | OpKind::Accept => None,
        }
    }
}

/// A completion record handed to the dispatcher.
pub struct IoResult<'a> {
    /// Signed result: negative is `-errno`; otherwise a byte count or, for
    /// accept, the accepted handle.
    pub res: i32,
    /// Raw completion flags from the kernel.
    pub flags: u32,
    /// Present only for recv completions that selected a buffer; valid
    /// only for the duration of the dispatcher call.
    pub buf: Option<&'a [u8]>,
}

impl IoResult<'_> {
    pub fn is_err(&self) -> bool {
        self.res < 0
    }

    pub fn errno(&self) -> Option<io::Error> {
        if self.res < 0 {
            Some(io::Error::from_raw_os_error(-self.res))
        } else {
            None
        }
    }
}

/// The completion-based I/O engine: ring, recv buffer group, and the op
/// token slab.
pub struct Engine {
    ring: IoUring,
    bufgroup: BufferGroup,
    ops: Slab<OpKind>,
    unsubmitted: usize,
}

impl Engine {
    /// Verify the kernel, construct the ring, and register the recv
    /// buffer group. Fails fast on an outdated kernel or any registration
    /// error; no partial state is returned on failure.
    pub fn new() -> Result<Self, RingError> {
        check_kernel_version()?;

        let ring = IoUring::builder()
            .setup_coop_taskrun()
            .setup_single_issuer()
            .build(RING_ENTRIES)
            .map_err(RingError::Io)?;

        let bufgroup = BufferGroup::new(
            &ring,
            RECV_BUFFER_COUNT,
            RECV_BUFFER_SIZE,
            RECV_BUFFER_GROUP_ID,
        )
        .map_err(|_| RingError::Registration("recv buffer group"))?;

        Ok(Self {
            ring,
            bufgroup,
            ops: Slab::with_capacity(RING_ENTRIES as usize * 2),
            unsubmitted: 0,
        })
    }

    fn alloc_op(&mut self, op: OpKind) -> u64 {
        self.ops.insert(op) as u64
    }

    /// Submit `entry`, flushing and retrying if the submission queue is
    /// full. On failure to push after a flush, the allocated op token (if
    /// any) is freed so it doesn't leak.
    fn submit(&mut self, mut entry: squeue::Entry, token: Option<u64>) -> io::Result<()> {
        loop {
            let pushed = unsafe { self.ring.submission().push(&entry) };
            match pushed {
                Ok(()) => {
                    self.unsubmitted += 1;
                    return Ok(());
                }
                Err(returned) => {
                    entry = returned;
                    if self.unsubmitted == 0 {
                        if let Some(t) = token {
                            self.ops.try_remove(t as usize);
                        }
                        return Err(io::Error::new(io::ErrorKind::Other, "submission queue full"));
                    }
                    self.flush(false)?;
                }
            }
        }
    }

    /// Submit pending entries to the kernel. If `wait` is true, blocks
    /// until at least one completion is available.
    fn flush(&mut self, wait: bool) -> io::Result<()> {
        if wait {
            self.ring.submit_and_wait(1)?;
        } else {
            self.ring.submit()?;
        }
        self.unsubmitted = 0;
        Ok(())
    }

    /// Submit a no-op. Suppressed on success; a completion is only
    /// delivered if it fails (which a bare nop never does in practice).
    pub fn nop(&mut self) -> io::Result<()> {
        let token = self.alloc_op(OpKind::Nop);
        let entry = opcode::Nop::new()
            .build()
            .user_data(token)
            .flags(squeue::Flags::SKIP_SUCCESS);
        self.submit(entry, Some(token))
    }

    /// Submit an accept on the listening handle.
    pub fn accept(&mut self, listen_fd: RawFd) -> io::Result<()> {
        let token = self.alloc_op(OpKind::Accept);
        let entry = opcode::Accept::new(types::Fd(listen_fd), std::ptr::null_mut(), std::ptr::null_mut())
            .build()
            .user_data(token);
        self.submit(entry, Some(token))
    }

    /// Submit a recv for `conn_id` that lets the kernel select a buffer
    /// from the registered recv buffer group.
    pub fn recv(&mut self, conn_id: usize, fd: RawFd) -> io::Result<()> {
        let token = self.alloc_op(OpKind::Recv { conn_id });
        let entry = opcode::Recv::new(types::Fd(fd), std::ptr::null_mut(), 0)
            .buf_group(self.bufgroup.bgid())
            .build()
            .user_data(token)
            .flags(squeue::Flags::BUFFER_SELECT);
        self.submit(entry, Some(token))
    }

    /// Submit a read of `buf` at `offset`. Retained in the submission API
    /// for interface completeness; the command path only ever issues recv.
    pub fn read(&mut self, conn_id: usize, fd: RawFd, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let token = self.alloc_op(OpKind::Read { conn_id });
        let entry = opcode::Read::new(types::Fd(fd), buf.as_mut_ptr(), buf.len() as u32)
            .offset(offset)
            .build()
            .user_data(token);
        self.submit(entry, Some(token))
    }

    /// Submit a write of `buf` at `offset`. Suppressed on success; a
    /// completion is only delivered on failure.
    pub fn write(&mut self, conn_id: usize, fd: RawFd, buf: &[u8], offset: u64) -> io::Result<()> {
        let token = self.alloc_op(OpKind::Write { conn_id });
        let entry = opcode::Write::new(types::Fd(fd), buf.as_ptr(), buf.len() as u32)
            .offset(offset)
            .build()
            .user_data(token)
            .flags(squeue::Flags::SKIP_SUCCESS);
        self.submit(entry, Some(token))
    }

    /// Submit a close of `fd`. Suppressed on success.
    pub fn close(&mut self, conn_id: usize, fd: RawFd) -> io::Result<()> {
        let token = self.alloc_op(OpKind::Close { conn_id });
        let entry = opcode::Close::new(types::Fd(fd))
            .build()
            .user_data(token)
            .flags(squeue::Flags::SKIP_SUCCESS);
        self.submit(entry, Some(token))
    }

    /// Recycle a recv buffer back into the group. Must be called once the
    /// dispatcher is done with the slice it was handed.
    pub fn recycle_buffer(&self, bid: u16) {
        self.bufgroup.recycle(bid);
    }

    /// Run the event loop: flush-and-wait, drain completions, dispatch
    /// each to `on_completion`, repeat until the process-wide running flag
    /// is cleared. A dispatcher error terminates the loop.
    pub fn enter<F>(&mut self, mut on_completion: F) -> io::Result<()>
    where
        F: FnMut(&mut Engine, OpKind, IoResult) -> io::Result<()>,
    {
        while signal::running() {
            self.flush(true)?;

            let completions: Vec<cqueue::Entry> = self.ring.completion().collect();
            for cqe in completions {
                let token = cqe.user_data();
                let op = match self.ops.try_remove(token as usize) {
                    Some(op) => op,
                    None => {
                        trace!(token, "completion for unknown or already-freed token, ignoring");
                        continue;
                    }
                };

                let res = cqe.result();
                let flags = cqe.flags();

                let bid = if matches!(op.kind(), IoKind::Recv) && res >= 0 {
                    cqueue::buffer_select(flags)
                } else {
                    None
                };

                let buf = bid.map(|b| unsafe { self.bufgroup.buffer_slice(b, res.max(0) as usize) });

                if let Err(e) = on_completion(self, op, IoResult { res, flags, buf }) {
                    warn!(error = %e, "dispatcher returned an error, shutting down");
                    if let Some(b) = bid {
                        self.recycle_buffer(b);
                    }
                    return Err(e);
                }

                if let Some(b) = bid {
                    self.recycle_buffer(b);
                }
            }
        }

        debug!("event loop exiting, running flag cleared");
        Ok(())
    }
}

/// Verify the running kernel is at least `MIN_KERNEL_VERSION`.
fn check_kernel_version() -> Result<(), RingError> {
    let release = uname_release()?;
    let (major, minor) = parse_version_prefix(&release);

    if (major, minor) < MIN_KERNEL_VERSION {
        return Err(RingError::SystemOutdated {
            found: release,
            required: "5.19",
        });
    }

    Ok(())
}

fn uname_release() -> Result<String, RingError> {
    unsafe {
        let mut uts: libc::utsname = std::mem::zeroed();
        if libc::uname(&mut uts) != 0 {
            return Err(RingError::Io(io::Error::last_os_error()));
        }
        let cstr = CStr::from_ptr(uts.release.as_ptr());
        Ok(cstr.to_string_lossy().into_owned())
    }
}

fn parse_version_prefix(release: &str) -> (u32, u32) {
    let mut parts = release.split(|c: char| !c.is_ascii_digit()).filter(|s| !s.is_empty());
    let major = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let minor = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    (major, minor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_major_minor_from_typical_release_strings() {
        assert_eq!(parse_version_prefix("5.19.0-1-amd64"), (5, 19));
        assert_eq!(parse_version_prefix("6.8.12-arch1-1"), (6, 8));
        assert_eq!(parse_version_prefix("5.4.0-generic"), (5, 4));
    }

    #[test]
    fn op_kind_reports_its_io_kind_and_connection() {
        let op = OpKind::Recv { conn_id: 7 };
        assert_eq!(op.kind(), IoKind::Recv);
        assert_eq!(op.conn_id(), Some(7));

        let op = OpKind::Accept;
        assert_eq!(op.kind(), IoKind::Accept);
        assert_eq!(op.conn_id(), None);
    }

    #[test]
    fn io_result_reports_errno_only_on_negative_result() {
        let ok = IoResult { res: 4, flags: 0, buf: None };
        assert!(!ok.is_err());
        assert!(ok.errno().is_none());

        let err = IoResult { res: -32, flags: 0, buf: None };
        assert!(err.is_err());
        assert!(err.errno().is_some());
    }
}
