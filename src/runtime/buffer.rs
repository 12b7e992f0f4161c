//! Ring-mapped provided buffer group for io_uring recv buffer selection.
//!
//! The kernel selects a buffer from this group per recv, eliminating the
//! need to pre-assign a buffer to a connection before the data is known.
//! Buffers are recycled back into the group once the callback that
//! observed them returns.

use io_uring::types::BufRingEntry;
use io_uring::IoUring;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::io;
use std::sync::atomic::{AtomicU16, Ordering};

/// A provided buffer ring registered with io_uring under a single group id.
///
/// The ring header occupies entries managed internally; buffer data lives
/// in a separate flat allocation indexed by buffer id.
pub struct BufferGroup {
    ring_ptr: *mut BufRingEntry,
    buffers_ptr: *mut u8,
    ring_layout: Layout,
    buffers_layout: Layout,
    ring_entries: u16,
    buffer_size: usize,
    tail: AtomicU16,
    bgid: u16,
}

impl BufferGroup {
    /// Create and register a buffer group of `ring_entries` buffers of
    /// `buffer_size` bytes each, under group id `bgid`. `ring_entries` must
    /// be a power of two.
    pub fn new(
        ring: &IoUring,
        ring_entries: u16,
        buffer_size: usize,
        bgid: u16,
    ) -> io::Result<Self> {
        if !ring_entries.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "ring_entries must be power of 2",
            ));
        }

        let ring_size = std::mem::size_of::<BufRingEntry>() * ring_entries as usize;
        let ring_layout = Layout::from_size_align(ring_size, 4096)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let ring_ptr = unsafe { alloc_zeroed(ring_layout) as *mut BufRingEntry };
        if ring_ptr.is_null() {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "failed to allocate ring"));
        }

        let buffers_size = buffer_size * ring_entries as usize;
        let buffers_layout = Layout::from_size_align(buffers_size, 4096)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let buffers_ptr = unsafe { alloc_zeroed(buffers_layout) as *mut u8 };
        if buffers_ptr.is_null() {
            unsafe { dealloc(ring_ptr as *mut u8, ring_layout) };
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "failed to allocate buffers"));
        }

        let group = Self {
            ring_ptr,
            buffers_ptr,
            ring_layout,
            buffers_layout,
            ring_entries,
            buffer_size,
            tail: AtomicU16::new(0),
            bgid,
        };

        for i in 0..ring_entries {
            group.add_buffer(i);
        }

        unsafe {
            ring.submitter()
                .register_buf_ring_with_flags(ring_ptr as u64, ring_entries, bgid, 0)?;
        }

        Ok(group)
    }

    #[inline]
    pub fn bgid(&self) -> u16 {
        self.bgid
    }

    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Borrow the bytes of buffer `bid` truncated to `len`.
    ///
    /// # Safety
    /// Caller must only call this for a `bid` the kernel has reported as
    /// selected in the current completion, and must not retain the slice
    /// past the callback invocation.
    pub unsafe fn buffer_slice(&self, bid: u16, len: usize) -> &[u8] {
        let len = len.min(self.buffer_size);
        std::slice::from_raw_parts(self.buffers_ptr.add(bid as usize * self.buffer_size), len)
    }

    /// Return a buffer to the group for reuse by a future recv.
    pub fn recycle(&self, bid: u16) {
        self.add_buffer(bid);
    }

    fn add_buffer(&self, bid: u16) {
        let tail = self.tail.load(Ordering::Relaxed);
        let idx = tail & (self.ring_entries - 1);

        unsafe {
            let entry = self.ring_ptr.add(idx as usize);
            (*entry).set_addr(self.buffers_ptr.add(bid as usize * self.buffer_size) as u64);
            (*entry).set_len(self.buffer_size as u32);
            (*entry).set_bid(bid);
        }

        let new_tail = tail.wrapping_add(1);
        self.tail.store(new_tail, Ordering::Release);

        unsafe {
            let tail_ptr = BufRingEntry::tail(self.ring_ptr) as *mut u16;
            std::ptr::write_volatile(tail_ptr, new_tail);
        }
    }
}

impl Drop for BufferGroup {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.buffers_ptr, self.buffers_layout);
            dealloc(self.ring_ptr as *mut u8, self.ring_layout);
        }
    }
}

// BufferGroup is owned by a single-threaded engine and never shared.
unsafe impl Send for BufferGroup {}

#[cfg(test)]
mod tests {
    // Constructing a BufferGroup requires a live IoUring, which needs a
    // 5.19+ kernel; the submission-level properties it's built from are
    // covered by runtime::engine's tests instead.

    #[test]
    fn entry_count_power_of_two_check() {
        assert!(1024u16.is_power_of_two());
        assert!(!1000u16.is_power_of_two());
    }
}
