// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The memory region shared with the unwind monitor.
//!
//! ```text
//! offset  size
//!      0     4   monitor pid, written once by the monitor right after it starts (0 = not yet)
//!      4     4   completion counter, bumped by the monitor after each published result
//!      8     4   payload length of the latest result
//!     12     4   reserved
//!     16     -   payload
//! ```
//! Header fields are accessed atomically through both mappings. The payload is written only by
//! the monitor's request handler, and read only after the completion counter moved.

use crate::shared::constants::UNWIND_BUFFER_SIZE;
use crashcap_common::timeout::TimeoutManager;
use crashcap_common::unix_utils::signal_safe_sleep;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const MONITOR_PID_OFFSET: usize = 0;
const COMPLETION_OFFSET: usize = 4;
const PAYLOAD_LEN_OFFSET: usize = 8;
pub const PAYLOAD_OFFSET: usize = 16;
pub const PAYLOAD_CAPACITY: usize = UNWIND_BUFFER_SIZE - PAYLOAD_OFFSET;

#[derive(Debug, thiserror::Error)]
pub enum SharedBufferError {
    #[error("Failed to create the shared memory file: {0}")]
    Create(#[from] memfd::Error),
    #[error("Failed to size the shared memory file: {0}")]
    Resize(std::io::Error),
    #[error("Failed to map the shared memory file: {0}")]
    Map(nix::Error),
}

/// One mapping of the shared region. Each process maps the file separately.
#[derive(Debug)]
pub struct UnwindRegion {
    base: NonNull<u8>,
    len: usize,
}

// The region is only touched through atomics and raw reads/writes.
unsafe impl Send for UnwindRegion {}
unsafe impl Sync for UnwindRegion {}

impl UnwindRegion {
    /// Maps `fd` shared and read-write.
    pub fn map(fd: RawFd) -> Result<Self, SharedBufferError> {
        let len = UNWIND_BUFFER_SIZE;
        let map_len = NonZeroUsize::new(len).ok_or(SharedBufferError::Map(nix::Error::EINVAL))?;
        // SAFETY: `fd` stays open for the duration of the call; the mapping keeps its own
        // reference to the file.
        let addr = unsafe {
            mmap(
                None,
                map_len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                BorrowedFd::borrow_raw(fd),
                0,
            )
        }
        .map_err(SharedBufferError::Map)?;
        Ok(Self {
            base: addr.cast(),
            len,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.base.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn header(&self, offset: usize) -> &AtomicU32 {
        // SAFETY: offsets are 4-aligned, inside the page-aligned mapping, and live as long as
        // `self`.
        unsafe { AtomicU32::from_ptr(self.base.as_ptr().add(offset).cast()) }
    }

    /// `None` until the monitor wrote its pid.
    pub fn monitor_pid(&self) -> Option<libc::pid_t> {
        match self.header(MONITOR_PID_OFFSET).load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid as libc::pid_t),
        }
    }

    pub fn set_monitor_pid(&self, pid: libc::pid_t) {
        self.header(MONITOR_PID_OFFSET)
            .store(pid as u32, Ordering::Release);
    }

    /// Polls for the handshake until `timeout`. Only sleeps through `poll`.
    pub fn wait_for_monitor_pid(&self, timeout: Duration) -> Option<libc::pid_t> {
        let timeout_manager = TimeoutManager::new(timeout);
        loop {
            if let Some(pid) = self.monitor_pid() {
                return Some(pid);
            }
            if timeout_manager.expired() {
                return None;
            }
            signal_safe_sleep(Duration::from_millis(1));
        }
    }

    pub fn completion_counter(&self) -> &AtomicU32 {
        self.header(COMPLETION_OFFSET)
    }

    pub fn completions(&self) -> u32 {
        self.completion_counter().load(Ordering::Acquire)
    }

    /// Waits until the completion counter differs from `seen` or `timeout` passes.
    /// Async-signal-safe: atomic loads, `clock_gettime` and `poll` only.
    pub fn wait_for_completion(&self, seen: u32, timeout: Duration) -> bool {
        let timeout_manager = TimeoutManager::new(timeout);
        loop {
            if self.completions() != seen {
                return true;
            }
            if timeout_manager.expired() {
                return false;
            }
            signal_safe_sleep(Duration::from_millis(1));
        }
    }

    /// Length of the latest published payload, clamped to the capacity.
    pub fn payload_len(&self) -> usize {
        (self.header(PAYLOAD_LEN_OFFSET).load(Ordering::Acquire) as usize).min(PAYLOAD_CAPACITY)
    }

    /// The latest published payload.
    pub fn payload(&self) -> Vec<u8> {
        let len = self.payload_len();
        // SAFETY: the payload area is inside the mapping; bytes are plain data.
        unsafe { std::slice::from_raw_parts(self.as_ptr().add(PAYLOAD_OFFSET), len) }.to_vec()
    }

    /// Lets `write` fill the payload area, then publishes the length it returned and bumps the
    /// completion counter. Returns the published length.
    pub fn publish(&self, write: impl FnOnce(&mut [u8]) -> usize) -> u32 {
        // SAFETY: only the monitor's request handler writes here, one request at a time.
        let payload = unsafe {
            std::slice::from_raw_parts_mut(self.base.as_ptr().add(PAYLOAD_OFFSET), PAYLOAD_CAPACITY)
        };
        let len = write(payload).min(PAYLOAD_CAPACITY) as u32;
        self.header(PAYLOAD_LEN_OFFSET)
            .store(len, Ordering::Release);
        self.completion_counter().fetch_add(1, Ordering::Release);
        len
    }
}

impl Drop for UnwindRegion {
    fn drop(&mut self) {
        // SAFETY: `base` came from `mmap` with `len`, and no reference outlives `self`.
        let _ = unsafe { munmap(self.base.cast(), self.len) };
    }
}

/// The region as created by the monitored process: the memory file plus the parent's mapping.
#[derive(Debug)]
pub struct SharedUnwindBuffer {
    memfd: memfd::Memfd,
    region: UnwindRegion,
}

impl SharedUnwindBuffer {
    /// Creates a zero-filled `UNWIND_BUFFER_SIZE` memory file and maps it.
    pub fn create() -> Result<Self, SharedBufferError> {
        // Close-on-exec: the monitor inherits the fd through fork, the handler executable must not.
        let memfd = memfd::MemfdOptions::default()
            .close_on_exec(true)
            .create("crashcap-unwind")?;
        memfd
            .as_file()
            .set_len(UNWIND_BUFFER_SIZE as u64)
            .map_err(SharedBufferError::Resize)?;
        let region = UnwindRegion::map(memfd.as_raw_fd())?;
        Ok(Self { memfd, region })
    }

    pub fn fd(&self) -> RawFd {
        self.memfd.as_raw_fd()
    }

    pub fn region(&self) -> &UnwindRegion {
        &self.region
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_buffer_is_zeroed_and_sized() {
        let buffer = SharedUnwindBuffer::create().unwrap();
        assert_eq!(buffer.region().len(), UNWIND_BUFFER_SIZE);
        assert_eq!(
            buffer.memfd.as_file().metadata().unwrap().len(),
            UNWIND_BUFFER_SIZE as u64
        );
        assert_eq!(buffer.region().monitor_pid(), None);
        assert_eq!(buffer.region().completions(), 0);
        assert!(buffer.region().payload().is_empty());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_second_mapping_sees_writes() {
        let buffer = SharedUnwindBuffer::create().unwrap();
        let other = UnwindRegion::map(buffer.fd()).unwrap();
        assert_ne!(other.as_ptr(), buffer.region().as_ptr());

        other.set_monitor_pid(4242);
        assert_eq!(buffer.region().monitor_pid(), Some(4242));
        assert_eq!(
            buffer
                .region()
                .wait_for_monitor_pid(Duration::from_millis(10)),
            Some(4242)
        );

        let seen = buffer.region().completions();
        let len = other.publish(|out| {
            out[..5].copy_from_slice(b"hello");
            5
        });
        assert_eq!(len, 5);
        assert!(buffer
            .region()
            .wait_for_completion(seen, Duration::from_millis(10)));
        assert_eq!(buffer.region().payload(), b"hello");
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_waits_are_bounded() {
        let buffer = SharedUnwindBuffer::create().unwrap();
        assert_eq!(
            buffer
                .region()
                .wait_for_monitor_pid(Duration::from_millis(5)),
            None
        );
        assert!(!buffer
            .region()
            .wait_for_completion(0, Duration::from_millis(5)));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_publish_clamps_length() {
        let buffer = SharedUnwindBuffer::create().unwrap();
        let len = buffer.region().publish(|_| usize::MAX);
        assert_eq!(len as usize, PAYLOAD_CAPACITY);
        assert_eq!(buffer.region().payload_len(), PAYLOAD_CAPACITY);
    }
}
