// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The signal-time hook that asks the monitor to unwind the crashing thread.
//!
//! Uses only these async-signal-safe functions:
//! <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
//! - gettid (raw syscall)
//! - send

use super::protocol::UnwindRequest;
use crashcap_common::unix_utils::current_tid;
use libc::{c_void, siginfo_t};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering::SeqCst};

/// The connected, non-blocking monitor channel. -1 until unwinding is enabled.
static MONITOR_CHANNEL: AtomicI32 = AtomicI32::new(-1);

/// Publishes the channel used by [`notify_monitor`]. The descriptor must stay open for the rest
/// of the process.
pub(crate) fn set_monitor_channel(fd: RawFd) {
    MONITOR_CHANNEL.store(fd, SeqCst);
}

pub fn monitor_channel() -> Option<RawFd> {
    match MONITOR_CHANNEL.load(SeqCst) {
        fd if fd >= 0 => Some(fd),
        _ => None,
    }
}

/// First-chance handler: sends one unwind request for the calling thread and returns.
///
/// Never allocates, locks, blocks or logs. Always returns `false`, so the crash is reported
/// normally afterwards.
pub fn notify_monitor(signo: i32, _sig_info: *mut siginfo_t, _ucontext: *mut c_void) -> bool {
    let Some(fd) = monitor_channel() else {
        return false;
    };
    let request = UnwindRequest {
        tid: current_tid(),
        signo,
    }
    .to_bytes();
    // A full socket buffer or a dead monitor just means no unwind result for this crash.
    // SAFETY: `request` is a live stack buffer of the given length.
    let _ = unsafe {
        libc::send(
            fd,
            request.as_ptr().cast(),
            request.len(),
            libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
        )
    };
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unwind::protocol::REQUEST_SIZE;
    use std::io::Read;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_notify_monitor_sends_one_request() {
        let (ours, mut monitor) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        set_monitor_channel(ours.as_raw_fd());
        assert_eq!(monitor_channel(), Some(ours.as_raw_fd()));

        assert!(!notify_monitor(libc::SIGBUS, std::ptr::null_mut(), std::ptr::null_mut()));
        let mut request = [0u8; REQUEST_SIZE];
        monitor.read_exact(&mut request).unwrap();
        let request = UnwindRequest::from_bytes(request);
        assert_eq!(request.signo, libc::SIGBUS);
        assert_eq!(request.tid, current_tid());

        // A vanished monitor is not an error for the crashing thread.
        drop(monitor);
        assert!(!notify_monitor(libc::SIGSEGV, std::ptr::null_mut(), std::ptr::null_mut()));
        set_monitor_channel(-1);
    }
}
