// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::errors::{PollError, ReapError};
use crate::timeout::TimeoutManager;
use libc::{_exit, nfds_t, poll, pollfd, EXIT_FAILURE, POLLHUP};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::os::fd::RawFd;
use std::time::Duration;

/// Non-blocking child reaper.
/// * `Ok(true)` if the child exited and was reaped.
/// * `Ok(false)` if there is no such child (somebody else reaped it).
/// * An error if it is still alive when the deadline passes, or `waitpid` fails.
// `waitpid` is async-signal-safe per POSIX, so this is fine to call from the crash handler.
pub fn reap_child_non_blocking(
    pid: Pid,
    timeout_manager: &TimeoutManager,
) -> Result<bool, ReapError> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if timeout_manager.elapsed() > timeout_manager.timeout() {
                    return Err(ReapError::Timeout(pid.as_raw()));
                }
                signal_safe_sleep(Duration::from_millis(1));
            }
            Ok(_status) => return Ok(true),
            Err(nix::Error::ECHILD) => return Ok(false),
            Err(e) => return Err(ReapError::WaitError(e)),
        }
    }
}

/// Kills the program without raising an abort or calling at_exit handlers.
pub fn terminate() -> ! {
    // Safety: No preconditions
    unsafe { _exit(EXIT_FAILURE) }
}

/// Sleeps using `poll` with no descriptors, which is on the async-signal-safe list.
pub fn signal_safe_sleep(duration: Duration) {
    let ms = duration.as_millis().min(i32::MAX as u128) as i32;
    unsafe { poll(std::ptr::null_mut(), 0, ms) };
}

/// Kernel thread id of the calling thread. Async-signal-safe.
pub fn current_tid() -> libc::pid_t {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        unsafe { libc::getpid() }
    }
}

/// Waits until the peer of `target_fd` hangs up.
/// `Ok(true)` on hang-up, `Ok(false)` on timeout.
pub fn wait_for_pollhup(
    target_fd: RawFd,
    timeout_manager: &TimeoutManager,
) -> Result<bool, PollError> {
    let mut poll_fds = [pollfd {
        fd: target_fd,
        events: POLLHUP,
        revents: 0,
    }];

    loop {
        let timeout_ms = timeout_manager.remaining().as_millis() as i32;
        let poll_result =
            unsafe { poll(poll_fds.as_mut_ptr(), poll_fds.len() as nfds_t, timeout_ms) };
        match poll_result {
            -1 => match nix::Error::last_raw() {
                libc::EAGAIN | libc::EINTR => continue,
                errno => return Err(PollError::PollError(errno)),
            },
            0 => return Ok(false),
            _ => {
                let revents = poll_fds[0].revents;
                if revents & POLLHUP != 0 {
                    return Ok(true);
                }
                return Err(PollError::UnexpectedResult(revents));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_reap_nonexistent_child() {
        let manager = TimeoutManager::new(Duration::from_millis(10));
        let result = reap_child_non_blocking(Pid::from_raw(99999), &manager);
        assert_eq!(result, Ok(false));
    }

    #[test]
    fn test_wait_for_pollhup_detects_hangup() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        drop(theirs);
        let manager = TimeoutManager::new(Duration::from_secs(1));
        assert_eq!(wait_for_pollhup(ours.as_raw_fd(), &manager), Ok(true));
    }

    #[test]
    fn test_wait_for_pollhup_times_out() {
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let manager = TimeoutManager::new(Duration::from_millis(10));
        assert_eq!(wait_for_pollhup(ours.as_raw_fd(), &manager), Ok(false));
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_current_tid_differs_between_threads() {
        let tid = std::thread::spawn(current_tid).join().unwrap();
        assert!(tid > 0);
        assert_ne!(tid, current_tid());
    }
}
