// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crashcap_common::timeout::TimeoutManager;
use crashcap_common::unix_utils::{reap_child_non_blocking, wait_for_pollhup};
use nix::unistd::Pid;
use std::os::unix::io::RawFd;

/// A child spawned on the crash path, together with the socket it talks over.
pub(crate) struct ProcessHandle {
    pub uds_fd: RawFd,
    pub pid: Option<libc::pid_t>,
}

impl ProcessHandle {
    pub fn new(uds_fd: RawFd, pid: Option<libc::pid_t>) -> Self {
        Self { uds_fd, pid }
    }

    /// Waits for the peer to hang up, then kills and reaps the child within the deadline.
    pub fn finish(&self, timeout_manager: &TimeoutManager) {
        let _ = wait_for_pollhup(self.uds_fd, timeout_manager);

        // Pid 1 is never ours to kill; leak it instead.
        if let Some(pid) = self.pid.filter(|pid| *pid > 1) {
            // Either the child is done, it timed out, or something failed. SIGKILL ends it
            // eventually; reaping gets whatever time is left.
            unsafe { libc::kill(pid, libc::SIGKILL) };
            let _ = reap_child_non_blocking(Pid::from_raw(pid), timeout_manager);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_finish_kills_and_reaps() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        drop(theirs);

        let handle = ProcessHandle::new(ours.as_raw_fd(), Some(child.id() as libc::pid_t));
        handle.finish(&TimeoutManager::new(Duration::from_secs(2)));

        // Already reaped by `finish`.
        let status = nix::sys::wait::waitpid(Pid::from_raw(child.id() as i32), None);
        assert_eq!(status, Err(nix::Error::ECHILD));
    }
}
