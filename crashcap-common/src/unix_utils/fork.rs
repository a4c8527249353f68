// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn alt_fork() -> libc::pid_t {
    // Non-Linux targets are only used for development, so they live with atfork handlers.
    unsafe { libc::fork() }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const STATUS_BUFFER_SIZE: usize = 512;

/// Reads `/proc/self/status` into a stack buffer and reports whether `TracerPid` is non-zero.
/// Runs between a crash signal and a fork, so it must not allocate.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn is_being_traced() -> bool {
    let fd = unsafe { libc::open(c"/proc/self/status".as_ptr(), libc::O_RDONLY) };
    if fd < 0 {
        return false;
    }
    let traced = scan_tracer_pid(|buf| {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            0
        } else {
            n as usize
        }
    });
    unsafe { libc::close(fd) };
    traced
}

/// Line scanner over a fixed buffer. `fill` appends bytes and returns how many it wrote, zero
/// meaning end of input. Lines longer than the buffer are skipped.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn scan_tracer_pid(mut fill: impl FnMut(&mut [u8]) -> usize) -> bool {
    const MARKER: &[u8] = b"TracerPid:";
    let mut buffer = [0u8; STATUS_BUFFER_SIZE];
    let mut len = 0;
    let mut skipping_long_line = false;

    loop {
        let n = fill(&mut buffer[len..]);
        let eof = n == 0;
        len += n;

        let mut start = 0;
        while let Some(pos) = buffer[start..len].iter().position(|&b| b == b'\n') {
            let line = &buffer[start..start + pos];
            if !skipping_long_line && line.starts_with(MARKER) {
                return tracer_pid_is_set(&line[MARKER.len()..]);
            }
            skipping_long_line = false;
            start += pos + 1;
        }

        if eof {
            let line = &buffer[start..len];
            return !skipping_long_line
                && line.starts_with(MARKER)
                && tracer_pid_is_set(&line[MARKER.len()..]);
        }

        if start == 0 && len == buffer.len() {
            // A line that does not fit; drop what we have and ignore the rest of it.
            len = 0;
            skipping_long_line = true;
        } else {
            buffer.copy_within(start..len, 0);
            len -= start;
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn tracer_pid_is_set(value: &[u8]) -> bool {
    value
        .iter()
        .filter(|b| !b.is_ascii_whitespace())
        .any(|&b| b != b'0')
}

/// Forks through the raw `clone` syscall so that no atfork handlers run in the child.
/// If the current process is being traced, the child inherits the tracer.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn alt_fork() -> libc::pid_t {
    use libc::{c_ulong, c_void, pid_t, syscall, SYS_clone, CLONE_PTRACE, SIGCHLD};

    let extra_flags = if is_being_traced() { CLONE_PTRACE } else { 0 };

    // No CLONE_*_SETTID flags, so the argument order (which differs between architectures) does
    // not matter: every pointer is null.
    let res = unsafe {
        syscall(
            SYS_clone,
            (SIGCHLD | extra_flags) as c_ulong,
            std::ptr::null_mut::<c_void>(),
            std::ptr::null_mut::<c_void>(),
            std::ptr::null_mut::<c_void>(),
            0 as c_ulong,
        )
    };
    res.clamp(pid_t::MIN as libc::c_long, pid_t::MAX as libc::c_long) as pid_t
}

#[cfg(any(target_os = "linux", target_os = "android"))]
#[cfg(test)]
mod tests {
    use super::*;

    fn scan(input: &[u8]) -> bool {
        let mut remaining = input;
        scan_tracer_pid(|buf| {
            let n = buf.len().min(remaining.len()).min(7);
            buf[..n].copy_from_slice(&remaining[..n]);
            remaining = &remaining[n..];
            n
        })
    }

    #[test]
    fn test_tracer_pid_in_middle() {
        assert!(scan(b"Name:\tapp\nTracerPid:\t2\nUid:\t0\n"));
    }

    #[test]
    fn test_tracer_pid_zero() {
        assert!(!scan(b"Name:\tapp\nTracerPid:\t0\nUid:\t0\n"));
    }

    #[test]
    fn test_tracer_pid_last_line_without_newline() {
        assert!(scan(b"Name:\tapp\nTracerPid:\t4242"));
    }

    #[test]
    fn test_tracer_pid_missing() {
        assert!(!scan(b"Name:\tapp\nUid:\t0\n"));
    }

    #[test]
    fn test_long_line_is_skipped() {
        let mut input = b"Groups:".to_vec();
        input.extend(std::iter::repeat(b'1').take(STATUS_BUFFER_SIZE * 2));
        input.extend_from_slice(b"\nTracerPid:\t17\n");
        assert!(scan(&input));
    }

    #[test]
    fn test_alt_fork_child_exits() {
        let pid = alt_fork();
        if pid == 0 {
            unsafe { libc::_exit(7) };
        }
        assert!(pid > 0);
        let status = nix::sys::wait::waitpid(nix::unistd::Pid::from_raw(pid), None).unwrap();
        assert_eq!(
            status,
            nix::sys::wait::WaitStatus::Exited(nix::unistd::Pid::from_raw(pid), 7)
        );
    }
}
