// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

// This is needed for vfork.  Using vfork is removed on mac and deprecated on linux
// https://github.com/rust-lang/libc/issues/1596
#![allow(deprecated)]

use super::process_handle::ProcessHandle;
use crate::shared::configuration::CrashHandlerConfig;
use crate::shared::constants::HANDLER_TIMEOUT_ENV;
use crashcap_common::timeout::TimeoutManager;
use crashcap_common::unix_utils::{
    open_file_or_quiet, terminate, PreparedExecve, PreparedExecveError,
};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet};
use nix::sys::socket;
use nix::unistd::close;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::PathBuf;
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::SeqCst;
use std::time::Duration;

// The reason to prefer vfork is to suppress atfork handlers. Other platforms are only used for
// development and live with fork.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
use libc::fork as vfork;
#[cfg(any(target_os = "linux", target_os = "android"))]
use libc::vfork;

static HANDLER_LAUNCH: AtomicPtr<HandlerLaunch> = AtomicPtr::new(ptr::null_mut());

#[derive(Debug, thiserror::Error)]
pub enum HandlerSpawnError {
    #[error("Handler {0:?} is not an executable file")]
    NotExecutable(PathBuf),
    #[error("Handler path {0:?} is not valid UTF-8")]
    NonUtf8Path(PathBuf),
    #[error("Failed to prepare the handler command line: {0}")]
    Prepare(#[from] PreparedExecveError),
    #[error("Failed to open the handler stderr: {0}")]
    Stderr(#[source] std::io::Error),
    #[error("Failed to create the handler socket pair: {0}")]
    SocketPair(#[source] nix::Error),
    #[error("Failed to fork the handler process")]
    ForkFailed,
    #[error("No handler launch is configured")]
    NotConfigured,
    #[error("Failed to register crash signal handlers: {0:#}")]
    SignalHandlers(anyhow::Error),
}

/// Everything the crash path needs to exec the handler, allocated ahead of time.
#[derive(Debug)]
pub(crate) struct HandlerLaunch {
    execve: PreparedExecve,
    stderr: RawFd,
}

impl HandlerLaunch {
    pub(crate) fn new(
        config: &CrashHandlerConfig,
        timeout: Duration,
    ) -> Result<Self, HandlerSpawnError> {
        let handler = config.handler();
        let executable = std::fs::metadata(handler)
            .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
            .unwrap_or(false);
        if !executable {
            return Err(HandlerSpawnError::NotExecutable(handler.to_path_buf()));
        }
        let handler_str = handler
            .to_str()
            .ok_or_else(|| HandlerSpawnError::NonUtf8Path(handler.to_path_buf()))?;

        let execve = PreparedExecve::new(handler_str, &config.handler_argv(), &handler_env(timeout))?;
        let stderr =
            open_file_or_quiet(config.handler_stderr()).map_err(HandlerSpawnError::Stderr)?;
        Ok(Self { execve, stderr })
    }
}

/// The inherited environment, with the stream timeout for the handler.
pub(crate) fn handler_env(timeout: Duration) -> Vec<(String, String)> {
    std::env::vars()
        .filter(|(key, _)| key != HANDLER_TIMEOUT_ENV)
        .chain(std::iter::once((
            HANDLER_TIMEOUT_ENV.to_string(),
            timeout.as_millis().to_string(),
        )))
        .collect()
}

/// Makes `launch` the one used by the next crash.
/// PRECONDITIONS:
///    None
/// SAFETY:
///   This function is not reentrant.
/// ATOMICITY:
///     This function uses a swap on an atomic pointer.
pub(crate) fn update_stored_launch(launch: HandlerLaunch) {
    let box_ptr = Box::into_raw(Box::new(launch));
    let old = HANDLER_LAUNCH.swap(box_ptr, SeqCst);
    if !old.is_null() {
        // Safety: This can only come from a box above.
        let old = unsafe { Box::from_raw(old) };
        let _ = close(old.stderr);
    }
}

/// The handler process of one crash, reading the report stream on its stdin.
pub(crate) struct HandlerProcess {
    pub handle: ProcessHandle,
}

impl HandlerProcess {
    /// Called from the signal handler. The stored launch is taken and leaked.
    pub(crate) fn spawn_from_stored_launch() -> Result<Self, HandlerSpawnError> {
        let launch = HANDLER_LAUNCH.swap(ptr::null_mut(), SeqCst);
        // SAFETY: null or a leaked box from `update_stored_launch`.
        let launch = unsafe { launch.as_ref() }.ok_or(HandlerSpawnError::NotConfigured)?;
        Self::spawn(launch)
    }

    pub(crate) fn spawn(launch: &HandlerLaunch) -> Result<Self, HandlerSpawnError> {
        let (uds_parent, uds_child) = socket::socketpair(
            socket::AddressFamily::Unix,
            socket::SockType::Stream,
            None,
            socket::SockFlag::empty(),
        )
        .map(|(a, b)| (a.into_raw_fd(), b.into_raw_fd()))
        .map_err(HandlerSpawnError::SocketPair)?;

        // `fork()` would run atfork handlers inside the signal handler, and `posix_spawn()` may
        // fork internally, so vfork it is.
        match unsafe { vfork() } {
            0 => run_handler_child(&launch.execve, uds_parent, uds_child, launch.stderr),
            pid if pid > 0 => {
                let _ = close(uds_child);
                Ok(Self {
                    handle: ProcessHandle::new(uds_parent, Some(pid)),
                })
            }
            _ => {
                let _ = close(uds_parent);
                let _ = close(uds_child);
                Err(HandlerSpawnError::ForkFailed)
            }
        }
    }

    pub fn finish(self, timeout_manager: &TimeoutManager) {
        self.handle.finish(timeout_manager);
    }
}

/// Runs in the vfork child: wires the socket to stdin and execs the handler.
fn run_handler_child(
    prepared_exec: &PreparedExecve,
    uds_parent: RawFd,
    uds_child: RawFd,
    stderr: RawFd,
) -> ! {
    unsafe {
        let _ = libc::dup2(uds_child, 0);
        let _ = libc::dup2(stderr, 1);
        let _ = libc::dup2(stderr, 2);
    }
    let _ = close(uds_parent);
    let _ = close(uds_child);

    // The handler must start with a default SIGCHLD disposition.
    let sig_action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    unsafe {
        let _ = signal::sigaction(signal::SIGCHLD, &sig_action);
    }

    let _ = prepared_exec.exec();
    // execve failed
    terminate();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::os::unix::io::FromRawFd;
    use std::os::unix::net::UnixStream;

    fn config(handler: &str, stderr: Option<PathBuf>) -> CrashHandlerConfig {
        CrashHandlerConfig::new("https://u", "/db", handler, vec![], vec![], BTreeMap::new())
            .unwrap()
            .with_handler_stderr(stderr)
    }

    #[test]
    fn test_launch_requires_executable() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("handler.sh");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();
        let result = HandlerLaunch::new(
            &config(script.to_str().unwrap(), None),
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(HandlerSpawnError::NotExecutable(_))));
        let result = HandlerLaunch::new(&config("/no/such/handler", None), Duration::from_secs(1));
        assert!(matches!(result, Err(HandlerSpawnError::NotExecutable(_))));
    }

    #[test]
    fn test_handler_env_sets_timeout() {
        let env = handler_env(Duration::from_millis(1234));
        let timeouts: Vec<_> = env.iter().filter(|(k, _)| k == HANDLER_TIMEOUT_ENV).collect();
        assert_eq!(timeouts, [&(HANDLER_TIMEOUT_ENV.to_string(), "1234".to_string())]);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_spawned_handler_reads_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("handler.sh");
        let output = dir.path().join("stdin.txt");
        std::fs::write(
            &script,
            format!("#!/bin/sh\ncat > {}\n", output.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let launch = HandlerLaunch::new(
            &config(script.to_str().unwrap(), Some(dir.path().join("stderr"))),
            Duration::from_secs(1),
        )
        .unwrap();
        let process = HandlerProcess::spawn(&launch).unwrap();
        let mut stream = unsafe { UnixStream::from_raw_fd(libc::dup(process.handle.uds_fd)) };
        stream.write_all(b"hello handler\n").unwrap();
        stream.shutdown(std::net::Shutdown::Write).unwrap();
        drop(stream);
        process.finish(&TimeoutManager::new(Duration::from_secs(5)));

        assert_eq!(std::fs::read_to_string(output).unwrap(), "hello handler\n");
    }
}
