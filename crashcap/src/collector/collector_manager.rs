// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::emitters::{emit_report, ReportSource};
use super::handler_process::HandlerProcess;
use super::process_handle::ProcessHandle;
use super::UserStream;
use crate::annotations::AnnotationStore;
use crate::crash_info::ReportKind;
use crashcap_common::timeout::TimeoutManager;
use crashcap_common::unix_utils::{alt_fork, terminate};
use libc::{siginfo_t, ucontext_t};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet};
use std::os::unix::io::RawFd;
use std::os::unix::{io::FromRawFd, net::UnixStream};
use thiserror::Error;

/// The forked child that writes the report stream of a crash to the handler.
pub(crate) struct Collector {
    pub handle: ProcessHandle,
}

#[derive(Debug, Error)]
pub enum CollectorSpawnError {
    #[error("Failed to fork collector process (error code: {0})")]
    ForkFailed(i32),
}

/// What the crash handler hands to the collector. Pointers stay valid in the child because
/// fork copies the address space.
pub(crate) struct CrashSnapshot<'a> {
    pub annotations: Option<&'a AnnotationStore>,
    pub user_streams: &'a [UserStream],
    pub sig_info: *const siginfo_t,
    pub ucontext: *const ucontext_t,
    pub crashing_tid: libc::pid_t,
}

impl Collector {
    pub(crate) fn spawn(
        handler: &HandlerProcess,
        snapshot: &CrashSnapshot,
    ) -> Result<Self, CollectorSpawnError> {
        // When we spawn the child, our pid becomes the ppid.
        // SAFETY: This function has no safety requirements.
        let pid = unsafe { libc::getpid() };

        match alt_fork() {
            0 => run_collector_child(snapshot, handler.handle.uds_fd, pid),
            child if child > 0 => Ok(Self {
                handle: ProcessHandle::new(handler.handle.uds_fd, Some(child)),
            }),
            code => Err(CollectorSpawnError::ForkFailed(code)),
        }
    }

    pub fn finish(self, timeout_manager: &TimeoutManager) {
        self.handle.finish(timeout_manager);
    }
}

fn run_collector_child(snapshot: &CrashSnapshot, uds_fd: RawFd, ppid: libc::pid_t) -> ! {
    // Close stdio
    let _ = unsafe { libc::close(0) };
    let _ = unsafe { libc::close(1) };
    let _ = unsafe { libc::close(2) };

    // Disable SIGPIPE
    let _ = unsafe {
        signal::sigaction(
            signal::SIGPIPE,
            &SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty()),
        )
    };

    let ucontext: &[u8] = if snapshot.ucontext.is_null() {
        &[]
    } else {
        // SAFETY: non-null, handed to us by the kernel through the signal handler.
        unsafe {
            std::slice::from_raw_parts(
                snapshot.ucontext.cast::<u8>(),
                std::mem::size_of::<ucontext_t>(),
            )
        }
    };
    // A lock held by any thread at fork time stays held in this copy forever.
    let annotations = snapshot
        .annotations
        .and_then(AnnotationStore::try_snapshot);

    let source = ReportSource {
        kind: ReportKind::Crash,
        annotations,
        sig_info: snapshot.sig_info,
        ucontext,
        pid: ppid,
        tid: snapshot.crashing_tid,
        user_streams: snapshot.user_streams,
    };

    let mut unix_stream = unsafe { UnixStream::from_raw_fd(uds_fd) };
    if emit_report(&mut unix_stream, &source).is_err() {
        terminate();
    }

    // Exit normally
    unsafe { libc::_exit(0) };
}
