// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Brings up client-side unwinding: the shared region, the monitor process, the notification
//! channel and the tracing permission for the monitor.

use super::backend::ThreadUnwinder;
use super::monitor::{start_monitor, MonitorConfig, MonitorError, MonitorHandle};
use super::shared_buffer::{SharedBufferError, SharedUnwindBuffer, UnwindRegion};
use crate::collector::UserStream;
use crate::shared::constants::MONITOR_SOCKET_NAME;
use nix::sys::prctl::set_dumpable;
use nix::unistd::{getpid, Pid};
use std::os::fd::{IntoRawFd, RawFd};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum UnwindSetupError {
    #[error(transparent)]
    SharedBuffer(#[from] SharedBufferError),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error("The unwind monitor did not report its pid within {0:?}")]
    Handshake(Duration),
    #[error("Failed to grant tracing permission to the unwind monitor {pid}: {source}")]
    Permission {
        pid: libc::pid_t,
        #[source]
        source: nix::Error,
    },
}

/// The parent side of client-side unwinding. Lives for the rest of the process once started:
/// the shared region is never unmapped and the channel is never closed.
#[derive(Debug)]
pub struct UnwindCoordinator {
    buffer: &'static SharedUnwindBuffer,
    monitor: MonitorHandle,
    channel: RawFd,
}

impl UnwindCoordinator {
    /// Creates the shared region, forks the monitor on `<work_dir>/bcd.socket`, attaches to it
    /// and lets the monitor trace this process.
    pub fn start(
        work_dir: &Path,
        backend: Box<dyn ThreadUnwinder>,
        handshake_timeout: Duration,
    ) -> Result<Self, UnwindSetupError> {
        let buffer: &'static SharedUnwindBuffer = Box::leak(Box::new(SharedUnwindBuffer::create()?));
        let fd = buffer.fd();
        let target_pid = getpid().as_raw();

        let child_region: Arc<OnceLock<UnwindRegion>> = Arc::default();
        let init_region = Arc::clone(&child_region);
        let mut backend = backend;
        let mut backend_ready = false;

        let config = MonitorConfig::new(work_dir.join(MONITOR_SOCKET_NAME))
            .with_child_init(move || {
                let region = UnwindRegion::map(fd)?;
                region.set_monitor_pid(getpid().as_raw());
                let _ = init_region.set(region);
                Ok(())
            })
            // Runs in the forked monitor: no logging, the parent may have held the subscriber's
            // locks at fork time. A failed unwind publishes an empty payload.
            .with_request_handler(move |request| {
                let Some(region) = child_region.get() else {
                    return 0;
                };
                if !backend_ready {
                    if backend.initialize().is_err() {
                        return region.publish(|_| 0);
                    }
                    backend_ready = true;
                }
                region.publish(|out| backend.unwind(target_pid, request.tid, out).unwrap_or(0))
            });

        let monitor = start_monitor(config)?;
        let channel = monitor.attach()?.into_raw_fd();

        let monitor_pid = buffer
            .region()
            .wait_for_monitor_pid(handshake_timeout)
            .ok_or(UnwindSetupError::Handshake(handshake_timeout))?;
        if monitor_pid != monitor.pid().as_raw() {
            tracing::warn!(
                target: "crashcap::unwind",
                handshake = monitor_pid,
                forked = monitor.pid().as_raw(),
                "Monitor pid mismatch, trusting the handshake"
            );
        }
        grant_trace_permission(Pid::from_raw(monitor_pid))?;

        tracing::info!(
            target: "crashcap::unwind",
            pid = monitor_pid,
            "Client-side unwinding enabled on {:?}",
            monitor.socket_path()
        );
        Ok(Self {
            buffer,
            monitor,
            channel,
        })
    }

    pub fn buffer(&self) -> &'static SharedUnwindBuffer {
        self.buffer
    }

    pub fn region(&self) -> &'static UnwindRegion {
        self.buffer.region()
    }

    pub fn monitor_pid(&self) -> Pid {
        self.monitor.pid()
    }

    pub fn socket_path(&self) -> &Path {
        self.monitor.socket_path()
    }

    /// The connected, non-blocking channel to the monitor.
    pub fn channel_fd(&self) -> RawFd {
        self.channel
    }

    /// The whole shared region as a report stream.
    pub fn user_stream(&self, stream_id: u32) -> UserStream {
        let region = self.region();
        // SAFETY: the region is leaked, so it stays mapped for the rest of the process.
        unsafe { UserStream::new(stream_id, region.as_ptr(), region.len()) }
    }
}

fn grant_trace_permission(pid: Pid) -> Result<(), UnwindSetupError> {
    let permission_error = |source| UnwindSetupError::Permission {
        pid: pid.as_raw(),
        source,
    };
    // SAFETY: plain integer arguments.
    let rc = unsafe { libc::prctl(libc::PR_SET_PTRACER, pid.as_raw() as libc::c_ulong, 0, 0, 0) };
    match nix::errno::Errno::result(rc) {
        Ok(_) => (),
        // No Yama: the classic ptrace rules apply and a child may already trace its parent.
        Err(nix::Error::EINVAL) => {
            tracing::debug!(target: "crashcap::unwind", "PR_SET_PTRACER not supported")
        }
        Err(e) => return Err(permission_error(e)),
    }
    set_dumpable(true).map_err(permission_error)
}
