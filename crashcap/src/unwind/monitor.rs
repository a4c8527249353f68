// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The unwind monitor: a process forked once from the monitored process that services unwind
//! requests for the rest of its parent's life.
//!
//! The listener is bound by the parent before forking, so a connection attempt made right after
//! [`start_monitor`] returns can only queue on the backlog, never fail because the child has not
//! started yet. The child serves one connection at a time; requests on a connection are handled
//! in order.

use super::protocol::{UnwindRequest, REQUEST_SIZE};
use crashcap_common::unix_utils::terminate;
use nix::sys::prctl::set_pdeathsig;
use nix::sys::signal::Signal;
use nix::unistd::{fork, getpid, getppid, ForkResult, Pid};
use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

/// Called in the monitor for every request; returns the published payload length.
pub type RequestHandler = Box<dyn FnMut(UnwindRequest) -> u32 + Send>;
/// Called once in the monitor, right after fork and before the first request is accepted.
pub type ChildInit = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Could not bind the monitor socket {0:?}: {1}")]
    Bind(PathBuf, #[source] io::Error),
    #[error("Failed to fork the monitor process: {0}")]
    Fork(#[source] nix::Error),
    #[error("Could not attach to the monitor socket {0:?}: {1}")]
    Attach(PathBuf, #[source] io::Error),
    #[error("The monitor configuration has no request handler")]
    MissingRequestHandler,
}

pub struct MonitorConfig {
    socket_path: PathBuf,
    request_handler: Option<RequestHandler>,
    child_init: Option<ChildInit>,
}

impl std::fmt::Debug for MonitorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorConfig")
            .field("socket_path", &self.socket_path)
            .field("request_handler", &self.request_handler.is_some())
            .field("child_init", &self.child_init.is_some())
            .finish()
    }
}

impl MonitorConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            request_handler: None,
            child_init: None,
        }
    }

    pub fn with_request_handler(
        mut self,
        handler: impl FnMut(UnwindRequest) -> u32 + Send + 'static,
    ) -> Self {
        self.request_handler = Some(Box::new(handler));
        self
    }

    pub fn with_child_init(
        mut self,
        init: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        self.child_init = Some(Box::new(init));
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

#[derive(Debug)]
pub struct MonitorHandle {
    pid: Pid,
    socket_path: PathBuf,
}

impl MonitorHandle {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Opens the notification channel. The returned stream is non-blocking.
    pub fn attach(&self) -> Result<UnixStream, MonitorError> {
        let attach_error = |e| MonitorError::Attach(self.socket_path.clone(), e);
        let stream = UnixStream::connect(&self.socket_path).map_err(attach_error)?;
        stream.set_nonblocking(true).map_err(attach_error)?;
        Ok(stream)
    }
}

fn bind_listener(socket_path: &Path) -> io::Result<UnixListener> {
    match std::fs::remove_file(socket_path) {
        Ok(()) => tracing::debug!(target: "crashcap::monitor", "Removed stale socket {socket_path:?}"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => (),
        Err(e) => return Err(e),
    }
    UnixListener::bind(socket_path)
}

/// Binds the control socket and forks the monitor.
pub fn start_monitor(config: MonitorConfig) -> Result<MonitorHandle, MonitorError> {
    let MonitorConfig {
        socket_path,
        request_handler,
        child_init,
    } = config;
    let request_handler = request_handler.ok_or(MonitorError::MissingRequestHandler)?;
    let listener =
        bind_listener(&socket_path).map_err(|e| MonitorError::Bind(socket_path.clone(), e))?;
    let parent = getpid();

    // SAFETY: the child only runs the callbacks and the accept loop below, then `_exit`s.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => run_monitor_child(listener, parent, request_handler, child_init),
        Ok(ForkResult::Parent { child }) => {
            tracing::debug!(
                target: "crashcap::monitor",
                pid = child.as_raw(),
                "Started unwind monitor on {socket_path:?}"
            );
            Ok(MonitorHandle {
                pid: child,
                socket_path,
            })
        }
        Err(e) => Err(MonitorError::Fork(e)),
    }
}

/// Nothing in the monitor logs: another thread of the parent may have held the subscriber's
/// writer lock when it forked.
fn run_monitor_child(
    listener: UnixListener,
    parent: Pid,
    mut request_handler: RequestHandler,
    child_init: Option<ChildInit>,
) -> ! {
    // Die with the parent, and catch the case where it already died before prctl.
    let _ = set_pdeathsig(Signal::SIGKILL);
    if getppid() != parent {
        terminate();
    }

    if let Some(init) = child_init {
        if init().is_err() {
            terminate();
        }
    }

    let _ = serve_connections(&listener, &mut request_handler);
    terminate()
}

/// Accepts connections one after the other until `accept` fails.
pub(crate) fn serve_connections(
    listener: &UnixListener,
    request_handler: &mut RequestHandler,
) -> io::Result<()> {
    loop {
        match listener.accept() {
            // A broken connection only ends that client.
            Ok((stream, _)) => {
                let _ = serve_connection(stream, request_handler);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Handles requests until the peer hangs up.
pub(crate) fn serve_connection(
    mut stream: UnixStream,
    request_handler: &mut RequestHandler,
) -> io::Result<()> {
    let mut request = [0u8; REQUEST_SIZE];
    loop {
        match stream.read_exact(&mut request) {
            Ok(()) => (),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
        let len = request_handler(UnwindRequest::from_bytes(request));
        stream.write_all(&len.to_ne_bytes())?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unwind::protocol::REPLY_SIZE;
    use nix::sys::signal::kill;
    use nix::sys::wait::waitpid;

    fn read_reply(stream: &mut UnixStream) -> u32 {
        let mut reply = [0u8; REPLY_SIZE];
        stream.read_exact(&mut reply).unwrap();
        u32::from_ne_bytes(reply)
    }

    #[test]
    fn test_serve_connection_answers_in_order() {
        let (mut client, server) = UnixStream::pair().unwrap();
        let mut handler: RequestHandler = Box::new(|request| request.tid as u32 * 2);
        let worker = std::thread::spawn(move || serve_connection(server, &mut handler));

        for tid in [3, 5, 8] {
            let request = UnwindRequest { tid, signo: 11 };
            client.write_all(&request.to_bytes()).unwrap();
            assert_eq!(read_reply(&mut client), tid as u32 * 2);
        }
        drop(client);
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn test_partial_request_is_dropped() {
        let (mut client, server) = UnixStream::pair().unwrap();
        let mut handler: RequestHandler = Box::new(|_| panic!("no complete request was sent"));
        client.write_all(&[1, 2, 3]).unwrap();
        drop(client);
        assert!(serve_connection(server, &mut handler).is_ok());
    }

    #[test]
    fn test_missing_request_handler() {
        let dir = tempfile::tempdir().unwrap();
        let config = MonitorConfig::new(dir.path().join("bcd.socket"));
        assert!(matches!(
            start_monitor(config),
            Err(MonitorError::MissingRequestHandler)
        ));
    }

    #[test]
    fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bcd.socket");
        std::fs::write(&path, b"stale").unwrap();
        let listener = bind_listener(&path).unwrap();
        drop(listener);
        assert!(bind_listener(&dir.path().join("missing/bcd.socket")).is_err());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_forked_monitor_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = MonitorConfig::new(dir.path().join("bcd.socket"))
            .with_request_handler(|request| request.signo as u32 + 100);
        let handle = start_monitor(config).unwrap();

        let mut stream = handle.attach().unwrap();
        stream.set_nonblocking(false).unwrap();
        let request = UnwindRequest {
            tid: 1,
            signo: libc::SIGSEGV,
        };
        stream.write_all(&request.to_bytes()).unwrap();
        assert_eq!(read_reply(&mut stream), libc::SIGSEGV as u32 + 100);

        kill(handle.pid(), Signal::SIGKILL).unwrap();
        waitpid(handle.pid(), None).unwrap();
    }
}
