// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::crash_handler::{
    add_user_stream, set_first_chance_handler, update_annotations, update_timeouts, user_streams,
};
use super::emitters::{emit_report, ReportSource};
use super::handler_process::{update_stored_launch, HandlerLaunch, HandlerSpawnError};
use super::signal_handler_manager::{handlers_registered, register_crash_handlers};
use super::{CapturedContext, CrashHandlerClient, FirstChanceHandler, UserStream, DEFAULT_SIGNALS};
use crate::annotations::AnnotationStore;
use crate::crash_info::ReportKind;
use crate::shared::configuration::{CaptureOptions, CrashHandlerConfig};
use crate::shared::constants::HANDLER_TIMEOUT_ENV;
use anyhow::Context;
use crashcap_common::timeout::TimeoutManager;
use crashcap_common::MutexExt;
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};
use std::fs::OpenOptions;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The production client: crashes are reported from the signal handler through a vfork'd
/// handler process, dumps through a regular child process.
#[derive(Debug)]
pub struct HandlerProcessClient {
    timeout: Duration,
    unwind_wait: Duration,
    use_alt_stack: bool,
    started: Mutex<Option<(CrashHandlerConfig, Arc<AnnotationStore>)>>,
}

impl HandlerProcessClient {
    pub fn new(options: &CaptureOptions) -> Self {
        Self {
            timeout: options.timeout,
            unwind_wait: options.unwind_wait,
            use_alt_stack: options.use_alt_stack,
            started: Mutex::new(None),
        }
    }

    fn handler_command(&self, config: &CrashHandlerConfig) -> anyhow::Result<Command> {
        let stderr = match config.handler_stderr() {
            Some(path) => Stdio::from(
                OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(path)
                    .with_context(|| format!("Failed to open {path:?}"))?,
            ),
            None => Stdio::null(),
        };
        let mut command = Command::new(config.handler());
        command
            .args(config.handler_argv().iter().skip(1))
            .env(HANDLER_TIMEOUT_ENV, self.timeout.as_millis().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(stderr);
        Ok(command)
    }
}

impl CrashHandlerClient for HandlerProcessClient {
    fn start_handler(
        &self,
        config: &CrashHandlerConfig,
        annotations: Arc<AnnotationStore>,
    ) -> Result<(), HandlerSpawnError> {
        update_stored_launch(HandlerLaunch::new(config, self.timeout)?);
        update_annotations(Arc::clone(&annotations));
        update_timeouts(self.timeout, self.unwind_wait);
        if !handlers_registered() {
            register_crash_handlers(&DEFAULT_SIGNALS, self.use_alt_stack)
                .map_err(HandlerSpawnError::SignalHandlers)?;
        }
        *self.started.lock_or_recover() = Some((config.clone(), annotations));
        tracing::info!(
            target: "crashcap::collector",
            handler = %config.handler().display(),
            database = %config.database().display(),
            "Crash handler armed"
        );
        Ok(())
    }

    fn add_user_stream(&self, stream: UserStream) {
        add_user_stream(stream);
    }

    fn set_first_chance_handler(&self, handler: FirstChanceHandler) {
        set_first_chance_handler(handler);
    }

    fn dump_without_crash(&self, context: &CapturedContext) -> anyhow::Result<()> {
        let (config, annotations) = self
            .started
            .lock_or_recover()
            .clone()
            .context("The crash handler was not started")?;

        let mut child = self
            .handler_command(&config)?
            .spawn()
            .with_context(|| format!("Failed to spawn {:?}", config.handler()))?;

        let streams = user_streams();
        let source = ReportSource {
            kind: ReportKind::Dump,
            annotations: Some(annotations.snapshot()),
            sig_info: std::ptr::null(),
            ucontext: context.as_bytes(),
            pid: std::process::id() as libc::pid_t,
            tid: context.tid(),
            user_streams: &streams,
        };
        let emitted = match child.stdin.take() {
            // Dropping stdin closes it, which ends the stream for the handler.
            Some(mut stdin) => with_sigpipe_blocked(|| emit_report(&mut stdin, &source))
                .context("Failed to write the dump"),
            None => Err(anyhow::anyhow!("Handler stdin is not piped")),
        };

        let timeout_manager = TimeoutManager::new(self.timeout);
        loop {
            if let Some(status) = child.try_wait()? {
                emitted?;
                anyhow::ensure!(status.success(), "Handler exited with {status}");
                return Ok(());
            }
            if timeout_manager.expired() {
                let _ = child.kill();
                let _ = child.wait();
                emitted?;
                anyhow::bail!("Handler did not finish within {:?}", self.timeout);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

/// Runs `f` with SIGPIPE blocked on this thread, so a handler that exits early turns into
/// `EPIPE` instead of killing a host that keeps the default disposition. A SIGPIPE raised
/// meanwhile is consumed before the mask is restored; one already pending is left alone.
fn with_sigpipe_blocked<R>(f: impl FnOnce() -> R) -> R {
    let mut sigpipe = SigSet::empty();
    sigpipe.add(Signal::SIGPIPE);
    let mut previous = SigSet::empty();
    let blocked =
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&sigpipe), Some(&mut previous)).is_ok();
    let was_pending = sigpipe_pending();

    let result = f();

    if blocked {
        if !was_pending && sigpipe_pending() {
            let mut signo: libc::c_int = 0;
            // SAFETY: SIGPIPE is pending and blocked, so this returns immediately.
            unsafe { libc::sigwait(sigpipe.as_ref(), &mut signo) };
        }
        let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&previous), None);
    }
    result
}

fn sigpipe_pending() -> bool {
    let mut pending = std::mem::MaybeUninit::<libc::sigset_t>::uninit();
    // SAFETY: the set is initialized by `sigemptyset` before it is filled or read.
    unsafe {
        libc::sigemptyset(pending.as_mut_ptr());
        libc::sigpending(pending.as_mut_ptr()) == 0
            && libc::sigismember(pending.as_ptr(), libc::SIGPIPE) == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn write_script(path: &Path, body: &str) {
        std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn client() -> HandlerProcessClient {
        HandlerProcessClient::new(&CaptureOptions {
            timeout: Duration::from_secs(5),
            ..Default::default()
        })
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_sigpipe_mask_is_restored() {
        let value = with_sigpipe_blocked(|| {
            assert!(SigSet::thread_get_mask().unwrap().contains(Signal::SIGPIPE));
            7
        });
        assert_eq!(value, 7);
        assert!(!SigSet::thread_get_mask().unwrap().contains(Signal::SIGPIPE));
    }

    #[test]
    fn test_dump_requires_start() {
        let context = CapturedContext::capture();
        assert!(client().dump_without_crash(&context).is_err());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_dump_streams_report_to_handler() {
        let dir = tempfile::tempdir().unwrap();
        let handler = dir.path().join("handler.sh");
        let output = dir.path().join("report.txt");
        write_script(
            &handler,
            &format!("echo \"$@\" > {0}.args\ncat > {0}", output.display()),
        );
        let config = CrashHandlerConfig::new(
            "https://u",
            dir.path().join("db"),
            &handler,
            vec![],
            vec![],
            BTreeMap::new(),
        )
        .unwrap();

        // Same as `start_handler` minus the signal handlers, which would outlive this test.
        let client = client();
        let annotations = Arc::new(AnnotationStore::new());
        annotations.set("key", "value");
        *client.started.lock_or_recover() = Some((config, Arc::clone(&annotations)));

        let context = CapturedContext::capture();
        client.dump_without_crash(&context).unwrap();

        let report = std::fs::read_to_string(&output).unwrap();
        assert!(report.starts_with("CRASHCAP_BEGIN_KIND\ndump\n"));
        assert!(report.contains("{\"key\":\"value\"}"));
        assert!(report.contains(&format!("\"tid\":{}", context.tid())));
        assert!(report.ends_with("CRASHCAP_DONE\n"));
        let args = std::fs::read_to_string(format!("{}.args", output.display())).unwrap();
        assert!(args.contains("--url=https://u"));
        assert!(args.contains("--no-rate-limit"));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_dump_reports_handler_failure() {
        let dir = tempfile::tempdir().unwrap();
        let handler = dir.path().join("handler.sh");
        write_script(&handler, "cat > /dev/null\nexit 3");
        let config =
            CrashHandlerConfig::new("u", "/db", &handler, vec![], vec![], BTreeMap::new()).unwrap();
        let client = client();
        *client.started.lock_or_recover() = Some((config, Arc::new(AnnotationStore::new())));
        let err = client
            .dump_without_crash(&CapturedContext::capture())
            .unwrap_err();
        assert!(err.to_string().contains("exited"));
    }
}
