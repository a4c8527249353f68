// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The process-wide crash capture service.
//!
//! Everything the hosting application calls goes through [`CrashCapture`]: it owns the
//! annotation table, the run-once initialization guard, the unwind coordinator and the handle to
//! the crash-handler client. Only one instance per process may arm signal handlers; use
//! [`CrashCapture::install`] and [`CrashCapture::global`] outside of tests.

use crate::annotations::AnnotationStore;
use crate::collector::{CapturedContext, CrashHandlerClient, HandlerProcessClient};
use crate::database::CrashReportDatabase;
use crate::init_state::{InitGuard, InitializationState};
use crate::platform::UnwindCapability;
use crate::shared::configuration::{Attachment, CaptureOptions, CrashHandlerConfig};
use crate::shared::constants::*;
use crashcap_common::unix_utils::current_tid;
use crashcap_common::MutexExt;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

#[cfg(any(target_os = "linux", target_os = "android"))]
use crate::unwind::{ProcfsThreadBackend, ThreadUnwinder, UnwindCoordinator};

static GLOBAL: OnceLock<CrashCapture> = OnceLock::new();

pub struct CrashCapture {
    options: CaptureOptions,
    annotations: Arc<AnnotationStore>,
    init: InitGuard,
    #[cfg(any(target_os = "linux", target_os = "android"))]
    unwinding: Mutex<Option<UnwindCoordinator>>,
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    unwinding: Mutex<Option<std::convert::Infallible>>,
    main_tid: Option<libc::pid_t>,
    client: Arc<dyn CrashHandlerClient>,
    capability: UnwindCapability,
}

impl std::fmt::Debug for CrashCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrashCapture")
            .field("options", &self.options)
            .field("init", &self.init.state())
            .field("main_tid", &self.main_tid)
            .field("capability", &self.capability)
            .finish_non_exhaustive()
    }
}

impl CrashCapture {
    /// Creates the process-wide instance on first call. Later calls ignore `options` and return
    /// the existing instance. The calling thread is recorded as the main thread.
    pub fn install(options: CaptureOptions) -> &'static CrashCapture {
        GLOBAL.get_or_init(|| CrashCapture::new(options))
    }

    pub fn global() -> Option<&'static CrashCapture> {
        GLOBAL.get()
    }

    /// A service backed by the real handler client, with the platform capability detected now.
    pub fn new(options: CaptureOptions) -> Self {
        let client = Arc::new(HandlerProcessClient::new(&options));
        let capability = UnwindCapability::detect(options.min_unwind_platform_version);
        Self::with_client(options, client, capability)
    }

    /// A service with injected collaborators.
    pub fn with_client(
        options: CaptureOptions,
        client: Arc<dyn CrashHandlerClient>,
        capability: UnwindCapability,
    ) -> Self {
        Self {
            options,
            annotations: Arc::new(AnnotationStore::new()),
            init: InitGuard::new(),
            unwinding: Mutex::new(None),
            main_tid: Some(current_tid()),
            client,
            capability,
        }
    }

    pub fn options(&self) -> &CaptureOptions {
        &self.options
    }

    pub fn annotations(&self) -> &AnnotationStore {
        &self.annotations
    }

    pub fn state(&self) -> InitializationState {
        self.init.state()
    }

    pub fn capability(&self) -> UnwindCapability {
        self.capability
    }

    pub fn main_tid(&self) -> Option<libc::pid_t> {
        self.main_tid
    }

    /// Configures and starts the crash handler. The work happens at most once; every caller,
    /// concurrent or later, gets the result of that one attempt.
    ///
    /// `keys` and `values` are paired by index. If their lengths differ no attribute is used, and
    /// initialization still proceeds. `enable_unwinding` wires in the unwind monitor, which must
    /// have been started with [`Self::enable_client_side_unwinding`] beforehand.
    #[allow(clippy::too_many_arguments)]
    pub fn initialize(
        &self,
        url: &str,
        database: impl AsRef<Path>,
        handler: impl AsRef<Path>,
        keys: &[String],
        values: &[String],
        attachments: &[PathBuf],
        enable_unwinding: bool,
    ) -> bool {
        self.init.run_once(|| {
            match self.initialize_impl(
                url,
                database.as_ref(),
                handler.as_ref(),
                keys,
                values,
                attachments,
                enable_unwinding,
            ) {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(target: "crashcap::init", "Crash capture initialization failed: {e:#}");
                    false
                }
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn initialize_impl(
        &self,
        url: &str,
        database: &Path,
        handler: &Path,
        keys: &[String],
        values: &[String],
        attachments: &[PathBuf],
        enable_unwinding: bool,
    ) -> anyhow::Result<()> {
        let mut annotations = BTreeMap::new();
        annotations.insert(FORMAT_KEY.to_string(), FORMAT_VALUE.to_string());
        if let Some(tid) = self.main_tid {
            annotations.insert(MAIN_THREAD_KEY.to_string(), tid.to_string());
        }
        if keys.len() == values.len() {
            annotations.extend(keys.iter().cloned().zip(values.iter().cloned()));
        } else {
            tracing::error!(
                target: "crashcap::init",
                keys = keys.len(),
                values = values.len(),
                "Attribute array length doesn't match. Attributes won't be available in crash reports"
            );
        }

        let attachments = attachments
            .iter()
            .filter_map(|path| match Attachment::from_path(path) {
                Ok(attachment) => Some(attachment),
                Err(e) => {
                    tracing::warn!(target: "crashcap::init", "Skipping attachment: {e}");
                    None
                }
            })
            .collect();

        let config = CrashHandlerConfig::new(
            url,
            database,
            handler,
            vec![NO_RATE_LIMIT_ARG.to_string()],
            attachments,
            annotations.clone(),
        )?
        .with_handler_stderr(self.options.handler_stderr.clone());

        let database = CrashReportDatabase::initialize(config.database())?;
        database.set_uploads_enabled(true)?;

        {
            let mut table = self.annotations.lock();
            for (key, value) in annotations {
                table.set(key, value);
            }
        }

        self.client
            .start_handler(&config, Arc::clone(&self.annotations))?;
        tracing::info!(
            target: "crashcap::init",
            url,
            database = %config.database().display(),
            "Crash handler started"
        );

        self.wire_unwinding(enable_unwinding);
        Ok(())
    }

    /// Publishes the shared region into reports and installs the first-chance handler, if the
    /// monitor was started and the platform supports it.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn wire_unwinding(&self, enable_unwinding: bool) {
        let unwinding = self.unwinding.lock_or_recover();
        let Some(coordinator) = unwinding.as_ref() else {
            if enable_unwinding {
                tracing::warn!(
                    target: "crashcap::init",
                    "Client-side unwinding requested but not enabled before initialization"
                );
            }
            return;
        };
        if !self.capability.is_supported() {
            tracing::warn!(target: "crashcap::init", capability = ?self.capability, "Client-side unwinding is not supported");
            return;
        }
        self.client
            .add_user_stream(coordinator.user_stream(self.options.unwind_stream_id));
        crate::collector::set_unwind_region(coordinator.region());
        crate::unwind::set_monitor_channel(coordinator.channel_fd());
        self.client
            .set_first_chance_handler(crate::unwind::notify_monitor);
        tracing::info!(
            target: "crashcap::init",
            stream_id = self.options.unwind_stream_id,
            "Client-side unwinding wired into crash reports"
        );
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn wire_unwinding(&self, enable_unwinding: bool) {
        if enable_unwinding {
            tracing::warn!(target: "crashcap::init", "Client-side unwinding is not available on this platform");
        }
    }

    /// Starts the unwind monitor on `<work_dir>/bcd.socket` with the built-in backend.
    ///
    /// Must be called before [`Self::initialize`]. Returns `false` afterwards or on unsupported
    /// platforms. Aborts the process if the monitor cannot be brought up.
    pub fn enable_client_side_unwinding(&self, work_dir: impl AsRef<Path>) -> bool {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            self.enable_client_side_unwinding_with(work_dir, Box::new(ProcfsThreadBackend::new()))
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            let _ = work_dir;
            tracing::warn!(target: "crashcap::unwind", "Client-side unwinding is not available on this platform");
            false
        }
    }

    /// Like [`Self::enable_client_side_unwinding`], with a caller-supplied unwinding backend.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn enable_client_side_unwinding_with(
        &self,
        work_dir: impl AsRef<Path>,
        backend: Box<dyn ThreadUnwinder>,
    ) -> bool {
        // Held across the state check so `initialize` cannot slip in between.
        let mut unwinding = self.unwinding.lock_or_recover();
        if self.init.state() != InitializationState::Uninitialized {
            tracing::error!(
                target: "crashcap::unwind",
                "Client-side unwinding support must be enabled before initialization"
            );
            return false;
        }
        if !self.capability.is_supported() {
            tracing::warn!(
                target: "crashcap::unwind",
                capability = ?self.capability,
                minimum = self.options.min_unwind_platform_version,
                "Client-side unwinding is not supported on this platform version"
            );
            return false;
        }
        if unwinding.is_some() {
            tracing::debug!(target: "crashcap::unwind", "Client-side unwinding already enabled");
            return true;
        }

        match UnwindCoordinator::start(
            work_dir.as_ref(),
            backend,
            self.options.handshake_timeout,
        ) {
            Ok(coordinator) => {
                *unwinding = Some(coordinator);
                true
            }
            Err(e) => {
                tracing::error!(
                    target: "crashcap::unwind",
                    "Could not set up client-side unwinding, aborting: {e}"
                );
                std::process::abort();
            }
        }
    }

    /// Whether the unwind monitor is running.
    pub fn unwinding_enabled(&self) -> bool {
        self.unwinding.lock_or_recover().is_some()
    }

    /// The shared unwind region, once unwinding is enabled.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn unwind_region(&self) -> Option<&'static crate::unwind::UnwindRegion> {
        self.unwinding
            .lock_or_recover()
            .as_ref()
            .map(UnwindCoordinator::region)
    }

    /// The pid of the unwind monitor, once unwinding is enabled.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn unwind_monitor_pid(&self) -> Option<libc::pid_t> {
        self.unwinding
            .lock_or_recover()
            .as_ref()
            .map(|coordinator| coordinator.monitor_pid().as_raw())
    }

    /// Sets an annotation on every later report. A no-op before successful initialization.
    pub fn add_attribute(&self, key: &str, value: &str) {
        if self.init.state() != InitializationState::Initialized(true) {
            tracing::warn!(
                target: "crashcap::annotations",
                key,
                "Crash capture isn't initialized, attribute dropped"
            );
            return;
        }
        self.annotations.set(key, value);
    }

    /// Writes a report of the calling thread without crashing.
    ///
    /// `message` is attached to this report only. With `mark_main_thread_faulting` the report
    /// attributes the fault to the main thread. A no-op before successful initialization.
    pub fn dump_without_crash(&self, message: Option<&str>, mark_main_thread_faulting: bool) {
        if self.init.state() != InitializationState::Initialized(true) {
            tracing::warn!(
                target: "crashcap::dump",
                "Crash capture isn't initialized, dump skipped"
            );
            return;
        }
        let context = CapturedContext::capture();

        if message.is_some() || mark_main_thread_faulting {
            let mut table = self.annotations.lock();
            if mark_main_thread_faulting {
                match self.main_tid {
                    Some(tid) => table.set(FAULTING_TID_KEY, tid.to_string()),
                    None => tracing::warn!(target: "crashcap::dump", "Main thread id unknown"),
                }
            }
            if let Some(message) = message {
                table.set(ERROR_MESSAGE_KEY, message);
            }
        }

        if let Err(e) = self.client.dump_without_crash(&context) {
            tracing::error!(target: "crashcap::dump", "Dump without crash failed: {e:#}");
        }

        self.annotations.remove(ERROR_MESSAGE_KEY);
    }

    /// Faults on purpose, to check the pipeline end to end.
    pub fn crash(&self) {
        crash()
    }
}

/// Writes through a null pointer.
#[inline(never)]
pub fn crash() {
    // SAFETY: not safe at all, this is the point.
    unsafe {
        std::ptr::write_volatile(std::hint::black_box(std::ptr::null_mut::<i32>()), 0);
    }
}
