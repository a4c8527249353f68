// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The in-process side of crash capture: signal handlers, the report stream and the handler
//! process that receives it.

#![cfg(unix)]

mod client;
mod collector_manager;
mod context;
mod crash_handler;
mod emitters;
mod handler_process;
mod process_handle;
mod signal_handler_manager;

pub use client::HandlerProcessClient;
pub use context::CapturedContext;
pub use crash_handler::CrashHandlerError;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use crash_handler::set_unwind_region;
pub use emitters::EmitterError;
pub use handler_process::HandlerSpawnError;
pub use signal_handler_manager::DEFAULT_SIGNALS;

use crate::annotations::AnnotationStore;
use crate::shared::configuration::CrashHandlerConfig;
use libc::{c_void, siginfo_t};
use std::sync::Arc;

/// Called first inside the crash signal handler, before the report is generated.
///
/// Must be async-signal-safe. Returning `true` means the signal was fully handled and no report
/// is written; `false` continues with the normal crash sequence.
pub type FirstChanceHandler = fn(i32, *mut siginfo_t, *mut c_void) -> bool;

/// A memory range copied verbatim into every report under a numeric stream id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserStream {
    stream_id: u32,
    base: *const u8,
    len: usize,
}

// Only the address is shared; the bytes are read when a report is written.
unsafe impl Send for UserStream {}
unsafe impl Sync for UserStream {}

impl UserStream {
    /// # Safety
    /// `base..base + len` must stay mapped and readable for the rest of the process.
    pub unsafe fn new(stream_id: u32, base: *const u8, len: usize) -> Self {
        Self {
            stream_id,
            base,
            len,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The current contents of the range.
    pub fn bytes(&self) -> &[u8] {
        if self.base.is_null() {
            return &[];
        }
        // SAFETY: guaranteed by the contract of `new`.
        unsafe { std::slice::from_raw_parts(self.base, self.len) }
    }
}

/// The crash-handler library as seen by [`crate::CrashCapture`].
pub trait CrashHandlerClient: Send + Sync {
    /// Arms crash handling: the handler process described by `config` is launched for every
    /// crash and dump, and reports carry the contents of `annotations` at that time.
    fn start_handler(
        &self,
        config: &CrashHandlerConfig,
        annotations: Arc<AnnotationStore>,
    ) -> Result<(), HandlerSpawnError>;

    /// Adds a custom data stream to every later report.
    fn add_user_stream(&self, stream: UserStream);

    fn set_first_chance_handler(&self, handler: FirstChanceHandler);

    /// Writes a report for `context` without a crash. Blocks until the handler is done.
    fn dump_without_crash(&self, context: &CapturedContext) -> anyhow::Result<()>;
}
