// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Out-of-process crash capture.
//!
//! Architecturally, it consists of three processes:
//! 1. The monitored process. [`CrashCapture`] arms a signal handler for fatal signals. The
//!    handler runs under a constrained environment where many standard operations are illegal
//!    <https://man7.org/linux/man-pages/man7/signal-safety.7.html>, so it only notifies the
//!    unwind monitor, vforks the handler executable, and forks a collector that writes the
//!    report stream to it. It then waits for the handler to hang up and chains to the previous
//!    signal handler.
//! 2. The handler executable (`crashcap-handler`), listening on `stdin`. It parses the stream,
//!    adds what it knows from its launch arguments and the machine, and stores the report in
//!    the crash report database for a later upload. If the stream closes without a report it
//!    exits without writing anything.
//! 3. Optionally, the unwind monitor. It is forked once when client-side unwinding is enabled
//!    and unwinds the crashing thread from the outside on request. Its result travels to the
//!    report through a shared memory region published as a custom data stream.
//!
//! Reports can also be written on demand with [`CrashCapture::dump_without_crash`]. Those go
//! through a regular child process instead of the signal handler.

#[cfg(all(unix, feature = "collector"))]
mod collector;
#[cfg(all(unix, feature = "receiver"))]
mod receiver;
#[cfg(all(unix, feature = "collector"))]
mod service;
#[cfg(all(unix, feature = "collector"))]
mod unwind;

pub mod annotations;
pub mod crash_info;
pub mod database;
pub mod init_state;
pub mod platform;
pub mod shared;

#[cfg(all(unix, feature = "collector"))]
pub use collector::{
    CapturedContext, CrashHandlerClient, CrashHandlerError, EmitterError, FirstChanceHandler,
    HandlerProcessClient, HandlerSpawnError, UserStream, DEFAULT_SIGNALS,
};
#[cfg(all(
    unix,
    feature = "collector",
    any(target_os = "linux", target_os = "android")
))]
pub use unwind::{
    monitor_channel, notify_monitor, start_monitor, MonitorConfig, MonitorError, MonitorHandle,
    ProcfsThreadBackend, SharedBufferError, SharedUnwindBuffer, ThreadUnwinder, UnwindCoordinator,
    UnwindRegion, UnwindRequest, UnwindSetupError, PAYLOAD_CAPACITY, PAYLOAD_OFFSET, REPLY_SIZE,
    REQUEST_SIZE,
};

#[cfg(all(unix, feature = "receiver"))]
pub use receiver::{receiver_entry_point_stdin, HandlerArgs};

#[cfg(all(unix, feature = "collector"))]
pub use service::{crash, CrashCapture};

pub use annotations::AnnotationStore;
pub use crash_info::{CrashReport, ReportKind};
pub use database::{CrashReportDatabase, DatabaseError};
pub use init_state::{InitGuard, InitializationState};
pub use platform::UnwindCapability;
pub use shared::configuration::{Attachment, CaptureOptions, CrashHandlerConfig, HandlerConfigError};
