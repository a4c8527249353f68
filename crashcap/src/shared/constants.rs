// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Constants shared between the in-process collector, the unwind monitor and the handler
//! executable.

use std::time::Duration;

// Section delimiters for the report stream written by the collector and parsed by the handler.

/// Whether the report comes from a crash signal or an on-demand dump. One line: `crash` or `dump`.
pub const CRASHCAP_BEGIN_KIND: &str = "CRASHCAP_BEGIN_KIND";
pub const CRASHCAP_END_KIND: &str = "CRASHCAP_END_KIND";

/// The annotation table, serialized as a single JSON object line.
pub const CRASHCAP_BEGIN_ANNOTATIONS: &str = "CRASHCAP_BEGIN_ANNOTATIONS";
pub const CRASHCAP_END_ANNOTATIONS: &str = "CRASHCAP_END_ANNOTATIONS";

/// Signal number, code, human readable names and faulting address, as JSON.
pub const CRASHCAP_BEGIN_SIGINFO: &str = "CRASHCAP_BEGIN_SIGINFO";
pub const CRASHCAP_END_SIGINFO: &str = "CRASHCAP_END_SIGINFO";

/// Pid and tid of the crashing (or dumping) thread, as JSON.
pub const CRASHCAP_BEGIN_PROCINFO: &str = "CRASHCAP_BEGIN_PROCINFO";
pub const CRASHCAP_END_PROCINFO: &str = "CRASHCAP_END_PROCINFO";

/// Raw machine context, hex encoded.
pub const CRASHCAP_BEGIN_UCONTEXT: &str = "CRASHCAP_BEGIN_UCONTEXT";
pub const CRASHCAP_END_UCONTEXT: &str = "CRASHCAP_END_UCONTEXT";

/// A custom data stream. The begin marker is followed by a space and the numeric stream id; the
/// body is the hex encoded region, [`USER_STREAM_BYTES_PER_LINE`] bytes per line.
pub const CRASHCAP_BEGIN_USER_STREAM: &str = "CRASHCAP_BEGIN_USER_STREAM";
pub const CRASHCAP_END_USER_STREAM: &str = "CRASHCAP_END_USER_STREAM";
pub const USER_STREAM_BYTES_PER_LINE: usize = 64;

/// A text file attached verbatim, e.g. `/proc/self/maps`. The begin marker is followed by a
/// space and the file name.
pub const CRASHCAP_BEGIN_FILE: &str = "CRASHCAP_BEGIN_FILE";
pub const CRASHCAP_END_FILE: &str = "CRASHCAP_END_FILE";

/// Notes from the collector about data it could not gather, one per line.
pub const CRASHCAP_BEGIN_LOG: &str = "CRASHCAP_BEGIN_LOG";
pub const CRASHCAP_END_LOG: &str = "CRASHCAP_END_LOG";

/// Last line of a complete report.
pub const CRASHCAP_DONE: &str = "CRASHCAP_DONE";

// Annotation keys with a fixed meaning.

/// Always present, identifies the report format for the backend.
pub const FORMAT_KEY: &str = "format";
pub const FORMAT_VALUE: &str = "minidump";
/// Id of the thread that loaded the library, taken as the application main thread.
pub const MAIN_THREAD_KEY: &str = "thread.main";
/// Overrides the faulting thread of a dump so that it is attributed to the main thread.
pub const FAULTING_TID_KEY: &str = "_mod_faulting_tid";
/// Message attached to exactly one dump and removed right after it.
pub const ERROR_MESSAGE_KEY: &str = "error.message";

// Handler launch arguments.

pub const NO_RATE_LIMIT_ARG: &str = "--no-rate-limit";
pub const ATTACHMENT_ARG_PREFIX: &str = "--attachment=";
pub const ANNOTATION_ARG_PREFIX: &str = "--annotation=";
pub const DATABASE_ARG_PREFIX: &str = "--database=";
pub const URL_ARG_PREFIX: &str = "--url=";

// Client-side unwinding.

/// Size of the region shared with the unwind monitor.
pub const UNWIND_BUFFER_SIZE: usize = 65536;
/// File name of the monitor control socket inside the work directory.
pub const MONITOR_SOCKET_NAME: &str = "bcd.socket";
/// Stream id under which the shared unwind region is published into reports.
pub const DEFAULT_UNWIND_STREAM_ID: u32 = 0x4255_4E00;
/// Oldest platform (Android API level) on which client-side unwinding is offered.
pub const DEFAULT_MIN_UNWIND_PLATFORM_VERSION: u32 = 23;

// Timeouts.

/// Overall deadline for one crash sequence, from the signal to the handler hanging up.
pub const CRASHCAP_DEFAULT_TIMEOUT: Duration = Duration::from_millis(5_000);
/// How long enabling unwinding waits for the monitor to write its pid.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(2_000);
/// How long the crash handler waits for the monitor to publish an unwind result.
pub const DEFAULT_UNWIND_WAIT: Duration = Duration::from_millis(1_500);
/// Environment variable overriding the handler's stream timeout.
pub const HANDLER_TIMEOUT_ENV: &str = "CRASHCAP_HANDLER_TIMEOUT_MS";
