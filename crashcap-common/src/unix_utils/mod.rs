// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

mod errors;
mod execve;
mod file_ops;
mod fork;
mod process;

pub use errors::{PollError, ReapError};
pub use execve::{PreparedExecve, PreparedExecveError};
pub use file_ops::open_file_or_quiet;
pub use fork::alt_fork;
pub use process::{
    current_tid, reap_child_non_blocking, signal_safe_sleep, terminate, wait_for_pollhup,
};
