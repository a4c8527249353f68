// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client-side unwinding through a companion monitor process.
//!
//! The monitored process forks a monitor once, shares a memory region with it and keeps a
//! connected socket to it. When a crash signal arrives, [`notify_monitor`] sends the crashing
//! thread id over that socket; the monitor unwinds the thread from the outside, writes the
//! result into the shared region and bumps its completion counter. The report then carries the
//! region as a custom data stream.

#![cfg(any(target_os = "linux", target_os = "android"))]

mod backend;
mod coordinator;
mod first_chance;
mod monitor;
mod protocol;
mod shared_buffer;

pub use backend::{ProcfsThreadBackend, ThreadUnwinder};
pub use coordinator::{UnwindCoordinator, UnwindSetupError};
pub(crate) use first_chance::set_monitor_channel;
pub use first_chance::{monitor_channel, notify_monitor};
pub use monitor::{start_monitor, MonitorConfig, MonitorError, MonitorHandle};
pub use protocol::{UnwindRequest, REPLY_SIZE, REQUEST_SIZE};
pub use shared_buffer::{
    SharedBufferError, SharedUnwindBuffer, UnwindRegion, PAYLOAD_CAPACITY, PAYLOAD_OFFSET,
};
