// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crashcap_common::unix_utils::current_tid;

/// The machine context of a thread that did not fault, for on-demand dumps.
pub struct CapturedContext {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    context: crash_context::ucontext_t,
    tid: libc::pid_t,
}

impl std::fmt::Debug for CapturedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturedContext")
            .field("tid", &self.tid)
            .field("len", &self.as_bytes().len())
            .finish()
    }
}

impl CapturedContext {
    /// Captures the registers of the calling thread at this call site.
    #[inline(never)]
    pub fn capture() -> Self {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            // SAFETY: `ucontext_t` is plain data for which all-zero is valid, and
            // `crash_context_getcontext` only writes into it.
            let mut context: crash_context::ucontext_t = unsafe { std::mem::zeroed() };
            unsafe { crash_context::crash_context_getcontext(&mut context) };
            Self {
                context,
                tid: current_tid(),
            }
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            Self { tid: current_tid() }
        }
    }

    pub fn tid(&self) -> libc::pid_t {
        self.tid
    }

    /// The raw context as laid out by the platform. Empty where capture is not supported.
    pub fn as_bytes(&self) -> &[u8] {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            // SAFETY: a plain `repr(C)` struct viewed as bytes for its own size.
            unsafe {
                std::slice::from_raw_parts(
                    (&self.context as *const crash_context::ucontext_t).cast::<u8>(),
                    std::mem::size_of::<crash_context::ucontext_t>(),
                )
            }
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            &[]
        }
    }
}
