// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::collector_manager::{Collector, CollectorSpawnError, CrashSnapshot};
use super::handler_process::{HandlerProcess, HandlerSpawnError};
use super::signal_handler_manager::chain_signal_handler;
use super::{FirstChanceHandler, UserStream};
use crate::annotations::AnnotationStore;
use crashcap_common::timeout::TimeoutManager;
use crashcap_common::unix_utils::current_tid;
use libc::{c_void, siginfo_t, ucontext_t};
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicPtr, AtomicU64};
use std::sync::Arc;
use std::time::Duration;

// Note that this file makes use the following async-signal safe functions in a signal handler.
// <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
// - clock_gettime
// - close
// - dup2
// - execve (vfork child)
// - kill
// - poll
// - raise
// - send (first-chance handler)
// - sigaction
// - socketpair
// - write

// Using mutexes inside a signal handler is not allowed, so use `AtomicPtr` instead.
// These are always either null or the result of `Box::into_raw` / `Arc::into_raw`.
static ANNOTATIONS: AtomicPtr<AnnotationStore> = AtomicPtr::new(ptr::null_mut());
static USER_STREAMS: AtomicPtr<Vec<UserStream>> = AtomicPtr::new(ptr::null_mut());
static FIRST_CHANCE_HANDLER: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());
static TIMEOUT_MS: AtomicU64 = AtomicU64::new(5_000);
static UNWIND_WAIT_MS: AtomicU64 = AtomicU64::new(0);
#[cfg(any(target_os = "linux", target_os = "android"))]
static UNWIND_REGION: AtomicPtr<crate::unwind::UnwindRegion> = AtomicPtr::new(ptr::null_mut());

#[derive(Debug, thiserror::Error)]
pub enum CrashHandlerError {
    #[error("Failed to spawn the handler process: {0}")]
    HandlerSpawnError(#[from] HandlerSpawnError),
    #[error("Failed to spawn collector: {0}")]
    CollectorSpawnError(#[from] CollectorSpawnError),
}

/// Makes `annotations` the table read by later crash reports.
/// ATOMICITY:
///     This function uses a swap on an atomic pointer. The previous table is leaked, since a
///     crash in progress may still read it.
pub(crate) fn update_annotations(annotations: Arc<AnnotationStore>) {
    let _ = ANNOTATIONS.swap(Arc::into_raw(annotations).cast_mut(), SeqCst);
}

/// Adds a stream to every later report.
/// SAFETY:
///     Not reentrant: concurrent callers may lose a stream.
pub(crate) fn add_user_stream(stream: UserStream) {
    let mut streams = user_streams();
    streams.push(stream);
    let old = USER_STREAMS.swap(Box::into_raw(Box::new(streams)), SeqCst);
    if !old.is_null() {
        // Safety: This can only come from a box above.
        unsafe { drop(Box::from_raw(old)) };
    }
}

/// The streams registered so far.
pub(crate) fn user_streams() -> Vec<UserStream> {
    let current = USER_STREAMS.load(SeqCst);
    // SAFETY: null or a live box from `add_user_stream`.
    unsafe { current.as_ref() }.cloned().unwrap_or_default()
}

pub(crate) fn set_first_chance_handler(handler: FirstChanceHandler) {
    FIRST_CHANCE_HANDLER.store(handler as *mut (), SeqCst);
}

fn first_chance_handler() -> Option<FirstChanceHandler> {
    let raw = FIRST_CHANCE_HANDLER.load(SeqCst);
    // SAFETY: only ever stored from a `FirstChanceHandler` above.
    (!raw.is_null()).then(|| unsafe { std::mem::transmute::<*mut (), FirstChanceHandler>(raw) })
}

/// `timeout` bounds the whole crash sequence; `unwind_wait` how long of it may be spent waiting
/// for the unwind monitor.
pub(crate) fn update_timeouts(timeout: Duration, unwind_wait: Duration) {
    TIMEOUT_MS.store(timeout.as_millis() as u64, SeqCst);
    UNWIND_WAIT_MS.store(unwind_wait.as_millis() as u64, SeqCst);
}

/// The region whose completion counter signals that the monitor published an unwind result.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn set_unwind_region(region: &'static crate::unwind::UnwindRegion) {
    UNWIND_REGION.store(ptr::from_ref(region).cast_mut(), SeqCst);
}

pub(crate) extern "C" fn handle_posix_sigaction(
    signum: i32,
    sig_info: *mut siginfo_t,
    ucontext: *mut c_void,
) {
    // Handle the signal.  Note this has a guard to ensure that we only generate
    // one crash report per process.
    if let Ok(true) = handle_posix_signal_impl(signum, sig_info, ucontext) {
        return;
    }
    // SAFETY: No preconditions.
    unsafe { chain_signal_handler(signum, sig_info, ucontext) };
}

/// Returns `Ok(true)` when the first-chance handler fully handled the signal.
fn handle_posix_signal_impl(
    signum: i32,
    sig_info: *mut siginfo_t,
    ucontext: *mut c_void,
) -> Result<bool, CrashHandlerError> {
    // One-time guard to guarantee at most one crash per process
    static NUM_TIMES_CALLED: AtomicU64 = AtomicU64::new(0);
    if NUM_TIMES_CALLED.fetch_add(1, SeqCst) > 0 {
        // In the case where some lower-level signal handler recovered the error
        // we don't want to spam the system with calls.  Make this one shot.
        return Ok(false);
    }

    let timeout_manager = TimeoutManager::new(Duration::from_millis(TIMEOUT_MS.load(SeqCst)));
    let crashing_tid = current_tid();

    #[cfg(any(target_os = "linux", target_os = "android"))]
    // SAFETY: null or a leaked, process-lifetime region.
    let unwind_region = unsafe { UNWIND_REGION.load(SeqCst).as_ref() };
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let completions_before = unwind_region.map(|region| region.completions());

    if let Some(handler) = first_chance_handler() {
        if handler(signum, sig_info, ucontext) {
            return Ok(true);
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        if let (Some(region), Some(seen)) = (unwind_region, completions_before) {
            let wait = Duration::from_millis(UNWIND_WAIT_MS.load(SeqCst))
                .min(timeout_manager.remaining_strict());
            let _ = region.wait_for_completion(seen, wait);
        }
    }

    // Leak the annotation table and streams, nothing is dropped during a crash.
    // SAFETY: null or the result of `Arc::into_raw` in `update_annotations`.
    let annotations = unsafe { ANNOTATIONS.load(SeqCst).as_ref() };
    // SAFETY: null or a live box from `add_user_stream`.
    let user_streams = unsafe { USER_STREAMS.load(SeqCst).as_ref() }
        .map(Vec::as_slice)
        .unwrap_or_default();

    let handler = HandlerProcess::spawn_from_stored_launch()?;
    let snapshot = CrashSnapshot {
        annotations,
        user_streams,
        sig_info,
        ucontext: ucontext as *const ucontext_t,
        crashing_tid,
    };
    let collector = Collector::spawn(&handler, &snapshot)?;

    // We're done. Wrap up our interaction with the handler.
    collector.finish(&timeout_manager);
    handler.finish(&timeout_manager);

    Ok(false)
}
