// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use super::crash_handler::handle_posix_sigaction;
use crate::crash_info::signal_from_signum;
use crashcap_common::unix_utils::terminate;
use libc::{
    c_void, mmap, sigaltstack, siginfo_t, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_NONE, PROT_READ,
    PROT_WRITE, SIGSTKSZ,
};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler};
use std::ptr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;

/// The fatal signals a report is written for.
pub const DEFAULT_SIGNALS: [libc::c_int; 6] = [
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGILL,
    libc::SIGFPE,
    libc::SIGABRT,
    libc::SIGTRAP,
];

// Linux seems to have the most, supporting up to 64 inclusive
// https://man7.org/linux/man-pages/man7/signal.7.html
const MAX_SIGNALS: usize = 65;
static mut HANDLERS: [Option<(signal::Signal, SigAction)>; MAX_SIGNALS] = [None; MAX_SIGNALS];
static INIT_STARTED: AtomicBool = AtomicBool::new(false);
static INIT_FINISHED: AtomicBool = AtomicBool::new(false);

pub(crate) fn handlers_registered() -> bool {
    INIT_STARTED.load(SeqCst)
}

/// Registers the crash handler for `signals`.
/// Only the first call registers anything; later calls return an error.
/// ATOMICITY:
///     If a crash occurs while this function runs, the crash handler may be registered before
///     the previous handler is stored. Chaining then terminates the process instead.
pub(crate) fn register_crash_handlers(
    signals: &[libc::c_int],
    use_alt_stack: bool,
) -> anyhow::Result<()> {
    // Guarantee that the handlers is only mutated once.
    anyhow::ensure!(
        INIT_STARTED
            .compare_exchange(false, true, SeqCst, SeqCst)
            .is_ok(),
        "Attempted to double register crash handlers"
    );

    for signum in signals {
        anyhow::ensure!(*signum > 0 && *signum < MAX_SIGNALS as i32);
    }

    if use_alt_stack {
        // Safety: This function has no documented preconditions.
        unsafe { create_alt_stack()? };
    }

    let mut errors = vec![];
    for signum in signals {
        let index = *signum as usize;
        // Safety: This function has no documented preconditions.
        match unsafe { register_signal_handler(*signum, use_alt_stack) } {
            // SAFETY: `INIT_STARTED` is true and `INIT_FINISHED` false, so this is the only code
            // touching `HANDLERS`.
            Ok(handler) => unsafe { HANDLERS[index] = Some(handler) },
            Err(e) => errors.push(format!("Unable to register signal for {signum}: {e:?}")),
        };
    }
    INIT_FINISHED.store(true, SeqCst);
    anyhow::ensure!(
        errors.is_empty(),
        "Errors registering signal handlers {errors:?}"
    );
    tracing::debug!(target: "crashcap::collector", ?signals, use_alt_stack, "Crash handlers registered");
    Ok(())
}

/// Once we've handled the signal, chain to any previous handlers.
/// If we run into an unexpected condition we just `_exit` to quit the program without re-raising
/// `SIGABRT`.
pub(crate) unsafe fn chain_signal_handler(
    signum: i32,
    sig_info: *mut siginfo_t,
    ucontext: *mut c_void,
) {
    if !INIT_FINISHED.load(SeqCst) || signum < 0 || signum >= MAX_SIGNALS as i32 {
        terminate()
    }
    // SAFETY: `INIT_FINISHED` is true, so nothing mutates `HANDLERS` anymore.
    if let Some((signal, sigaction)) = &mut unsafe { HANDLERS[signum as usize] } {
        // https://man7.org/linux/man-pages/man2/sigaction.2.html
        match sigaction.handler() {
            SigHandler::SigDfl => {
                // Restore the default disposition and re-raise, so a core dump can still be
                // produced. For a real fault, returning re-executes the faulting instruction.
                unsafe { signal::sigaction(*signal, sigaction) }.unwrap_or_else(|_| terminate());
                unsafe { libc::raise(signum) };
            }
            SigHandler::SigIgn => (),
            SigHandler::Handler(f) => f(signum),
            SigHandler::SigAction(f) => f(signum, sig_info, ucontext),
        }
    } else {
        terminate()
    }
}

/// Allocates a signal altstack, and puts a guard page at the end.
/// Inspired by https://github.com/rust-lang/rust/pull/69969/files
unsafe fn create_alt_stack() -> anyhow::Result<()> {
    // The greater of 16 pages or SIGSTKSZ: report emission needs more than the default 8KB.
    let page_size = page_size::get();
    let sigalstack_base_size = std::cmp::max(SIGSTKSZ, 16 * page_size);
    let stackp = mmap(
        ptr::null_mut(),
        sigalstack_base_size + page_size,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANON,
        -1,
        0,
    );
    anyhow::ensure!(
        stackp != MAP_FAILED,
        "failed to allocate an alternative stack"
    );
    let guard_result = libc::mprotect(stackp, page_size, PROT_NONE);
    anyhow::ensure!(
        guard_result == 0,
        "failed to set up alternative stack guard page"
    );
    let stackp = stackp.add(page_size);

    let stack = libc::stack_t {
        ss_sp: stackp,
        ss_flags: 0,
        ss_size: sigalstack_base_size,
    };
    let rval = sigaltstack(&stack, ptr::null_mut());
    anyhow::ensure!(rval == 0, "sigaltstack failed {rval}");
    Ok(())
}

unsafe fn register_signal_handler(
    signum: i32,
    use_alt_stack: bool,
) -> anyhow::Result<(signal::Signal, SigAction)> {
    let signal_type = signal_from_signum(signum)?;
    let extra_saflags = if use_alt_stack {
        SaFlags::SA_ONSTACK
    } else {
        SaFlags::empty()
    };

    let sig_action = SigAction::new(
        SigHandler::SigAction(handle_posix_sigaction),
        SaFlags::SA_NODEFER | extra_saflags,
        signal::SigSet::empty(),
    );

    let old_handler = signal::sigaction(signal_type, &sig_action)?;
    Ok((signal_type, old_handler))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_max_signals() {
        assert!(MAX_SIGNALS as libc::c_int > libc::SIGRTMAX());
    }

    #[test]
    fn test_default_signals_fit() {
        for signum in DEFAULT_SIGNALS {
            assert!(signum > 0 && (signum as usize) < MAX_SIGNALS);
            assert!(signal_from_signum(signum).is_ok());
        }
    }
}
