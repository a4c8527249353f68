// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub si_addr: Option<String>,
    pub si_code: libc::c_int,
    pub si_code_human_readable: SiCodes,
    pub si_signo: libc::c_int,
    pub si_signo_human_readable: SignalNames,
}

impl SigInfo {
    pub fn new(si_signo: libc::c_int, si_code: libc::c_int, si_addr: Option<usize>) -> Self {
        Self {
            si_addr: si_addr.map(|addr| format!("{addr:#018x}")),
            si_code,
            si_code_human_readable: translate_si_code(si_signo, si_code),
            si_signo,
            si_signo_human_readable: si_signo.into(),
        }
    }
}

/// The signals a crash handler can be registered for, plus the ones commonly used to trigger
/// a dump by hand. See <https://man7.org/linux/man-pages/man7/signal.7.html>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum SignalNames {
    SIGABRT,
    SIGBUS,
    SIGFPE,
    SIGILL,
    SIGKILL,
    SIGQUIT,
    SIGSEGV,
    SIGSYS,
    SIGTRAP,
    SIGUSR1,
    SIGUSR2,
    UNKNOWN,
}

impl From<libc::c_int> for SignalNames {
    fn from(value: libc::c_int) -> Self {
        match value {
            libc::SIGABRT => SignalNames::SIGABRT,
            libc::SIGBUS => SignalNames::SIGBUS,
            libc::SIGFPE => SignalNames::SIGFPE,
            libc::SIGILL => SignalNames::SIGILL,
            libc::SIGKILL => SignalNames::SIGKILL,
            libc::SIGQUIT => SignalNames::SIGQUIT,
            libc::SIGSEGV => SignalNames::SIGSEGV,
            libc::SIGSYS => SignalNames::SIGSYS,
            libc::SIGTRAP => SignalNames::SIGTRAP,
            libc::SIGUSR1 => SignalNames::SIGUSR1,
            libc::SIGUSR2 => SignalNames::SIGUSR2,
            _ => SignalNames::UNKNOWN,
        }
    }
}

pub fn signal_from_signum(value: libc::c_int) -> anyhow::Result<nix::sys::signal::Signal> {
    nix::sys::signal::Signal::try_from(value)
        .map_err(|_| anyhow::anyhow!("Unexpected signal number {value}"))
}

/// See <https://man7.org/linux/man-pages/man2/sigaction.2.html>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms, non_camel_case_types)]
pub enum SiCodes {
    BUS_ADRALN,
    BUS_ADRERR,
    BUS_MCEERR_AO,
    BUS_MCEERR_AR,
    BUS_OBJERR,
    FPE_FLTDIV,
    FPE_FLTINV,
    FPE_FLTOVF,
    FPE_FLTRES,
    FPE_FLTSUB,
    FPE_FLTUND,
    FPE_INTDIV,
    FPE_INTOVF,
    ILL_BADSTK,
    ILL_COPROC,
    ILL_ILLADR,
    ILL_ILLOPC,
    ILL_ILLOPN,
    ILL_ILLTRP,
    ILL_PRVOPC,
    ILL_PRVREG,
    SEGV_ACCERR,
    SEGV_BNDERR,
    SEGV_MAPERR,
    SEGV_PKUERR,
    SI_ASYNCIO,
    SI_KERNEL,
    SI_MESGQ,
    SI_QUEUE,
    SI_SIGIO,
    SI_TIMER,
    SI_TKILL,
    SI_USER,
    TRAP_BRKPT,
    TRAP_TRACE,
    UNKNOWN,
}

/// Values from the kernel's `asm-generic/siginfo.h`. Signal specific codes are positive, the
/// generic sender codes are zero or negative.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn translate_si_code(signum: libc::c_int, si_code: libc::c_int) -> SiCodes {
    match (signum, si_code) {
        (_, 0) => SiCodes::SI_USER,
        (_, 0x80) => SiCodes::SI_KERNEL,
        (_, -1) => SiCodes::SI_QUEUE,
        (_, -2) => SiCodes::SI_TIMER,
        (_, -3) => SiCodes::SI_MESGQ,
        (_, -4) => SiCodes::SI_ASYNCIO,
        (_, -5) => SiCodes::SI_SIGIO,
        (_, -6) => SiCodes::SI_TKILL,
        (libc::SIGSEGV, 1) => SiCodes::SEGV_MAPERR,
        (libc::SIGSEGV, 2) => SiCodes::SEGV_ACCERR,
        (libc::SIGSEGV, 3) => SiCodes::SEGV_BNDERR,
        (libc::SIGSEGV, 4) => SiCodes::SEGV_PKUERR,
        (libc::SIGBUS, 1) => SiCodes::BUS_ADRALN,
        (libc::SIGBUS, 2) => SiCodes::BUS_ADRERR,
        (libc::SIGBUS, 3) => SiCodes::BUS_OBJERR,
        (libc::SIGBUS, 4) => SiCodes::BUS_MCEERR_AR,
        (libc::SIGBUS, 5) => SiCodes::BUS_MCEERR_AO,
        (libc::SIGILL, 1) => SiCodes::ILL_ILLOPC,
        (libc::SIGILL, 2) => SiCodes::ILL_ILLOPN,
        (libc::SIGILL, 3) => SiCodes::ILL_ILLADR,
        (libc::SIGILL, 4) => SiCodes::ILL_ILLTRP,
        (libc::SIGILL, 5) => SiCodes::ILL_PRVOPC,
        (libc::SIGILL, 6) => SiCodes::ILL_PRVREG,
        (libc::SIGILL, 7) => SiCodes::ILL_COPROC,
        (libc::SIGILL, 8) => SiCodes::ILL_BADSTK,
        (libc::SIGFPE, 1) => SiCodes::FPE_INTDIV,
        (libc::SIGFPE, 2) => SiCodes::FPE_INTOVF,
        (libc::SIGFPE, 3) => SiCodes::FPE_FLTDIV,
        (libc::SIGFPE, 4) => SiCodes::FPE_FLTOVF,
        (libc::SIGFPE, 5) => SiCodes::FPE_FLTUND,
        (libc::SIGFPE, 6) => SiCodes::FPE_FLTRES,
        (libc::SIGFPE, 7) => SiCodes::FPE_FLTINV,
        (libc::SIGFPE, 8) => SiCodes::FPE_FLTSUB,
        (libc::SIGTRAP, 1) => SiCodes::TRAP_BRKPT,
        (libc::SIGTRAP, 2) => SiCodes::TRAP_TRACE,
        _ => SiCodes::UNKNOWN,
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn translate_si_code(_signum: libc::c_int, _si_code: libc::c_int) -> SiCodes {
    SiCodes::UNKNOWN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_names() {
        assert_eq!(SignalNames::from(libc::SIGSEGV), SignalNames::SIGSEGV);
        assert_eq!(SignalNames::from(libc::SIGWINCH), SignalNames::UNKNOWN);
        assert!(signal_from_signum(libc::SIGBUS).is_ok());
        assert!(signal_from_signum(4242).is_err());
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_si_code() {
        assert_eq!(translate_si_code(libc::SIGSEGV, 2), SiCodes::SEGV_ACCERR);
        assert_eq!(translate_si_code(libc::SIGBUS, 2), SiCodes::BUS_ADRERR);
        assert_eq!(translate_si_code(libc::SIGSEGV, -6), SiCodes::SI_TKILL);
        assert_eq!(translate_si_code(libc::SIGSEGV, 42), SiCodes::UNKNOWN);
    }

    #[test]
    fn test_siginfo_formats_address() {
        let info = SigInfo::new(libc::SIGSEGV, 1, Some(0x1234));
        assert_eq!(info.si_addr.as_deref(), Some("0x0000000000001234"));
        assert_eq!(info.si_signo_human_readable, SignalNames::SIGSEGV);
        let json = serde_json::to_string(&info).unwrap();
        let parsed: SigInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, info);
    }
}
