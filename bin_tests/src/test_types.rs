// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// What `crashcap_bin_test` does once crash capture is initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestMode {
    /// Faults on a null pointer.
    Crash,
    /// Starts the unwind monitor before initializing, then faults.
    CrashWithUnwinding,
    /// Writes a dump with a message attributed to the main thread, then a plain one, and exits.
    Dump,
    /// Writes one dump from a second thread and exits.
    DumpFromThread,
    /// With SIGPIPE at its default disposition, writes a dump larger than a pipe buffer to a
    /// handler that exits without reading, and exits.
    DumpToExitingHandler,
    /// Enables client-side unwinding on a work directory that does not exist.
    UnwindSetupFailure,
}

impl TestMode {
    /// Returns the string representation used in command-line arguments.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Crash => "crash",
            Self::CrashWithUnwinding => "crash_unwind",
            Self::Dump => "dump",
            Self::DumpFromThread => "dump_thread",
            Self::DumpToExitingHandler => "dump_exiting_handler",
            Self::UnwindSetupFailure => "unwind_setup_failure",
        }
    }

    /// Whether the test program is expected to die from a signal.
    pub const fn crashes(self) -> bool {
        matches!(
            self,
            Self::Crash | Self::CrashWithUnwinding | Self::UnwindSetupFailure
        )
    }
}

impl std::fmt::Display for TestMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TestMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crash" => Ok(Self::Crash),
            "crash_unwind" => Ok(Self::CrashWithUnwinding),
            "dump" => Ok(Self::Dump),
            "dump_thread" => Ok(Self::DumpFromThread),
            "dump_exiting_handler" => Ok(Self::DumpToExitingHandler),
            "unwind_setup_failure" => Ok(Self::UnwindSetupFailure),
            _ => Err(format!("Unknown test mode: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_round_trip() {
        for mode in [
            TestMode::Crash,
            TestMode::CrashWithUnwinding,
            TestMode::Dump,
            TestMode::DumpFromThread,
            TestMode::DumpToExitingHandler,
            TestMode::UnwindSetupFailure,
        ] {
            assert_eq!(mode.as_str().parse::<TestMode>(), Ok(mode));
        }
        assert!("nope".parse::<TestMode>().is_err());
    }
}
