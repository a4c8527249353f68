// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Unwinding backends run by the monitor.

use serde::Serialize;
use std::fs;
use std::io::Write;

/// Produces the unwind payload for one thread of another process.
///
/// Runs inside the monitor, which has been granted tracing rights over the monitored process.
pub trait ThreadUnwinder: Send {
    /// Called once, lazily, before the first unwind.
    fn initialize(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Writes the result for `tid` of process `pid` into `out` and returns the number of bytes
    /// written.
    fn unwind(&mut self, pid: libc::pid_t, tid: libc::pid_t, out: &mut [u8])
        -> anyhow::Result<usize>;
}

/// Records what the kernel exposes about a thread under `/proc/<pid>/task/<tid>/`: its name,
/// scheduler state, current syscall line (arguments, stack pointer and program counter) and
/// wait channel. The result is one JSON object.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsThreadBackend;

#[derive(Debug, Serialize)]
struct ThreadSnapshot {
    pid: libc::pid_t,
    tid: libc::pid_t,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    syscall: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    wchan: Option<String>,
}

impl ProcfsThreadBackend {
    pub fn new() -> Self {
        Self
    }

    fn read_field(pid: libc::pid_t, tid: libc::pid_t, name: &str) -> Option<String> {
        let contents = fs::read_to_string(format!("/proc/{pid}/task/{tid}/{name}")).ok()?;
        let trimmed = contents.trim_end();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

/// The state letter of a `stat` line. The thread name can hold spaces and parentheses, so the
/// fields are located from the last `)`.
fn parse_stat_state(stat: &str) -> Option<String> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().next().map(str::to_string)
}

impl ThreadUnwinder for ProcfsThreadBackend {
    fn unwind(
        &mut self,
        pid: libc::pid_t,
        tid: libc::pid_t,
        out: &mut [u8],
    ) -> anyhow::Result<usize> {
        let name = Self::read_field(pid, tid, "comm");
        anyhow::ensure!(name.is_some(), "No such thread {tid} in process {pid}");
        let snapshot = ThreadSnapshot {
            pid,
            tid,
            name,
            state: Self::read_field(pid, tid, "stat").and_then(|stat| parse_stat_state(&stat)),
            syscall: Self::read_field(pid, tid, "syscall"),
            wchan: Self::read_field(pid, tid, "wchan").filter(|wchan| wchan != "0"),
        };
        let mut cursor = std::io::Cursor::new(out);
        serde_json::to_writer(&mut cursor, &snapshot)?;
        cursor.flush()?;
        Ok(cursor.position() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat_state() {
        assert_eq!(
            parse_stat_state("1234 (my (odd) thread) S 1 1234 1234").as_deref(),
            Some("S")
        );
        assert_eq!(parse_stat_state("garbage"), None);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_unwind_own_thread() {
        let pid = std::process::id() as libc::pid_t;
        let tid = crashcap_common::unix_utils::current_tid();
        let mut out = vec![0u8; 4096];
        let mut backend = ProcfsThreadBackend::new();
        backend.initialize().unwrap();
        let len = backend.unwind(pid, tid, &mut out).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out[..len]).unwrap();
        assert_eq!(value["tid"], tid);
        assert!(value["name"].is_string());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_unwind_errors() {
        let pid = std::process::id() as libc::pid_t;
        let tid = crashcap_common::unix_utils::current_tid();
        let mut backend = ProcfsThreadBackend::new();
        assert!(backend.unwind(pid, -1, &mut [0u8; 4096]).is_err());
        // Does not fit.
        assert!(backend.unwind(pid, tid, &mut [0u8; 4]).is_err());
    }
}
