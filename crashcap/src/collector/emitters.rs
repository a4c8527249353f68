// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::UserStream;
use crate::crash_info::{ProcInfo, ReportKind, SigInfo};
use crate::shared::constants::*;
use libc::siginfo_t;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmitterError {
    #[error("Failed to write to output: {0}")]
    WriteError(#[from] std::io::Error),
    #[error("Failed to open file: {0}")]
    FileOpenError(std::io::Error),
    #[error("Failed to serialize section: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Everything a report is made of, gathered by the crash handler or the dump path.
pub(crate) struct ReportSource<'a> {
    pub kind: ReportKind,
    /// `None` if the table could not be read safely.
    pub annotations: Option<BTreeMap<String, String>>,
    /// Null for dumps.
    pub sig_info: *const siginfo_t,
    pub ucontext: &'a [u8],
    pub pid: libc::pid_t,
    pub tid: libc::pid_t,
    pub user_streams: &'a [UserStream],
}

/// Writes the report stream onto `w`.
///
/// Runs in the collector child after a crash, or on the dumping thread. Sections are flushed
/// one by one so the handler gets a partial report if the collector dies midway.
pub(crate) fn emit_report(w: &mut impl Write, source: &ReportSource) -> Result<(), EmitterError> {
    let mut notes = Vec::new();

    emit_kind(w, source.kind)?;
    match &source.annotations {
        Some(annotations) => emit_annotations(w, annotations)?,
        None => {
            emit_annotations(w, &BTreeMap::new())?;
            notes.push("Annotation table was locked at crash time, annotations omitted");
        }
    }
    if !source.sig_info.is_null() {
        emit_siginfo(w, source.sig_info)?;
    }
    emit_procinfo(w, source.pid, source.tid)?;
    if !source.ucontext.is_empty() {
        emit_hex_section(w, CRASHCAP_BEGIN_UCONTEXT, CRASHCAP_END_UCONTEXT, source.ucontext)?;
    }
    for stream in source.user_streams {
        emit_user_stream(w, stream)?;
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    match emit_text_file(w, "/proc/self/maps") {
        Err(EmitterError::FileOpenError(_)) => notes.push("Could not open /proc/self/maps"),
        other => other?,
    }

    if !notes.is_empty() {
        emit_log(w, &notes)?;
    }

    writeln!(w, "{CRASHCAP_DONE}")?;
    w.flush()?;
    Ok(())
}

fn emit_kind(w: &mut impl Write, kind: ReportKind) -> Result<(), EmitterError> {
    writeln!(w, "{CRASHCAP_BEGIN_KIND}")?;
    writeln!(w, "{}", kind.as_str())?;
    writeln!(w, "{CRASHCAP_END_KIND}")?;
    w.flush()?;
    Ok(())
}

fn emit_annotations(
    w: &mut impl Write,
    annotations: &BTreeMap<String, String>,
) -> Result<(), EmitterError> {
    writeln!(w, "{CRASHCAP_BEGIN_ANNOTATIONS}")?;
    serde_json::to_writer(&mut *w, annotations)?;
    writeln!(w)?;
    writeln!(w, "{CRASHCAP_END_ANNOTATIONS}")?;
    w.flush()?;
    Ok(())
}

fn emit_siginfo(w: &mut impl Write, sig_info: *const siginfo_t) -> Result<(), EmitterError> {
    // SAFETY: non-null, handed to us by the kernel through the signal handler.
    let (si_signo, si_code) = unsafe { ((*sig_info).si_signo, (*sig_info).si_code) };

    // https://man7.org/linux/man-pages/man2/sigaction.2.html
    // SIGILL, SIGFPE, SIGSEGV, SIGBUS, and SIGTRAP fill in si_addr with the address of the fault.
    let si_addr = match si_signo {
        libc::SIGILL | libc::SIGFPE | libc::SIGSEGV | libc::SIGBUS | libc::SIGTRAP => {
            Some(unsafe { (*sig_info).si_addr() as usize })
        }
        _ => None,
    };

    writeln!(w, "{CRASHCAP_BEGIN_SIGINFO}")?;
    serde_json::to_writer(&mut *w, &SigInfo::new(si_signo, si_code, si_addr))?;
    writeln!(w)?;
    writeln!(w, "{CRASHCAP_END_SIGINFO}")?;
    w.flush()?;
    Ok(())
}

fn emit_procinfo(w: &mut impl Write, pid: libc::pid_t, tid: libc::pid_t) -> Result<(), EmitterError> {
    writeln!(w, "{CRASHCAP_BEGIN_PROCINFO}")?;
    serde_json::to_writer(
        &mut *w,
        &ProcInfo {
            pid: pid as u32,
            tid,
        },
    )?;
    writeln!(w)?;
    writeln!(w, "{CRASHCAP_END_PROCINFO}")?;
    w.flush()?;
    Ok(())
}

fn emit_user_stream(w: &mut impl Write, stream: &UserStream) -> Result<(), EmitterError> {
    let begin = format!("{CRASHCAP_BEGIN_USER_STREAM} {}", stream.stream_id());
    emit_hex_section(w, &begin, CRASHCAP_END_USER_STREAM, stream.bytes())
}

/// Hex encodes `bytes`, [`USER_STREAM_BYTES_PER_LINE`] bytes per line, without allocating.
fn emit_hex_section(
    w: &mut impl Write,
    begin: &str,
    end: &str,
    bytes: &[u8],
) -> Result<(), EmitterError> {
    let mut line = [0u8; USER_STREAM_BYTES_PER_LINE * 2];
    writeln!(w, "{begin}")?;
    for chunk in bytes.chunks(USER_STREAM_BYTES_PER_LINE) {
        let encoded = &mut line[..chunk.len() * 2];
        // Cannot fail: the output is exactly twice the input.
        let _ = hex::encode_to_slice(chunk, encoded);
        w.write_all(encoded)?;
        writeln!(w)?;
    }
    writeln!(w, "{end}")?;
    w.flush()?;
    Ok(())
}

fn emit_log(w: &mut impl Write, notes: &[&str]) -> Result<(), EmitterError> {
    writeln!(w, "{CRASHCAP_BEGIN_LOG}")?;
    for note in notes {
        writeln!(w, "{note}")?;
    }
    writeln!(w, "{CRASHCAP_END_LOG}")?;
    w.flush()?;
    Ok(())
}

/// Emits a file in the format
///
/// CRASHCAP_BEGIN_FILE <path>
/// <FILE BYTES>
/// CRASHCAP_END_FILE
///
/// The file is copied through a fixed buffer.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn emit_text_file(w: &mut impl Write, path: &str) -> Result<(), EmitterError> {
    let mut file = File::open(path).map_err(EmitterError::FileOpenError)?;
    const BUFFER_LEN: usize = 512;
    let mut buffer = [0u8; BUFFER_LEN];

    writeln!(w, "{CRASHCAP_BEGIN_FILE} {path}")?;
    let mut ends_with_newline = true;
    loop {
        let read_count = file.read(&mut buffer)?;
        if read_count == 0 {
            break;
        }
        w.write_all(&buffer[..read_count])?;
        ends_with_newline = buffer[read_count - 1] == b'\n';
    }
    if !ends_with_newline {
        writeln!(w)?;
    }
    writeln!(w, "{CRASHCAP_END_FILE}")?;
    w.flush()?;
    Ok(())
}
