// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::crash_info::{CrashReport, CrashReportBuilder, ProcInfo, ReportKind, SigInfo};
use crate::shared::constants::*;
use anyhow::Context;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::io::AsyncBufReadExt;

/// The collector sends data in blocks.
/// This enum tracks which block we're currently in, and, for multi-line blocks,
/// collects the partial data until the block is closed and it can be appended
/// to the report.
#[derive(Debug)]
pub(crate) enum StdinState {
    Annotations,
    Done,
    File(String, Vec<String>),
    Kind,
    Log,
    ProcInfo,
    SigInfo,
    Ucontext(String),
    UserStream(u32, String),
    Waiting,
}

/// A state machine that processes the report stream line by line.
/// Once the end of a block is reached, the block's data is added to `builder`.
pub(crate) fn process_line(
    builder: &mut CrashReportBuilder,
    line: &str,
    state: StdinState,
) -> anyhow::Result<StdinState> {
    let next = match state {
        StdinState::Annotations if line.starts_with(CRASHCAP_END_ANNOTATIONS) => {
            StdinState::Waiting
        }
        StdinState::Annotations => {
            let annotations: BTreeMap<String, String> = serde_json::from_str(line)?;
            builder.with_annotations(annotations)?;
            StdinState::Annotations
        }

        StdinState::Done => {
            builder.with_log_message(
                format!("Unexpected line after crash report finished: {line}"),
                true,
            )?;
            StdinState::Done
        }

        StdinState::File(filename, lines) if line.starts_with(CRASHCAP_END_FILE) => {
            builder.with_file_and_contents(filename, lines)?;
            StdinState::Waiting
        }
        StdinState::File(name, mut contents) => {
            contents.push(line.to_string());
            StdinState::File(name, contents)
        }

        StdinState::Kind if line.starts_with(CRASHCAP_END_KIND) => StdinState::Waiting,
        StdinState::Kind => {
            let kind: ReportKind = line.parse()?;
            builder.with_kind(kind)?;
            StdinState::Kind
        }

        StdinState::Log if line.starts_with(CRASHCAP_END_LOG) => StdinState::Waiting,
        StdinState::Log => {
            builder.with_log_message(line.to_string(), false)?;
            StdinState::Log
        }

        StdinState::ProcInfo if line.starts_with(CRASHCAP_END_PROCINFO) => StdinState::Waiting,
        StdinState::ProcInfo => {
            let proc_info: ProcInfo = serde_json::from_str(line)?;
            builder.with_proc_info(proc_info)?;
            StdinState::ProcInfo
        }

        StdinState::SigInfo if line.starts_with(CRASHCAP_END_SIGINFO) => StdinState::Waiting,
        StdinState::SigInfo => {
            let sig_info: SigInfo = serde_json::from_str(line)?;
            // A crash report stays incomplete until `CRASHCAP_DONE` arrives.
            builder.with_incomplete(true)?;
            builder.with_sig_info(sig_info)?;
            StdinState::SigInfo
        }

        StdinState::Ucontext(hex) if line.starts_with(CRASHCAP_END_UCONTEXT) => {
            builder.with_ucontext(hex)?;
            StdinState::Waiting
        }
        StdinState::Ucontext(mut hex) => {
            hex.push_str(line.trim_end());
            StdinState::Ucontext(hex)
        }

        StdinState::UserStream(stream_id, hex) if line.starts_with(CRASHCAP_END_USER_STREAM) => {
            anyhow::ensure!(
                hex::decode(&hex).is_ok(),
                "User stream {stream_id} is not valid hex"
            );
            builder.with_user_stream(stream_id, hex)?;
            StdinState::Waiting
        }
        StdinState::UserStream(stream_id, mut hex) => {
            hex.push_str(line.trim_end());
            StdinState::UserStream(stream_id, hex)
        }

        StdinState::Waiting if line.starts_with(CRASHCAP_BEGIN_ANNOTATIONS) => {
            StdinState::Annotations
        }
        StdinState::Waiting if line.starts_with(CRASHCAP_BEGIN_FILE) => {
            let filename = line[CRASHCAP_BEGIN_FILE.len()..].trim().to_string();
            StdinState::File(filename, vec![])
        }
        StdinState::Waiting if line.starts_with(CRASHCAP_BEGIN_KIND) => StdinState::Kind,
        StdinState::Waiting if line.starts_with(CRASHCAP_BEGIN_LOG) => StdinState::Log,
        StdinState::Waiting if line.starts_with(CRASHCAP_BEGIN_PROCINFO) => StdinState::ProcInfo,
        StdinState::Waiting if line.starts_with(CRASHCAP_BEGIN_SIGINFO) => StdinState::SigInfo,
        StdinState::Waiting if line.starts_with(CRASHCAP_BEGIN_UCONTEXT) => {
            StdinState::Ucontext(String::new())
        }
        StdinState::Waiting if line.starts_with(CRASHCAP_BEGIN_USER_STREAM) => {
            let stream_id = line[CRASHCAP_BEGIN_USER_STREAM.len()..]
                .trim()
                .parse()
                .with_context(|| format!("Invalid user stream header: {line}"))?;
            StdinState::UserStream(stream_id, String::new())
        }
        StdinState::Waiting if line.starts_with(CRASHCAP_DONE) => {
            builder.with_incomplete(false)?;
            StdinState::Done
        }
        StdinState::Waiting => {
            builder.with_log_message(format!("Unexpected line while receiving report: {line}"), true)?;
            StdinState::Waiting
        }
    };
    Ok(next)
}

/// Listens to `stream`, reading it line by line, until
/// 1. A crash-report is received, in which case it is returned.
/// 2. `stream` closes without sending anything, in which case `None` is returned.
/// 3. `timeout` expires after the first line, in which case what was received so far is
///    returned, marked incomplete.
pub(crate) async fn receive_report_from_stream(
    timeout: Duration,
    stream: impl AsyncBufReadExt + std::marker::Unpin,
) -> anyhow::Result<Option<CrashReport>> {
    let mut builder = CrashReportBuilder::new();
    let mut stdin_state = StdinState::Waiting;
    let mut done = false;

    let mut lines = stream.lines();
    let mut deadline: Option<Instant> = None;
    // Start the timeout counter when the first line is received
    let mut remaining_timeout = Duration::MAX;

    loop {
        let next_line = tokio::time::timeout(remaining_timeout, lines.next_line()).await;
        let Ok(next_line) = next_line else {
            builder.with_log_message(format!("Timeout: {next_line:?}"), true)?;
            break;
        };
        let Ok(next_line) = next_line else {
            builder.with_log_message(format!("IO Error: {next_line:?}"), true)?;
            break;
        };
        let Some(next_line) = next_line else { break };

        match process_line(&mut builder, &next_line, stdin_state) {
            Ok(next_state) => {
                stdin_state = next_state;
                if matches!(stdin_state, StdinState::Done) {
                    done = true;
                    break;
                }
            }
            Err(e) => {
                // If the input is corrupted, stop and salvage what we can
                builder.with_log_message(
                    format!("Unable to process line: {next_line}. Error: {e}"),
                    true,
                )?;
                break;
            }
        }

        if let Some(deadline) = deadline {
            remaining_timeout = deadline.saturating_duration_since(Instant::now());
        } else {
            deadline = Some(Instant::now() + timeout);
            remaining_timeout = timeout;
        }
    }

    if !builder.has_data() {
        return Ok(None);
    }
    if !done {
        builder.with_incomplete(true)?;
    }
    if builder.kind.is_none() {
        builder.with_log_message("Report stream carried no kind".to_string(), true)?;
        builder.with_kind(ReportKind::Crash)?;
    }
    builder.with_timestamp_now()?;
    builder.with_os_info_this_machine()?;
    Ok(Some(builder.build()?))
}
