// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The handler executable's side of the report stream.
//!
//! ```text
//! ┌─────────────────────┐   socketpair on stdin   ┌─────────────────────┐
//! │ Collector           │────────────────────────►│ crashcap-handler    │
//! │ (writes sections)   │                         │ (parses, persists)  │
//! └─────────────────────┘                         └─────────────────────┘
//! ```
//!
//! The handler is launched with crashpad-style flags describing where reports go and what to
//! attach to them; see [`HandlerArgs`].

use super::receive_report::receive_report_from_stream;
use crate::crash_info::{AttachmentRecord, CrashReport};
use crate::database::CrashReportDatabase;
use crate::shared::constants::*;
use anyhow::Context;
use clap::{ArgAction, CommandFactory, Parser};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

/// The command line of the handler executable. Flags carry their value after `=`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Parser)]
#[command(name = "crashcap-handler")]
#[command(about = "Reads one crash report on stdin and stores it in a crash report database")]
pub struct HandlerArgs {
    /// Crash report database directory
    #[arg(long)]
    pub database: PathBuf,
    /// Where the report is uploaded later
    #[arg(long, default_value = "")]
    pub url: String,
    /// KEY=VALUE annotation added under the ones from the stream
    #[arg(long = "annotation", value_name = "KEY=VALUE", value_parser = parse_annotation, action = ArgAction::Append)]
    pub annotations: Vec<(String, String)>,
    /// NAME=PATH file attached to the report
    #[arg(long = "attachment", value_name = "NAME=PATH", value_parser = parse_attachment, action = ArgAction::Append)]
    pub attachments: Vec<(String, PathBuf)>,
    #[arg(long)]
    pub no_rate_limit: bool,
}

impl HandlerArgs {
    /// Parses everything after argv[0]. Unknown flags are logged and skipped.
    pub fn parse(args: impl IntoIterator<Item = String>) -> anyhow::Result<Self> {
        let command = Self::command();
        let known: Vec<String> = command
            .get_arguments()
            .filter_map(|arg| arg.get_long())
            .map(|long| format!("--{long}"))
            .collect();
        let args = args.into_iter().filter(|arg| {
            let flag = arg.split_once('=').map_or(arg.as_str(), |(flag, _)| flag);
            let keep = known.iter().any(|known| known == flag);
            if !keep {
                tracing::warn!(target: "crashcap::receiver", "Ignoring unknown argument {arg:?}");
            }
            keep
        });
        let argv = std::iter::once(command.get_name().to_string()).chain(args);
        Ok(Self::try_parse_from(argv)?)
    }
}

fn parse_annotation(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {value:?}")),
    }
}

fn parse_attachment(value: &str) -> Result<(String, PathBuf), String> {
    match value.split_once('=') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => {
            Ok((name.to_string(), PathBuf::from(path)))
        }
        _ => Err(format!("expected NAME=PATH, got {value:?}")),
    }
}

/*-----------------------------------------
|                Public API               |
------------------------------------------*/

/// Reads one report from stdin and stores it in the database named on the command line.
pub fn receiver_entry_point_stdin() -> anyhow::Result<()> {
    let args = HandlerArgs::parse(std::env::args().skip(1))?;
    let stream = BufReader::new(tokio::io::stdin());
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(receiver_entry_point(&args, receiver_timeout(), stream))?;
    Ok(())
}

/// Parses the stream into a report and persists it as pending. Returns where it was written,
/// or `None` if the stream was empty.
pub(crate) async fn receiver_entry_point(
    args: &HandlerArgs,
    timeout: Duration,
    stream: impl AsyncBufReadExt + std::marker::Unpin,
) -> anyhow::Result<Option<PathBuf>> {
    let Some(mut report) = receive_report_from_stream(timeout, stream).await? else {
        tracing::debug!(target: "crashcap::receiver", "Empty report stream, nothing to store");
        return Ok(None);
    };
    apply_launch_arguments(&mut report, args);

    let database = CrashReportDatabase::initialize(&args.database)
        .with_context(|| format!("Failed to open the report database {:?}", args.database))?;
    let path = database.write_pending(&report)?;
    tracing::info!(
        target: "crashcap::receiver",
        uuid = %report.uuid,
        kind = report.kind.as_str(),
        incomplete = report.incomplete,
        "Stored report at {}",
        path.display()
    );
    Ok(Some(path))
}

/// Launch annotations go under the ones from the stream, which are more recent.
fn apply_launch_arguments(report: &mut CrashReport, args: &HandlerArgs) {
    let mut annotations: BTreeMap<String, String> = args.annotations.iter().cloned().collect();
    annotations.append(&mut report.annotations);
    report.annotations = annotations;
    report
        .attachments
        .extend(args.attachments.iter().map(|(name, source)| AttachmentRecord {
            name: name.clone(),
            source: source.clone(),
            stored_as: None,
        }));
    report.upload_url.clone_from(&args.url);
}

fn receiver_timeout() -> Duration {
    if let Ok(s) = std::env::var(HANDLER_TIMEOUT_ENV) {
        if let Ok(v) = s.parse() {
            return Duration::from_millis(v);
        }
    }
    // Default value
    Duration::from_millis(4000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crash_info::ReportKind;

    fn args(database: PathBuf) -> HandlerArgs {
        HandlerArgs::parse([
            format!("{DATABASE_ARG_PREFIX}{}", database.display()),
            format!("{URL_ARG_PREFIX}https://crash.example.com"),
            format!("{ANNOTATION_ARG_PREFIX}a=launch"),
            format!("{ANNOTATION_ARG_PREFIX}b=x=y"),
            NO_RATE_LIMIT_ARG.to_string(),
            "--future-flag=1".to_string(),
            format!("{ATTACHMENT_ARG_PREFIX}app.log=/tmp/app.log"),
        ])
        .unwrap()
    }

    #[test]
    fn test_parse_handler_args() {
        let parsed = args(PathBuf::from("/db"));
        assert_eq!(parsed.database, PathBuf::from("/db"));
        assert_eq!(parsed.url, "https://crash.example.com");
        assert_eq!(
            parsed.annotations,
            [
                ("a".to_string(), "launch".to_string()),
                ("b".to_string(), "x=y".to_string())
            ]
        );
        assert!(parsed.no_rate_limit);
        assert_eq!(
            parsed.attachments,
            [("app.log".to_string(), PathBuf::from("/tmp/app.log"))]
        );
    }

    #[test]
    fn test_parse_requires_database() {
        assert!(HandlerArgs::parse([format!("{URL_ARG_PREFIX}u")]).is_err());
        assert!(HandlerArgs::parse([
            format!("{DATABASE_ARG_PREFIX}/db"),
            format!("{ANNOTATION_ARG_PREFIX}novalue")
        ])
        .is_err());
        assert!(HandlerArgs::parse([
            format!("{DATABASE_ARG_PREFIX}/db"),
            format!("{ATTACHMENT_ARG_PREFIX}app.log")
        ])
        .is_err());
    }

    #[test]
    fn test_repeated_annotation_keeps_last() {
        let mut builder = crate::crash_info::CrashReportBuilder::new();
        builder.with_kind(ReportKind::Crash).unwrap();
        let mut report = builder.build().unwrap();
        let parsed = HandlerArgs::parse([
            format!("{DATABASE_ARG_PREFIX}/db"),
            format!("{ANNOTATION_ARG_PREFIX}a=1"),
            format!("{ANNOTATION_ARG_PREFIX}a=2"),
        ])
        .unwrap();
        apply_launch_arguments(&mut report, &parsed);
        assert_eq!(report.annotations.len(), 1);
        assert_eq!(report.annotations["a"], "2");
    }

    #[tokio::test]
    async fn test_report_is_stored_pending() {
        let dir = tempfile::tempdir().unwrap();
        let args = args(dir.path().join("db"));
        let input = [
            CRASHCAP_BEGIN_KIND,
            "dump",
            CRASHCAP_END_KIND,
            CRASHCAP_BEGIN_ANNOTATIONS,
            r#"{"a":"stream","c":"3"}"#,
            CRASHCAP_END_ANNOTATIONS,
            CRASHCAP_DONE,
            "",
        ]
        .join("\n");

        let path = receiver_entry_point(&args, Duration::from_secs(1), input.as_bytes())
            .await
            .unwrap()
            .unwrap();
        let report = CrashReport::from_file(&path).unwrap();
        assert_eq!(report.kind, ReportKind::Dump);
        assert_eq!(report.annotations["a"], "stream");
        assert_eq!(report.annotations["b"], "x=y");
        assert_eq!(report.annotations["c"], "3");
        assert_eq!(report.upload_url, "https://crash.example.com");
        assert_eq!(report.attachments.len(), 1);

        let database = CrashReportDatabase::initialize(dir.path().join("db")).unwrap();
        assert_eq!(database.pending_reports().unwrap(), [report]);
    }

    #[tokio::test]
    async fn test_empty_stream_stores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let args = args(dir.path().join("db"));
        let stored = receiver_entry_point(&args, Duration::from_secs(1), &b""[..])
            .await
            .unwrap();
        assert!(stored.is_none());
        assert!(!dir.path().join("db").exists());
    }
}
