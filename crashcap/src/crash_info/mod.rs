// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod builder;
mod sig_info;

pub use builder::*;
pub use sig_info::*;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    /// Produced by a fatal signal.
    Crash,
    /// Produced on request while the process keeps running.
    Dump,
}

impl ReportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportKind::Crash => "crash",
            ReportKind::Dump => "dump",
        }
    }
}

impl std::str::FromStr for ReportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "crash" => Ok(ReportKind::Crash),
            "dump" => Ok(ReportKind::Dump),
            other => anyhow::bail!("Unknown report kind {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcInfo {
    pub pid: u32,
    pub tid: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsInfo {
    pub architecture: String,
    pub bitness: String,
    pub os_type: String,
    pub version: String,
}

impl OsInfo {
    pub fn unknown() -> Self {
        Self {
            architecture: "unknown".to_string(),
            bitness: "unknown".to_string(),
            os_type: "unknown".to_string(),
            version: "unknown".to_string(),
        }
    }
}

impl From<os_info::Info> for OsInfo {
    fn from(value: os_info::Info) -> Self {
        let architecture = value.architecture().unwrap_or("unknown").to_string();
        let bitness = value.bitness().to_string();
        let os_type = value.os_type().to_string();
        let version = value.version().to_string();
        Self {
            architecture,
            bitness,
            os_type,
            version,
        }
    }
}

/// A custom data region copied into the report, tagged with the id it was published under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStreamData {
    pub stream_id: u32,
    /// Hex encoded bytes.
    pub data: String,
}

impl UserStreamData {
    pub fn bytes(&self) -> anyhow::Result<Vec<u8>> {
        hex::decode(&self.data).context("user stream is not valid hex")
    }
}

/// A file copied into the report database next to the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub name: String,
    pub source: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_as: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashReport {
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentRecord>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, Vec<String>>,
    pub incomplete: bool,
    pub kind: ReportKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log_messages: Vec<String>,
    pub os_info: OsInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proc_info: Option<ProcInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig_info: Option<SigInfo>,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ucontext: Option<String>,
    pub upload_url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_streams: Vec<UserStreamData>,
    pub uuid: String,
}

impl CrashReport {
    pub fn user_stream(&self, stream_id: u32) -> Option<&UserStreamData> {
        self.user_streams.iter().find(|s| s.stream_id == stream_id)
    }

    /// Emit the report as structured json in file `path`.
    pub fn to_file(&self, path: &Path) -> anyhow::Result<()> {
        let file = File::options()
            .create_new(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(file, self)
            .with_context(|| format!("Failed to write json to {}", path.display()))?;
        Ok(())
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("Failed to parse {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_kind_parsing() {
        assert_eq!("crash".parse::<ReportKind>().unwrap(), ReportKind::Crash);
        assert_eq!("dump\n".parse::<ReportKind>().unwrap(), ReportKind::Dump);
        assert!("other".parse::<ReportKind>().is_err());
        assert_eq!(ReportKind::Dump.as_str(), "dump");
    }

    #[test]
    fn test_to_file_and_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let mut builder = CrashReportBuilder::new();
        builder.with_kind(ReportKind::Crash).unwrap();
        builder
            .with_annotation("format".to_string(), "minidump".to_string())
            .unwrap();
        builder
            .with_user_stream(7, hex::encode([1u8, 2, 3]))
            .unwrap();
        let report = builder.build().unwrap();
        report.to_file(&path).unwrap();
        // Reports are never overwritten.
        assert!(report.to_file(&path).is_err());

        let read_back = CrashReport::from_file(&path).unwrap();
        assert_eq!(read_back, report);
        assert_eq!(
            read_back.user_stream(7).unwrap().bytes().unwrap(),
            vec![1, 2, 3]
        );
    }
}
