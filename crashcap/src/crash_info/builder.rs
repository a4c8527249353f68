// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::*;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, PartialEq)]
pub struct CrashReportBuilder {
    pub annotations: Option<BTreeMap<String, String>>,
    pub attachments: Option<Vec<AttachmentRecord>>,
    pub files: Option<BTreeMap<String, Vec<String>>>,
    pub incomplete: Option<bool>,
    pub kind: Option<ReportKind>,
    pub log_messages: Option<Vec<String>>,
    pub os_info: Option<OsInfo>,
    pub proc_info: Option<ProcInfo>,
    pub sig_info: Option<SigInfo>,
    pub timestamp: Option<DateTime<Utc>>,
    pub ucontext: Option<String>,
    pub upload_url: Option<String>,
    pub user_streams: Option<Vec<UserStreamData>>,
    pub uuid: Uuid,
}

impl Default for CrashReportBuilder {
    fn default() -> Self {
        Self {
            annotations: None,
            attachments: None,
            files: None,
            incomplete: None,
            kind: None,
            log_messages: None,
            os_info: None,
            proc_info: None,
            sig_info: None,
            timestamp: None,
            ucontext: None,
            upload_url: None,
            user_streams: None,
            uuid: Uuid::new_v4(),
        }
    }
}

impl CrashReportBuilder {
    pub fn build(self) -> anyhow::Result<CrashReport> {
        let kind = self.kind.context("required field 'kind' missing")?;
        Ok(CrashReport {
            annotations: self.annotations.unwrap_or_default(),
            attachments: self.attachments.unwrap_or_default(),
            files: self.files.unwrap_or_default(),
            incomplete: self.incomplete.unwrap_or(false),
            kind,
            log_messages: self.log_messages.unwrap_or_default(),
            os_info: self.os_info.unwrap_or_else(OsInfo::unknown),
            proc_info: self.proc_info,
            sig_info: self.sig_info,
            timestamp: self.timestamp.unwrap_or_else(Utc::now).to_rfc3339(),
            ucontext: self.ucontext,
            upload_url: self.upload_url.unwrap_or_default(),
            user_streams: self.user_streams.unwrap_or_default(),
            uuid: self.uuid.to_string(),
        })
    }

    pub fn has_data(&self) -> bool {
        Self {
            uuid: self.uuid,
            ..Self::default()
        } != *self
    }

    pub fn new() -> Self {
        Self::default()
    }

    /// Last write wins, so annotations from the stream override the launch annotations when
    /// added after them.
    pub fn with_annotation(&mut self, key: String, value: String) -> anyhow::Result<()> {
        anyhow::ensure!(!key.is_empty(), "Empty annotation key not allowed");
        self.annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key, value);
        Ok(())
    }

    pub fn with_annotations(
        &mut self,
        annotations: impl IntoIterator<Item = (String, String)>,
    ) -> anyhow::Result<()> {
        for (key, value) in annotations {
            self.with_annotation(key, value)?;
        }
        Ok(())
    }

    pub fn with_attachment(&mut self, attachment: AttachmentRecord) -> anyhow::Result<()> {
        self.attachments
            .get_or_insert_with(Vec::new)
            .push(attachment);
        Ok(())
    }

    pub fn with_file_and_contents(
        &mut self,
        filename: String,
        contents: Vec<String>,
    ) -> anyhow::Result<()> {
        self.files
            .get_or_insert_with(BTreeMap::new)
            .insert(filename, contents);
        Ok(())
    }

    pub fn with_incomplete(&mut self, incomplete: bool) -> anyhow::Result<()> {
        self.incomplete = Some(incomplete);
        Ok(())
    }

    pub fn with_kind(&mut self, kind: ReportKind) -> anyhow::Result<()> {
        self.kind = Some(kind);
        Ok(())
    }

    /// Appends the given message to the current set of messages in the builder.
    pub fn with_log_message(&mut self, message: String, also_print: bool) -> anyhow::Result<()> {
        if also_print {
            tracing::warn!(target: "crashcap::receiver", "{message}");
        }
        self.log_messages.get_or_insert_with(Vec::new).push(message);
        Ok(())
    }

    pub fn with_os_info(&mut self, os_info: OsInfo) -> anyhow::Result<()> {
        self.os_info = Some(os_info);
        Ok(())
    }

    pub fn with_os_info_this_machine(&mut self) -> anyhow::Result<()> {
        self.with_os_info(::os_info::get().into())
    }

    pub fn with_proc_info(&mut self, proc_info: ProcInfo) -> anyhow::Result<()> {
        self.proc_info = Some(proc_info);
        Ok(())
    }

    pub fn with_sig_info(&mut self, sig_info: SigInfo) -> anyhow::Result<()> {
        self.sig_info = Some(sig_info);
        Ok(())
    }

    pub fn with_timestamp(&mut self, timestamp: DateTime<Utc>) -> anyhow::Result<()> {
        self.timestamp = Some(timestamp);
        Ok(())
    }

    pub fn with_timestamp_now(&mut self) -> anyhow::Result<()> {
        self.with_timestamp(Utc::now())
    }

    pub fn with_ucontext(&mut self, ucontext: String) -> anyhow::Result<()> {
        self.ucontext = Some(ucontext);
        Ok(())
    }

    pub fn with_upload_url(&mut self, url: String) -> anyhow::Result<()> {
        self.upload_url = Some(url);
        Ok(())
    }

    /// `data` is hex encoded.
    pub fn with_user_stream(&mut self, stream_id: u32, data: String) -> anyhow::Result<()> {
        self.user_streams
            .get_or_insert_with(Vec::new)
            .push(UserStreamData { stream_id, data });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_required() {
        let builder = CrashReportBuilder::new();
        assert!(!builder.has_data());
        assert!(builder.build().is_err());
    }

    #[test]
    fn test_later_annotations_override() {
        let mut builder = CrashReportBuilder::new();
        builder
            .with_annotations([("a".to_string(), "launch".to_string())])
            .unwrap();
        builder
            .with_annotation("a".to_string(), "stream".to_string())
            .unwrap();
        assert!(builder.with_annotation(String::new(), "x".to_string()).is_err());
        builder.with_kind(ReportKind::Dump).unwrap();
        assert!(builder.has_data());
        let report = builder.build().unwrap();
        assert_eq!(report.annotations["a"], "stream");
        assert!(!report.incomplete);
        assert!(DateTime::parse_from_rfc3339(&report.timestamp).is_ok());
    }

    #[test]
    fn test_launch_details_are_carried() {
        let mut builder = CrashReportBuilder::new();
        builder.with_kind(ReportKind::Crash).unwrap();
        builder
            .with_upload_url("https://crash.example.com".to_string())
            .unwrap();
        builder
            .with_attachment(AttachmentRecord {
                name: "app.log".to_string(),
                source: "/tmp/app.log".into(),
                stored_as: None,
            })
            .unwrap();
        let report = builder.build().unwrap();
        assert_eq!(report.upload_url, "https://crash.example.com");
        assert_eq!(report.attachments.len(), 1);
        assert_eq!(report.attachments[0].name, "app.log");
    }
}
