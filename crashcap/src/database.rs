// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! On-disk store for reports waiting to be uploaded.
//!
//! ```text
//! <root>/settings.json
//! <root>/new/          reports being written
//! <root>/pending/      complete reports, ready for upload
//! <root>/completed/    uploaded or discarded reports
//! <root>/attachments/<uuid>/
//! ```
//! Upload and retry are handled elsewhere; this module only owns the layout.

use crate::crash_info::{AttachmentRecord, CrashReport};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const SETTINGS_FILE: &str = "settings.json";
const NEW_DIR: &str = "new";
const PENDING_DIR: &str = "pending";
const COMPLETED_DIR: &str = "completed";
const ATTACHMENTS_DIR: &str = "attachments";
const REPORT_EXTENSION: &str = "json";

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database path must not be empty")]
    EmptyPath,
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Invalid settings file {path}: {source}")]
    Settings {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to write report: {0:#}")]
    Report(anyhow::Error),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> DatabaseError + '_ {
    move |source| DatabaseError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSettings {
    pub uploads_enabled: bool,
    pub client_id: Uuid,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            uploads_enabled: false,
            client_id: Uuid::new_v4(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrashReportDatabase {
    root: PathBuf,
}

impl CrashReportDatabase {
    /// Creates the layout under `root` if needed and validates what is already there.
    pub fn initialize(root: impl Into<PathBuf>) -> Result<Self, DatabaseError> {
        let root = root.into();
        if root.as_os_str().is_empty() {
            return Err(DatabaseError::EmptyPath);
        }
        for dir in [NEW_DIR, PENDING_DIR, COMPLETED_DIR, ATTACHMENTS_DIR] {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(io_error(&path))?;
        }
        let database = Self { root };
        // Creates the settings on first use, fails on a corrupt file.
        let settings = database.settings()?;
        database.write_settings(&settings)?;
        Ok(database)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings(&self) -> Result<DatabaseSettings, DatabaseError> {
        let path = self.root.join(SETTINGS_FILE);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|source| DatabaseError::Settings { path, source }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(DatabaseSettings::default()),
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    pub fn set_uploads_enabled(&self, enabled: bool) -> Result<(), DatabaseError> {
        let mut settings = self.settings()?;
        if settings.uploads_enabled != enabled {
            settings.uploads_enabled = enabled;
            self.write_settings(&settings)?;
        }
        Ok(())
    }

    fn write_settings(&self, settings: &DatabaseSettings) -> Result<(), DatabaseError> {
        let path = self.root.join(SETTINGS_FILE);
        let tmp = self.root.join(format!("{SETTINGS_FILE}.tmp"));
        let bytes = serde_json::to_vec_pretty(settings).map_err(|source| {
            DatabaseError::Settings {
                path: path.clone(),
                source,
            }
        })?;
        fs::write(&tmp, bytes).map_err(io_error(&tmp))?;
        fs::rename(&tmp, &path).map_err(io_error(&path))
    }

    /// Copies the report's attachments into the database, then writes the report into `new/`
    /// and moves it to `pending/` so readers never see a partial file.
    pub fn write_pending(&self, report: &CrashReport) -> Result<PathBuf, DatabaseError> {
        let mut report = report.clone();
        if !report.attachments.is_empty() {
            let dir = self.root.join(ATTACHMENTS_DIR).join(&report.uuid);
            fs::create_dir_all(&dir).map_err(io_error(&dir))?;
            for attachment in report.attachments.iter_mut() {
                store_attachment(&dir, attachment);
            }
        }

        let file_name = format!("{}.{REPORT_EXTENSION}", report.uuid);
        let new_path = self.root.join(NEW_DIR).join(&file_name);
        let pending_path = self.root.join(PENDING_DIR).join(&file_name);
        report.to_file(&new_path).map_err(DatabaseError::Report)?;
        fs::rename(&new_path, &pending_path).map_err(io_error(&pending_path))?;
        Ok(pending_path)
    }

    /// Every parseable report in `pending/`, oldest first. Unparseable files are skipped.
    pub fn pending_reports(&self) -> Result<Vec<CrashReport>, DatabaseError> {
        let dir = self.root.join(PENDING_DIR);
        let mut entries = fs::read_dir(&dir)
            .map_err(io_error(&dir))?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == REPORT_EXTENSION))
            .collect::<Vec<_>>();
        entries.sort_by_key(|path| fs::metadata(path).and_then(|m| m.modified()).ok());
        Ok(entries
            .iter()
            .filter_map(|path| match CrashReport::from_file(path) {
                Ok(report) => Some(report),
                Err(e) => {
                    tracing::warn!(target: "crashcap::database", "Skipping {}: {e:#}", path.display());
                    None
                }
            })
            .collect())
    }

    /// Moves a pending report to `completed/`.
    pub fn mark_completed(&self, uuid: &str) -> Result<(), DatabaseError> {
        let file_name = format!("{uuid}.{REPORT_EXTENSION}");
        let from = self.root.join(PENDING_DIR).join(&file_name);
        let to = self.root.join(COMPLETED_DIR).join(&file_name);
        fs::rename(&from, &to).map_err(io_error(&from))
    }
}

/// A missing attachment is recorded without a stored copy rather than failing the report.
fn store_attachment(dir: &Path, attachment: &mut AttachmentRecord) {
    let target = dir.join(&attachment.name);
    match fs::copy(&attachment.source, &target) {
        Ok(_) => attachment.stored_as = Some(target),
        Err(e) => tracing::warn!(
            target: "crashcap::database",
            "Could not copy attachment {}: {e}",
            attachment.source.display()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crash_info::{CrashReportBuilder, ReportKind};

    fn report() -> CrashReport {
        let mut builder = CrashReportBuilder::new();
        builder.with_kind(ReportKind::Crash).unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn test_initialize_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("db");
        let database = CrashReportDatabase::initialize(&root).unwrap();
        for sub in [NEW_DIR, PENDING_DIR, COMPLETED_DIR, ATTACHMENTS_DIR] {
            assert!(root.join(sub).is_dir());
        }
        let settings = database.settings().unwrap();
        assert!(!settings.uploads_enabled);

        // Re-opening keeps the client id.
        let reopened = CrashReportDatabase::initialize(&root).unwrap();
        assert_eq!(reopened.settings().unwrap().client_id, settings.client_id);
    }

    #[test]
    fn test_initialize_rejects_bad_input() {
        assert!(matches!(
            CrashReportDatabase::initialize(""),
            Err(DatabaseError::EmptyPath)
        ));
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SETTINGS_FILE), b"not json").unwrap();
        assert!(matches!(
            CrashReportDatabase::initialize(dir.path()),
            Err(DatabaseError::Settings { .. })
        ));
    }

    #[test]
    fn test_set_uploads_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let database = CrashReportDatabase::initialize(dir.path()).unwrap();
        database.set_uploads_enabled(true).unwrap();
        assert!(database.settings().unwrap().uploads_enabled);
    }

    #[test]
    fn test_write_pending_and_complete() {
        let dir = tempfile::tempdir().unwrap();
        let database = CrashReportDatabase::initialize(dir.path()).unwrap();
        let attachment_src = dir.path().join("app.log");
        fs::write(&attachment_src, b"log line").unwrap();

        let mut report = report();
        report.attachments.push(AttachmentRecord {
            name: "app.log".to_string(),
            source: attachment_src,
            stored_as: None,
        });
        report.attachments.push(AttachmentRecord {
            name: "missing.log".to_string(),
            source: dir.path().join("missing.log"),
            stored_as: None,
        });
        let path = database.write_pending(&report).unwrap();
        assert!(path.starts_with(dir.path().join(PENDING_DIR)));

        let pending = database.pending_reports().unwrap();
        assert_eq!(pending.len(), 1);
        let stored = pending[0].attachments[0].stored_as.as_ref().unwrap();
        assert_eq!(fs::read(stored).unwrap(), b"log line");
        assert!(pending[0].attachments[1].stored_as.is_none());

        database.mark_completed(&report.uuid).unwrap();
        assert!(database.pending_reports().unwrap().is_empty());
    }
}
