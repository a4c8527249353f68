// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use crate::shared::constants::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HandlerConfigError {
    #[error("Server URL must not be empty")]
    EmptyUrl,
    #[error("Database path must not be empty")]
    EmptyDatabasePath,
    #[error("Handler executable path must not be empty")]
    EmptyHandlerPath,
    #[error("Attachment path {0:?} has no file name")]
    AttachmentWithoutName(PathBuf),
    #[error("Attachment path {0:?} is not absolute")]
    RelativeAttachment(PathBuf),
}

/// A file uploaded alongside every report, addressed by its base name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub path: PathBuf,
}

impl Attachment {
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, HandlerConfigError> {
        let path = path.into();
        if !path.is_absolute() {
            return Err(HandlerConfigError::RelativeAttachment(path));
        }
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| HandlerConfigError::AttachmentWithoutName(path.clone()))?;
        Ok(Self { name, path })
    }

    pub fn to_argument(&self) -> String {
        format!(
            "{ATTACHMENT_ARG_PREFIX}{}={}",
            self.name,
            self.path.display()
        )
    }
}

/// Everything needed to launch the external crash-handler process.
/// Built once by initialization; the handler client keeps its own prepared copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashHandlerConfig {
    url: String,
    database: PathBuf,
    handler: PathBuf,
    arguments: Vec<String>,
    attachments: Vec<Attachment>,
    annotations: BTreeMap<String, String>,
    handler_stderr: Option<PathBuf>,
}

impl CrashHandlerConfig {
    /// `arguments` are extra handler flags; [`NO_RATE_LIMIT_ARG`] is added when missing.
    pub fn new(
        url: impl Into<String>,
        database: impl Into<PathBuf>,
        handler: impl Into<PathBuf>,
        mut arguments: Vec<String>,
        attachments: Vec<Attachment>,
        annotations: BTreeMap<String, String>,
    ) -> Result<Self, HandlerConfigError> {
        let url = url.into();
        let database = database.into();
        let handler = handler.into();
        if url.is_empty() {
            return Err(HandlerConfigError::EmptyUrl);
        }
        if database.as_os_str().is_empty() {
            return Err(HandlerConfigError::EmptyDatabasePath);
        }
        if handler.as_os_str().is_empty() {
            return Err(HandlerConfigError::EmptyHandlerPath);
        }
        if !arguments.iter().any(|arg| arg == NO_RATE_LIMIT_ARG) {
            arguments.insert(0, NO_RATE_LIMIT_ARG.to_string());
        }
        Ok(Self {
            url,
            database,
            handler,
            arguments,
            attachments,
            annotations,
            handler_stderr: None,
        })
    }

    /// Redirects the handler's stderr to `path` (appending) instead of `/dev/null`.
    pub fn with_handler_stderr(mut self, path: Option<PathBuf>) -> Self {
        self.handler_stderr = path;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn database(&self) -> &Path {
        &self.database
    }

    pub fn handler(&self) -> &Path {
        &self.handler
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    pub fn handler_stderr(&self) -> Option<&Path> {
        self.handler_stderr.as_deref()
    }

    /// The complete argv of the handler process, argv[0] included. Annotations whose key holds
    /// a `=` cannot be split back apart and are left to the report stream.
    pub fn handler_argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(
            3 + self.annotations.len() + self.arguments.len() + self.attachments.len(),
        );
        argv.push(self.handler.display().to_string());
        argv.push(format!("{DATABASE_ARG_PREFIX}{}", self.database.display()));
        argv.push(format!("{URL_ARG_PREFIX}{}", self.url));
        argv.extend(
            self.annotations
                .iter()
                .filter(|(key, _)| !key.contains('='))
                .map(|(key, value)| format!("{ANNOTATION_ARG_PREFIX}{key}={value}")),
        );
        argv.extend(self.arguments.iter().cloned());
        argv.extend(self.attachments.iter().map(Attachment::to_argument));
        argv
    }
}

/// Service-wide tunables. The defaults match what the mobile integration ships with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureOptions {
    /// Client-side unwinding is refused below this platform version.
    pub min_unwind_platform_version: u32,
    /// Stream id of the unwind payload inside reports.
    pub unwind_stream_id: u32,
    /// Deadline for the whole crash sequence.
    pub timeout: Duration,
    /// Deadline for the monitor pid handshake.
    pub handshake_timeout: Duration,
    /// How long a crash waits for the monitor's unwind result.
    pub unwind_wait: Duration,
    /// Run the crash handler on a dedicated, guard-paged signal stack.
    pub use_alt_stack: bool,
    /// Where the handler process writes its stderr. `/dev/null` if unset.
    pub handler_stderr: Option<PathBuf>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            min_unwind_platform_version: DEFAULT_MIN_UNWIND_PLATFORM_VERSION,
            unwind_stream_id: DEFAULT_UNWIND_STREAM_ID,
            timeout: CRASHCAP_DEFAULT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            unwind_wait: DEFAULT_UNWIND_WAIT,
            use_alt_stack: true,
            handler_stderr: None,
        }
    }
}
