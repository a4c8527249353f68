// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fs::{File, OpenOptions};
use std::os::fd::{IntoRawFd, RawFd};
use std::path::Path;

/// Opens `path` for appending, creating it if needed, or `/dev/null` when no path is given.
/// The returned descriptor is meant to be `dup2`'d onto stdout/stderr of a spawned handler, so
/// it is returned raw and the caller owns it.
pub fn open_file_or_quiet(path: Option<&Path>) -> std::io::Result<RawFd> {
    let file = match path {
        Some(path) => OpenOptions::new().append(true).create(true).open(path)?,
        None => File::open("/dev/null")?,
    };
    Ok(file.into_raw_fd())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_file_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("handler.stderr");
        let fd = open_file_or_quiet(Some(&path)).unwrap();
        assert!(fd >= 0);
        assert!(path.exists());
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_open_dev_null() {
        let fd = open_file_or_quiet(None).unwrap();
        assert!(fd >= 0);
        unsafe { libc::close(fd) };
    }
}
