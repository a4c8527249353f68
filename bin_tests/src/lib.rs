// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helpers for the end-to-end tests: they run `crashcap_bin_test` against the
//! `crashcap_handler` executable and inspect the report database it leaves behind.
//!
//! Both executables are built by cargo for the integration tests of this crate; the tests pass
//! their paths in with `env!("CARGO_BIN_EXE_<name>")`.

pub mod test_types;

use anyhow::Context;
use crashcap::{CrashReport, CrashReportDatabase};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::time::{Duration, Instant};
use test_types::TestMode;

/// How long a test program may run before it is killed.
const PROGRAM_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Artifacts {
    pub test_program: PathBuf,
    pub handler: PathBuf,
}

impl Artifacts {
    pub fn new(test_program: impl Into<PathBuf>, handler: impl Into<PathBuf>) -> Self {
        Self {
            test_program: test_program.into(),
            handler: handler.into(),
        }
    }
}

/// A scratch directory holding the report database, the unwind work directory and the
/// handler's stderr.
pub struct TestFixtures {
    _dir: tempfile::TempDir,
    pub database: PathBuf,
    pub work_dir: PathBuf,
    pub stderr_path: PathBuf,
}

impl TestFixtures {
    pub fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let database = dir.path().join("db");
        let work_dir = dir.path().join("work");
        std::fs::create_dir(&work_dir)?;
        let stderr_path = dir.path().join("handler.stderr");
        Ok(Self {
            _dir: dir,
            database,
            work_dir,
            stderr_path,
        })
    }

    pub fn handler_stderr(&self) -> String {
        std::fs::read_to_string(&self.stderr_path).unwrap_or_default()
    }
}

/// The outcome of one run of the test program.
#[derive(Debug)]
pub struct TestRun {
    pub pid: u32,
    pub status: ExitStatus,
}

/// Runs the test program in `mode` with the given attributes, waiting at most
/// [`PROGRAM_TIMEOUT`] for it to exit.
pub fn run_test_program(
    artifacts: &Artifacts,
    fixtures: &TestFixtures,
    mode: TestMode,
    attributes: &[(&str, &str)],
) -> anyhow::Result<TestRun> {
    let mut child = Command::new(&artifacts.test_program)
        .arg(mode.as_str())
        .arg(&artifacts.handler)
        .arg(&fixtures.database)
        .arg(&fixtures.work_dir)
        .arg(&fixtures.stderr_path)
        .args(attributes.iter().map(|(key, value)| format!("{key}={value}")))
        .spawn()
        .with_context(|| format!("Failed to spawn {:?}", artifacts.test_program))?;
    let pid = child.id();

    let deadline = Instant::now() + PROGRAM_TIMEOUT;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() > deadline {
            let _ = child.kill();
            let _ = child.wait();
            anyhow::bail!("{mode} test program did not exit within {PROGRAM_TIMEOUT:?}");
        }
        std::thread::sleep(Duration::from_millis(20));
    };
    Ok(TestRun { pid, status })
}

/// The pending reports in `database`, oldest first.
pub fn pending_reports(database: &Path) -> anyhow::Result<Vec<CrashReport>> {
    let database = CrashReportDatabase::initialize(database)?;
    Ok(database.pending_reports()?)
}

#[macro_export]
macro_rules! timeit {
    ($op_name:literal, $op:block) => {{
        let start = std::time::Instant::now();
        let res = $op;
        let delta = start.elapsed();
        println!(
            concat!($op_name, " took {} ms"),
            delta.as_secs_f64() * 1000.0
        );
        res
    }};
}
