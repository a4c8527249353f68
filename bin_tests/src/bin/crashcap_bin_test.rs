// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#[cfg(not(unix))]
fn main() {}

#[cfg(unix)]
fn main() -> anyhow::Result<()> {
    unix::main()
}

#[cfg(unix)]
mod unix {
    use anyhow::Context;
    use bin_tests::test_types::TestMode;
    use crashcap::{CaptureOptions, CrashCapture, HandlerProcessClient, UnwindCapability};
    use std::env;
    use std::path::PathBuf;
    use std::sync::Arc;

    /// Usage: `crashcap_bin_test <mode> <handler> <database> <work dir> <handler stderr>
    /// [key=value]...`
    pub fn main() -> anyhow::Result<()> {
        let mut args = env::args().skip(1);
        let mode: TestMode = args
            .next()
            .context("Unexpected number of arguments")?
            .parse()
            .map_err(anyhow::Error::msg)?;
        let handler = args.next().context("Unexpected number of arguments")?;
        let database = args.next().context("Unexpected number of arguments")?;
        let work_dir = args.next().context("Unexpected number of arguments")?;
        let stderr_filename = args.next().context("Unexpected number of arguments")?;
        let (keys, values): (Vec<String>, Vec<String>) = args
            .map(|arg| {
                arg.split_once('=')
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .with_context(|| format!("Malformed attribute {arg:?}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?
            .into_iter()
            .unzip();

        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
            .init();

        let options = CaptureOptions {
            handler_stderr: Some(PathBuf::from(stderr_filename)),
            use_alt_stack: true,
            ..Default::default()
        };
        // Off-device there is no platform version, claim the minimum so unwinding can run.
        let capability = UnwindCapability::from_version(
            Some(options.min_unwind_platform_version),
            options.min_unwind_platform_version,
        );
        let client = Arc::new(HandlerProcessClient::new(&options));
        let capture = CrashCapture::with_client(options, client, capability);

        if mode == TestMode::UnwindSetupFailure {
            // Aborts the process.
            let _ = capture.enable_client_side_unwinding(PathBuf::from(&work_dir).join("missing"));
            anyhow::bail!("Survived a failed unwinding setup");
        }
        let unwinding = mode == TestMode::CrashWithUnwinding;
        if unwinding {
            anyhow::ensure!(
                capture.enable_client_side_unwinding(&work_dir),
                "Client-side unwinding was refused"
            );
        }
        anyhow::ensure!(
            capture.initialize(
                "https://crash.example.com",
                &database,
                &handler,
                &keys,
                &values,
                &[],
                unwinding,
            ),
            "Crash capture initialization failed"
        );

        match mode {
            TestMode::Crash | TestMode::CrashWithUnwinding => capture.crash(),
            TestMode::Dump => {
                capture.dump_without_crash(Some("boom"), true);
                capture.dump_without_crash(None, false);
            }
            TestMode::DumpFromThread => std::thread::scope(|s| {
                s.spawn(|| capture.dump_without_crash(Some("from thread"), false));
            }),
            TestMode::DumpToExitingHandler => {
                // SAFETY: no other thread is running.
                unsafe { libc::signal(libc::SIGPIPE, libc::SIG_DFL) };
                capture.add_attribute("padding", &"x".repeat(256 * 1024));
                capture.dump_without_crash(Some("boom"), false);
            }
            // Handled before initialization.
            TestMode::UnwindSetupFailure => (),
        }
        anyhow::ensure!(!mode.crashes(), "Survived a {mode} test");
        Ok(())
    }
}
