// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#[cfg(not(unix))]
fn main() {}

#[cfg(unix)]
#[cfg(feature = "receiver")]
fn main() -> anyhow::Result<()> {
    // stdout is /dev/null or the application's stderr file; logs go to stderr either way.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    crashcap::receiver_entry_point_stdin()
}

#[cfg(unix)]
#[cfg(not(feature = "receiver"))]
fn main() {}
