// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup.
//!
//! Logging takes two forms: `READABLE` or `JSONL`. The default is
//! `READABLE`; `JSONL` can be enabled by setting the `RELAY_LOG_JSONL`
//! environment variable to `1`. Filters come from the `RELAY_LOG`
//! environment variable, comma-separated `target=level` directives with a
//! default level of `info`.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// ENV used to set the log filter.
const FILTER_ENV: &str = "RELAY_LOG";

/// ENV used to switch to JSONL output.
const JSONL_ENV: &str = "RELAY_LOG_JSONL";

/// Default log level.
const DEFAULT_FILTER_LEVEL: &str = "info";

/// Once instance to ensure the logger is only initialized once.
static INIT: Once = Once::new();

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER_LEVEL))
}

fn jsonl_enabled() -> bool {
    std::env::var(JSONL_ENV).map(|v| v == "1").unwrap_or(false)
}

/// Initialize the process-wide subscriber. Idempotent; later calls are
/// no-ops.
pub fn init() {
    INIT.call_once(|| {
        if jsonl_enabled() {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(env_filter())
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .init();
        }
    });
}
