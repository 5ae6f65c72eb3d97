// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Backoff and per-attempt timeout arithmetic.
//!
//! [`BackoffSettings`] is the declarative record; [`RetryClock`] is the pure
//! arithmetic over it. The actual sleep before a retry is a uniform random
//! value in `[0, delay)` — the full delay is only the upper bound.

use std::time::{Duration, Instant};

use derive_builder::Builder;
use rand::Rng;

/// Default exponential-backoff parameters applied when a policy does not
/// override them.
pub const DEFAULT_INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_RETRY_DELAY_MULTIPLIER: f64 = 1.3;
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_INITIAL_RPC_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_RPC_TIMEOUT_MULTIPLIER: f64 = 1.0;
pub const DEFAULT_MAX_RPC_TIMEOUT: Duration = Duration::from_secs(60);

/// Parameters governing retries of a single logical call.
///
/// `max_retries` and `total_timeout` are the retry budget; at most one may be
/// set. Call sites that set both are rejected by the retry engine with an
/// `INVALID_ARGUMENT` failure when the first error is observed.
#[derive(Debug, Clone, Builder)]
pub struct BackoffSettings {
    /// Upper bound of the first backoff interval.
    #[builder(default = "DEFAULT_INITIAL_RETRY_DELAY")]
    pub initial_retry_delay: Duration,
    /// Growth factor applied to the delay bound after each attempt.
    #[builder(default = "DEFAULT_RETRY_DELAY_MULTIPLIER")]
    pub retry_delay_multiplier: f64,
    /// Cap on the delay bound.
    #[builder(default = "DEFAULT_MAX_RETRY_DELAY")]
    pub max_retry_delay: Duration,
    /// Per-attempt RPC timeout for the first attempt.
    #[builder(default = "DEFAULT_INITIAL_RPC_TIMEOUT")]
    pub initial_rpc_timeout: Duration,
    /// Growth factor applied to the per-attempt timeout.
    #[builder(default = "DEFAULT_RPC_TIMEOUT_MULTIPLIER")]
    pub rpc_timeout_multiplier: f64,
    /// Cap on the per-attempt timeout.
    #[builder(default = "DEFAULT_MAX_RPC_TIMEOUT")]
    pub max_rpc_timeout: Duration,
    /// Absolute budget for the whole call, across attempts and backoff.
    #[builder(default, setter(strip_option))]
    pub total_timeout: Option<Duration>,
    /// Maximum number of retries (the initial attempt is not counted).
    #[builder(default, setter(strip_option))]
    pub max_retries: Option<u32>,
}

impl BackoffSettings {
    pub fn builder() -> BackoffSettingsBuilder {
        BackoffSettingsBuilder::default()
    }
}

impl Default for BackoffSettings {
    fn default() -> Self {
        BackoffSettings::builder()
            .build()
            .expect("builder defaults are complete")
    }
}

/// A uniform random duration in `[0, delay)`.
pub fn jittered(delay: Duration) -> Duration {
    if delay.is_zero() {
        return Duration::ZERO;
    }
    delay.mul_f64(rand::rng().random_range(0.0..1.0))
}

/// Why an attempt must be abandoned rather than retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    /// `retry_count` reached the configured `max_retries`.
    MaxRetries,
    /// The absolute deadline derived from `total_timeout` has elapsed.
    DeadlineElapsed,
}

/// Pure arithmetic over [`BackoffSettings`]. Holds no mutable state; the
/// retry engine threads the current delay/timeout through it.
#[derive(Debug, Clone)]
pub struct RetryClock {
    settings: BackoffSettings,
}

impl RetryClock {
    pub fn new(settings: BackoffSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &BackoffSettings {
        &self.settings
    }

    /// The delay bound for the attempt after one bounded by `delay`.
    pub fn next_delay(&self, delay: Duration) -> Duration {
        delay
            .mul_f64(self.settings.retry_delay_multiplier)
            .min(self.settings.max_retry_delay)
    }

    /// The actual sleep before the next attempt: uniform in `[0, delay)`.
    pub fn jittered(&self, delay: Duration) -> Duration {
        jittered(delay)
    }

    /// The per-attempt timeout for the attempt after one allotted `timeout`,
    /// clamped to the time remaining before `deadline` when one is set.
    pub fn next_timeout(
        &self,
        timeout: Duration,
        deadline: Option<Instant>,
        now: Instant,
    ) -> Duration {
        let mut next = timeout
            .mul_f64(self.settings.rpc_timeout_multiplier)
            .min(self.settings.max_rpc_timeout);
        if let Some(deadline) = deadline {
            next = next.min(deadline.saturating_duration_since(now));
        }
        next
    }

    /// Whether the retry budget is spent, and which limit was hit.
    ///
    /// A configured `max_retries` of zero is not reported here; the retry
    /// engine gives that case its own terminal note.
    pub fn exceeded(
        &self,
        retry_count: u32,
        now: Instant,
        deadline: Option<Instant>,
    ) -> Option<AbandonReason> {
        if let Some(max) = self.settings.max_retries {
            if max > 0 && retry_count >= max {
                return Some(AbandonReason::MaxRetries);
            }
        }
        if let Some(deadline) = deadline {
            if now >= deadline {
                return Some(AbandonReason::DeadlineElapsed);
            }
        }
        None
    }
}
