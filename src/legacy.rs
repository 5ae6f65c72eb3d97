// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bridge from the deprecated retry-options shape to [`RetryPolicy`].
//!
//! The legacy record predates the declarative policy: durations in seconds,
//! a flat retry count, and knobs the current engine has no counterpart for.
//! Conversion maps what is supported, warns (once per kind) about what is
//! not, and deprecates the mechanism as a whole.

use std::time::Duration;

use crate::backoff::BackoffSettings;
use crate::diagnostics::{
    Diagnostics, LEGACY_RETRY_OPTIONS_DEPRECATED, UNSUPPORTED_CURRENT_RETRY_ATTEMPT,
    UNSUPPORTED_NO_RESPONSE_RETRIES, UNSUPPORTED_OBJECT_MODE,
};
use crate::retry::{RetryPolicy, ShouldRetryFn};

/// The deprecated retry-options record.
#[derive(Clone, Default)]
pub struct LegacyRetryOptions {
    /// Maximum retry count. When present, wins over `total_timeout_secs`.
    pub retries: Option<u32>,
    /// Cap on the backoff delay, in whole seconds.
    pub max_retry_delay_secs: u64,
    pub retry_delay_multiplier: f64,
    /// Overall budget in whole seconds; only used when `retries` is absent.
    pub total_timeout_secs: u64,
    /// Unsupported; accepted for compatibility.
    pub no_response_retries: Option<u32>,
    /// Unsupported; accepted for compatibility.
    pub current_retry_attempt: Option<u32>,
    /// Unsupported; accepted for compatibility.
    pub object_mode: Option<bool>,
    pub should_retry: Option<ShouldRetryFn>,
}

impl std::fmt::Debug for LegacyRetryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegacyRetryOptions")
            .field("retries", &self.retries)
            .field("max_retry_delay_secs", &self.max_retry_delay_secs)
            .field("retry_delay_multiplier", &self.retry_delay_multiplier)
            .field("total_timeout_secs", &self.total_timeout_secs)
            .field("no_response_retries", &self.no_response_retries)
            .field("current_retry_attempt", &self.current_retry_attempt)
            .field("object_mode", &self.object_mode)
            .field("should_retry", &self.should_retry.is_some())
            .finish()
    }
}

impl LegacyRetryOptions {
    /// Convert into the current policy shape, emitting the deprecation and
    /// unsupported-parameter diagnostics on `diagnostics`.
    pub fn to_policy<Req>(&self, diagnostics: &Diagnostics) -> RetryPolicy<Req> {
        diagnostics.emit(
            LEGACY_RETRY_OPTIONS_DEPRECATED,
            "retryRequestOptions is deprecated; use a retry policy instead",
        );
        diagnostics.emit(
            UNSUPPORTED_NO_RESPONSE_RETRIES,
            "noResponseRetries is not supported and will be ignored",
        );
        diagnostics.emit(
            UNSUPPORTED_CURRENT_RETRY_ATTEMPT,
            "currentRetryAttempt is not supported and will be ignored",
        );
        diagnostics.emit(
            UNSUPPORTED_OBJECT_MODE,
            "objectMode is not supported and will be ignored",
        );

        let mut builder = BackoffSettings::builder();
        builder
            .max_retry_delay(Duration::from_millis(self.max_retry_delay_secs * 1000))
            .retry_delay_multiplier(self.retry_delay_multiplier);
        // A flat retry count and a total timeout are mutually exclusive in
        // the current shape; the count wins when both were given.
        if let Some(retries) = self.retries {
            builder.max_retries(retries);
        } else {
            builder.total_timeout(Duration::from_millis(self.total_timeout_secs * 1000));
        }
        let backoff = builder.build().expect("builder defaults are complete");

        RetryPolicy {
            retry_codes: Vec::new(),
            should_retry: self.should_retry.clone(),
            resume_request: None,
            backoff,
        }
    }
}
