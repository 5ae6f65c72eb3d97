// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-call options and their resolution into effective settings.
//!
//! [`CallOptions`] is what a caller hands in; [`CallOptions::resolve`]
//! reconciles the current and legacy retry shapes — rejecting conflicting
//! combinations before any wire call is dispatched — and produces the
//! [`CallSettings`] the proxy and page engine consume.

use crate::diagnostics::Diagnostics;
use crate::error::CallError;
use crate::legacy::LegacyRetryOptions;
use crate::retry::RetryPolicy;

pub const RETRY_OPTIONS_CONFLICT: &str = "Only one of retry or retryRequestOptions may be set";
pub const RESUMPTION_REQUIRES_STREAMING_RETRIES: &str =
    "A resumption strategy can only be used with the streaming retry engine enabled";

/// Options for one call, as supplied by the caller.
#[derive(Debug, Clone)]
pub struct CallOptions<Req> {
    /// The current retry policy shape.
    pub retry: Option<RetryPolicy<Req>>,
    /// The deprecated retry-options shape. Mutually exclusive with `retry`.
    pub legacy_retry: Option<LegacyRetryOptions>,
    /// Selects the streaming retry state machine for server-streaming calls.
    pub streaming_retries: bool,
    /// REST-based server streaming: single attempt, never retried here.
    pub rest_transport: bool,
    /// Page engine: collect pages eagerly. `None` leaves the default (on);
    /// the lazy surfaces warn when a caller explicitly sets it on.
    pub auto_paginate: Option<bool>,
    /// Page engine: cap on delivered resources.
    pub max_results: Option<usize>,
    /// Page engine: token seeding the first page request only.
    pub page_token: Option<String>,
}

impl<Req> Default for CallOptions<Req> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Req> CallOptions<Req> {
    pub fn new() -> Self {
        Self {
            retry: None,
            legacy_retry: None,
            streaming_retries: false,
            rest_transport: false,
            auto_paginate: None,
            max_results: None,
            page_token: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy<Req>) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_legacy_retry(mut self, legacy: LegacyRetryOptions) -> Self {
        self.legacy_retry = Some(legacy);
        self
    }

    pub fn with_streaming_retries(mut self, enabled: bool) -> Self {
        self.streaming_retries = enabled;
        self
    }

    pub fn with_rest_transport(mut self, enabled: bool) -> Self {
        self.rest_transport = enabled;
        self
    }

    pub fn with_auto_paginate(mut self, enabled: bool) -> Self {
        self.auto_paginate = Some(enabled);
        self
    }

    pub fn with_max_results(mut self, max: usize) -> Self {
        self.max_results = Some(max);
        self
    }

    pub fn with_page_token(mut self, token: impl Into<String>) -> Self {
        self.page_token = Some(token.into());
        self
    }

    /// Resolve against the process-wide diagnostics registry.
    pub fn resolve(self) -> Result<CallSettings<Req>, CallError> {
        self.resolve_with(Diagnostics::global())
    }

    /// Resolve the options into effective settings.
    ///
    /// Fails before dispatch when both retry shapes are set, or when a
    /// resumption function is supplied without the streaming retry engine.
    pub fn resolve_with(self, diagnostics: &Diagnostics) -> Result<CallSettings<Req>, CallError> {
        let retry = match (self.retry, self.legacy_retry) {
            (Some(_), Some(_)) => {
                return Err(CallError::invalid_argument(RETRY_OPTIONS_CONFLICT));
            }
            (Some(retry), None) => Some(retry),
            (None, Some(legacy)) => Some(legacy.to_policy(diagnostics)),
            (None, None) => None,
        };

        if let Some(policy) = &retry {
            if policy.resume_request.is_some() && !self.streaming_retries {
                return Err(CallError::failed_precondition(
                    RESUMPTION_REQUIRES_STREAMING_RETRIES,
                ));
            }
        }

        Ok(CallSettings {
            retry,
            streaming_retries: self.streaming_retries,
            rest_transport: self.rest_transport,
            auto_paginate: self.auto_paginate,
            max_results: self.max_results,
            page_token: self.page_token,
        })
    }
}

/// The resolved, validated settings for one call.
#[derive(Debug, Clone)]
pub struct CallSettings<Req> {
    pub retry: Option<RetryPolicy<Req>>,
    pub streaming_retries: bool,
    pub rest_transport: bool,
    pub auto_paginate: Option<bool>,
    pub max_results: Option<usize>,
    pub page_token: Option<String>,
}

impl<Req> CallSettings<Req> {
    /// Whether paging should be collected eagerly; on unless switched off.
    pub fn auto_paginate(&self) -> bool {
        self.auto_paginate.unwrap_or(true)
    }
}

impl<Req> Default for CallSettings<Req> {
    fn default() -> Self {
        Self {
            retry: None,
            streaming_retries: false,
            rest_transport: false,
            auto_paginate: None,
            max_results: None,
            page_token: None,
        }
    }
}
