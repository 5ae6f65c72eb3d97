// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Retry policy: which errors are retryable, and what the next request is.

use std::sync::Arc;

use crate::backoff::BackoffSettings;
use crate::error::{CallError, Code};

/// User predicate overriding code-based classification.
pub type ShouldRetryFn = Arc<dyn Fn(&CallError) -> bool + Send + Sync>;

/// User transform from the original request to the next-attempt request.
///
/// The engine does not track per-message offsets; a resumption function is
/// the only mechanism for advancing the request past already-delivered work.
pub type ResumeRequestFn<Req> = Arc<dyn Fn(&Req) -> Req + Send + Sync>;

/// The effective retry policy for one call.
pub struct RetryPolicy<Req> {
    /// Codes considered transient. Ignored when `should_retry` is set.
    pub retry_codes: Vec<Code>,
    /// Optional predicate; when present it alone decides retryability.
    pub should_retry: Option<ShouldRetryFn>,
    /// Optional resumption function, applied to the original request.
    pub resume_request: Option<ResumeRequestFn<Req>>,
    pub backoff: BackoffSettings,
}

impl<Req> RetryPolicy<Req> {
    pub fn new(retry_codes: Vec<Code>, backoff: BackoffSettings) -> Self {
        Self {
            retry_codes,
            should_retry: None,
            resume_request: None,
            backoff,
        }
    }

    pub fn with_should_retry(
        mut self,
        predicate: impl Fn(&CallError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    pub fn with_resume_request(
        mut self,
        resume: impl Fn(&Req) -> Req + Send + Sync + 'static,
    ) -> Self {
        self.resume_request = Some(Arc::new(resume));
        self
    }

    /// An error is retryable iff the predicate accepts it, or — with no
    /// predicate — its code is in a non-empty `retry_codes` set. An empty set
    /// with no predicate means "never retry".
    pub fn should_retry_error(&self, error: &CallError) -> bool {
        if let Some(predicate) = &self.should_retry {
            return predicate(error);
        }
        !self.retry_codes.is_empty() && self.retry_codes.contains(&error.code)
    }

    /// The request for the next attempt: the resumption function applied to
    /// the original request, or the original unchanged.
    pub fn next_request(&self, original: &Req) -> Req
    where
        Req: Clone,
    {
        match &self.resume_request {
            Some(resume) => resume(original),
            None => original.clone(),
        }
    }
}

impl<Req> Default for RetryPolicy<Req> {
    fn default() -> Self {
        Self::new(Vec::new(), BackoffSettings::default())
    }
}

impl<Req> Clone for RetryPolicy<Req> {
    fn clone(&self) -> Self {
        Self {
            retry_codes: self.retry_codes.clone(),
            should_retry: self.should_retry.clone(),
            resume_request: self.resume_request.clone(),
            backoff: self.backoff.clone(),
        }
    }
}

impl<Req> std::fmt::Debug for RetryPolicy<Req> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retry_codes", &self.retry_codes)
            .field("should_retry", &self.should_retry.is_some())
            .field("resume_request", &self.resume_request.is_some())
            .field("backoff", &self.backoff)
            .finish()
    }
}
