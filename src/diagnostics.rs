// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Warn-once diagnostics.
//!
//! Warning kinds are memoized by kind string: the first emission of a kind
//! logs through `tracing`, later emissions of the same kind are dropped.
//! Components take a registry by reference so tests can observe emissions on
//! a private instance; production code uses the process-wide
//! [`Diagnostics::global`] registry.

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

/// Deprecation warning for the legacy retry-options mechanism as a whole.
pub const LEGACY_RETRY_OPTIONS_DEPRECATED: &str = "LegacyRetryOptionsDeprecated";
/// `no_response_retries` is accepted but has no effect.
pub const UNSUPPORTED_NO_RESPONSE_RETRIES: &str = "UnsupportedNoResponseRetries";
/// `current_retry_attempt` is accepted but has no effect.
pub const UNSUPPORTED_CURRENT_RETRY_ATTEMPT: &str = "UnsupportedCurrentRetryAttempt";
/// `object_mode` is accepted but has no effect.
pub const UNSUPPORTED_OBJECT_MODE: &str = "UnsupportedObjectMode";
/// `auto_paginate: true` passed to a surface that manages paging itself.
pub const AUTOPAGINATE_TRUE_WARNING: &str = "AutopaginateTrueWarning";

static GLOBAL: OnceLock<Diagnostics> = OnceLock::new();

#[derive(Debug, Default)]
pub struct Diagnostics {
    seen: Mutex<HashSet<String>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static Diagnostics {
        GLOBAL.get_or_init(Diagnostics::new)
    }

    /// Emit a warning of the given kind. Returns `true` if this was the first
    /// emission of the kind on this registry.
    pub fn emit(&self, kind: &str, message: &str) -> bool {
        let mut seen = self.seen.lock().expect("diagnostics mutex poisoned");
        if !seen.insert(kind.to_string()) {
            return false;
        }
        tracing::warn!(kind, "{message}");
        true
    }

    /// Whether a kind has been emitted on this registry.
    pub fn emitted(&self, kind: &str) -> bool {
        self.seen
            .lock()
            .expect("diagnostics mutex poisoned")
            .contains(kind)
    }

    /// Kinds emitted so far, in no particular order.
    pub fn emitted_kinds(&self) -> Vec<String> {
        self.seen
            .lock()
            .expect("diagnostics mutex poisoned")
            .iter()
            .cloned()
            .collect()
    }
}
