// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Call cancellation context.
//!
//! Every stream — the consumer-facing proxy and each upstream attempt —
//! carries an [`CallContext`] through which cancellation is requested and
//! observed. [`Controller`] is the standard implementation, backed by a
//! [`CancellationToken`].

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Control surface for one stream.
///
/// `cancel()` is idempotent: calling it after terminal completion is a no-op.
/// The owner of the stream is the only party that should call it.
#[async_trait]
pub trait CallContext: Send + Sync + Debug {
    /// Unique id for the stream, used in log lines.
    fn id(&self) -> &str;

    /// True once `cancel()` has been called.
    fn is_cancelled(&self) -> bool;

    /// Request termination. No further `data` will be delivered once the
    /// producer observes the flag.
    fn cancel(&self);

    /// Resolves when `cancel()` has been called; immediately if it already
    /// was.
    async fn cancelled(&self);
}

/// Provides access to the context controlling a stream.
pub trait ContextProvider: Send + Debug {
    fn context(&self) -> Arc<dyn CallContext>;
}

/// Standard [`CallContext`] implementation.
#[derive(Debug)]
pub struct Controller {
    id: String,
    token: CancellationToken,
}

impl Controller {
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    pub fn with_id(id: String) -> Self {
        Self {
            id,
            token: CancellationToken::new(),
        }
    }

    /// A child controller sharing this controller's cancellation scope:
    /// cancelling the parent cancels the child, not the other way around.
    pub fn child(&self) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            token: self.token.child_token(),
        }
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CallContext for Controller {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn cancel(&self) {
        self.token.cancel();
    }

    async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}
