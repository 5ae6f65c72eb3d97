// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Client-side streaming RPC runtime.
//!
//! The crate sits between a generated stub — which turns a typed request
//! into a wire call producing lifecycle events — and a consumer reading
//! response messages. Its two working parts are the
//! [`StreamProxy`](streaming::StreamProxy), a duplex proxy that transparently
//! tears down and restarts server-streaming calls on retryable failures, and
//! the [page engine](paginate), which turns page-token RPCs into lazy
//! sequences.

pub use anyhow::{Context as ErrorContext, Error, Result, anyhow as error, bail as raise};

pub mod backoff;
pub mod context;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod legacy;
pub mod logging;
pub mod options;
pub mod paginate;
pub mod retry;
pub mod streaming;

pub use backoff::BackoffSettings;
pub use context::{CallContext, ContextProvider, Controller};
pub use engine::{
    CallEvent, CallStream, ResponseEnvelope, Status, StreamEvent, StreamingCall, StreamingStub,
    UnaryStub,
};
pub use error::{CallError, Code, Metadata};
pub use futures::stream;
pub use legacy::LegacyRetryOptions;
pub use options::{CallOptions, CallSettings};
pub use paginate::PageDescriptor;
pub use retry::RetryPolicy;
pub use streaming::{StreamProxy, StreamingType};
pub use tokio_util::sync::CancellationToken;
