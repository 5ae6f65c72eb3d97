// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Call error model.
//!
//! Every failure surfaced by the runtime is a [`CallError`]: a gRPC-style
//! status code, a message, and whatever structured detail the server attached
//! to the trailing metadata. The `grpc-status-details-bin` metadata key may
//! carry a binary `google.rpc.Status` with embedded `google.rpc.ErrorInfo`
//! entries; [`CallError::parse_status_details`] decodes those into the
//! `domain` / `reason` / `error_info_metadata` fields.

use std::collections::HashMap;
use std::fmt;

use prost::Message;
use serde::{Deserialize, Serialize};

/// Opaque key/value trailers attached to a call. Values may be binary.
pub type Metadata = HashMap<String, Vec<u8>>;

/// Metadata key carrying a binary-encoded `google.rpc.Status`.
pub const STATUS_DETAILS_KEY: &str = "grpc-status-details-bin";

/// The canonical gRPC status code table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    /// Map a wire integer back to a code. Out-of-range values collapse to
    /// [`Code::Unknown`], matching what a conformant client does with codes
    /// it does not recognize.
    pub fn from_i32(value: i32) -> Code {
        match value {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }

    pub fn value(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        };
        write!(f, "{name}")
    }
}

/// Hand-rolled prost messages for the status wire blob.
///
/// Field tags follow `google/rpc/status.proto` and
/// `google/rpc/error_details.proto`; only the shapes the decoder reads are
/// defined here.
pub mod rpc_status {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct RpcStatus {
        #[prost(int32, tag = "1")]
        pub code: i32,
        #[prost(string, tag = "2")]
        pub message: ::prost::alloc::string::String,
        #[prost(message, repeated, tag = "3")]
        pub details: ::prost::alloc::vec::Vec<::prost_types::Any>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ErrorInfo {
        #[prost(string, tag = "1")]
        pub reason: ::prost::alloc::string::String,
        #[prost(string, tag = "2")]
        pub domain: ::prost::alloc::string::String,
        #[prost(map = "string, string", tag = "3")]
        pub metadata: ::std::collections::HashMap<
            ::prost::alloc::string::String,
            ::prost::alloc::string::String,
        >,
    }
}

/// The standardized error for a call attempt.
///
/// Created at the point of failure, mutated only by
/// [`parse_status_details`](CallError::parse_status_details) and note
/// attachment, and owned by the consumer once surfaced.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct CallError {
    pub code: Code,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub error_info_metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip)]
    details_decoded: bool,
}

impl CallError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: String::new(),
            metadata: Metadata::new(),
            domain: None,
            reason: None,
            error_info_metadata: HashMap::new(),
            note: None,
            details_decoded: false,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    /// Decode the `grpc-status-details-bin` trailer into the structured
    /// detail fields.
    ///
    /// Absent metadata, unknown `type_url`s, and malformed payloads leave the
    /// fields unset. Decoding is idempotent; a second call is a no-op.
    pub fn parse_status_details(&mut self) -> &mut Self {
        if self.details_decoded {
            return self;
        }
        self.details_decoded = true;

        let Some(blob) = self.metadata.get(STATUS_DETAILS_KEY) else {
            return self;
        };
        let Ok(status) = rpc_status::RpcStatus::decode(blob.as_slice()) else {
            tracing::debug!(code = %self.code, "malformed status details blob; ignoring");
            return self;
        };
        for any in &status.details {
            if !any.type_url.ends_with("ErrorInfo") {
                continue;
            }
            match rpc_status::ErrorInfo::decode(any.value.as_slice()) {
                Ok(info) => {
                    self.reason = Some(info.reason);
                    self.domain = Some(info.domain);
                    self.error_info_metadata = info.metadata;
                }
                Err(err) => {
                    tracing::debug!(%err, "malformed ErrorInfo payload; ignoring");
                }
            }
        }
        self
    }
}
