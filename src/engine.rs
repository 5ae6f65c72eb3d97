// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Stub and stream abstractions.
//!
//! A generated stub turns a typed request into a wire call producing a
//! [`CallStream`]: an ordered sequence of lifecycle events plus a
//! cancellation context. The stream proxy consumes that contract and presents
//! a [`StreamingCall`] to the user. The runtime never looks inside message
//! payloads; everything [`Send`] + [`Sync`] + `'static` qualifies as
//! [`Data`].

use std::fmt::Debug;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub use async_trait::async_trait;
use futures::stream::Stream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::context::{CallContext, ContextProvider};
use crate::error::{CallError, Code, Metadata};

/// All `Send + Sync + 'static` types can be used as request and message
/// types.
pub trait Data: Send + Sync + 'static {}
impl<T: Send + Sync + 'static> Data for T {}

/// A boxed stream of [`Data`] items.
pub type DataStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// The terminal protocol event of an attempt. Always emitted by a conformant
/// upstream, after all `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub code: Code,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            code: Code::Ok,
            message: String::new(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// The synthesized response envelope, delivered exactly once per successful
/// stream, before any `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub code: u16,
    pub message: String,
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl ResponseEnvelope {
    /// The `200 OK` envelope synthesized from `metadata` or `status`.
    pub fn ok(metadata: Option<Metadata>) -> Self {
        Self {
            code: 200,
            message: "OK".to_string(),
            details: String::new(),
            metadata,
        }
    }
}

/// One lifecycle event on an upstream attempt stream.
///
/// Ordering per attempt: `Metadata?`, `Response?`, `Data*`, then `Status`,
/// `End`, or `Error`. `End` may arrive before `Status`; the proxy holds
/// completion until both have been seen.
#[derive(Debug, Clone)]
pub enum CallEvent<Msg> {
    Metadata(Metadata),
    Response(ResponseEnvelope),
    Data(Msg),
    Status(Status),
    End,
    Error(CallError),
}

/// One event on the consumer-facing stream. Stream exhaustion is the `end`
/// event; an `Error` item is terminal and is followed by exhaustion.
#[derive(Debug, Clone)]
pub enum StreamEvent<Msg> {
    Metadata(Metadata),
    Response(ResponseEnvelope),
    Data(Msg),
    Status(Status),
    Error(CallError),
}

impl<Msg> StreamEvent<Msg> {
    pub fn data(self) -> Option<Msg> {
        match self {
            StreamEvent::Data(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Error(_))
    }
}

/// The upstream stream produced by a stub for one attempt.
///
/// Owned exclusively by the proxy; only the proxy may call
/// [`cancel`](CallStream::cancel). A cancelled stream terminates without
/// further `Data`, surfacing the cancellation as an `Error` event.
pub struct CallStream<Msg> {
    events: DataStream<CallEvent<Msg>>,
    ctx: Arc<dyn CallContext>,
}

impl<Msg: Data> CallStream<Msg> {
    pub fn new(events: DataStream<CallEvent<Msg>>, ctx: Arc<dyn CallContext>) -> Self {
        Self { events, ctx }
    }

    /// Build a stream from a channel of events, the way transport adapters
    /// feed attempts.
    pub fn from_receiver(
        events: mpsc::Receiver<CallEvent<Msg>>,
        ctx: Arc<dyn CallContext>,
    ) -> Self {
        Self::new(Box::pin(ReceiverStream::new(events)), ctx)
    }

    pub async fn next(&mut self) -> Option<CallEvent<Msg>> {
        self.events.next().await
    }

    pub fn cancel(&self) {
        self.ctx.cancel();
    }
}

impl<Msg: Data> Stream for CallStream<Msg> {
    type Item = CallEvent<Msg>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

impl<Msg: Data> ContextProvider for CallStream<Msg> {
    fn context(&self) -> Arc<dyn CallContext> {
        self.ctx.clone()
    }
}

impl<Msg> Debug for CallStream<Msg> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallStream").field("ctx", &self.ctx).finish()
    }
}

/// An upstream stream for client- and bidi-streaming calls: lifecycle events
/// out, a writer half for messages in.
pub struct DuplexCallStream<In, Msg> {
    pub events: CallStream<Msg>,
    pub writer: mpsc::Sender<In>,
}

impl<In: Data, Msg: Data> DuplexCallStream<In, Msg> {
    pub fn new(events: CallStream<Msg>, writer: mpsc::Sender<In>) -> Self {
        Self { events, writer }
    }
}

/// A server-streaming wire call: one request in, a stream of lifecycle
/// events out.
///
/// `timeout` is the per-attempt RPC timeout computed by the retry engine;
/// enforcement is the transport's concern. Attempt failures may surface
/// either as an `Err` here or as an `Error` event on the stream — the retry
/// engine treats both the same way.
#[async_trait]
pub trait StreamingStub<Req, Msg>: Send + Sync
where
    Req: Data,
    Msg: Data,
{
    async fn call(
        &self,
        request: Req,
        timeout: Option<Duration>,
    ) -> Result<CallStream<Msg>, CallError>;
}

/// A client- or bidi-streaming wire call. The proxy forwards consumer writes
/// through the returned writer untouched.
#[async_trait]
pub trait DuplexStreamingStub<Req, In, Msg>: Send + Sync
where
    Req: Data,
    In: Data,
    Msg: Data,
{
    async fn call(
        &self,
        request: Req,
        timeout: Option<Duration>,
    ) -> Result<DuplexCallStream<In, Msg>, CallError>;
}

/// A unary wire call over dynamic values, as consumed by the page engine.
///
/// Requests and responses are JSON values so the engine can navigate the
/// descriptor's field paths without knowing the message types.
#[async_trait]
pub trait UnaryStub: Send + Sync {
    async fn call(&self, request: serde_json::Value) -> Result<serde_json::Value, CallError>;
}

/// The consumer-facing logical stream presented by the proxy across one or
/// more upstream attempts.
pub struct StreamingCall<Msg> {
    stream: DataStream<StreamEvent<Msg>>,
    ctx: Arc<dyn CallContext>,
}

impl<Msg: Data> StreamingCall<Msg> {
    pub fn new(stream: DataStream<StreamEvent<Msg>>, ctx: Arc<dyn CallContext>) -> Self {
        Self { stream, ctx }
    }

    pub async fn next(&mut self) -> Option<StreamEvent<Msg>> {
        self.stream.next().await
    }

    /// Request cancellation: the live upstream attempt is cancelled and any
    /// pending retry is disarmed. A no-op after terminal completion.
    pub fn cancel(&self) {
        self.ctx.cancel();
    }

    /// Drain the stream, collecting every event.
    pub async fn collect_events(mut self) -> Vec<StreamEvent<Msg>> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

impl<Msg: Data> Stream for StreamingCall<Msg> {
    type Item = StreamEvent<Msg>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        Pin::new(&mut self.stream).poll_next(cx)
    }
}

impl<Msg: Data> ContextProvider for StreamingCall<Msg> {
    fn context(&self) -> Arc<dyn CallContext> {
        self.ctx.clone()
    }
}

impl<Msg> Debug for StreamingCall<Msg> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingCall")
            .field("ctx", &self.ctx)
            .finish()
    }
}

/// A duplex consumer stream: proxy events out, pass-through writer in.
pub struct DuplexStreamingCall<In, Msg> {
    inner: StreamingCall<Msg>,
    writer: mpsc::Sender<In>,
}

impl<In: Data, Msg: Data> DuplexStreamingCall<In, Msg> {
    pub fn new(inner: StreamingCall<Msg>, writer: mpsc::Sender<In>) -> Self {
        Self { inner, writer }
    }

    pub async fn next(&mut self) -> Option<StreamEvent<Msg>> {
        self.inner.next().await
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Write one message into the upstream call.
    pub async fn send(&self, message: In) -> Result<(), CallError> {
        self.writer
            .send(message)
            .await
            .map_err(|_| CallError::new(Code::Unavailable, "upstream writer closed"))
    }

    pub fn writer(&self) -> mpsc::Sender<In> {
        self.writer.clone()
    }
}

impl<In: Data, Msg: Data> Stream for DuplexStreamingCall<In, Msg> {
    type Item = StreamEvent<Msg>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl<In: Data, Msg: Data> ContextProvider for DuplexStreamingCall<In, Msg> {
    fn context(&self) -> Arc<dyn CallContext> {
        self.inner.context()
    }
}

impl<In, Msg> Debug for DuplexStreamingCall<In, Msg> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexStreamingCall").finish()
    }
}
