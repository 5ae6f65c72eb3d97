// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The stream proxy: one logical stream across one or more upstream attempts.
//!
//! The proxy relays lifecycle events from the current upstream attempt to the
//! consumer, synthesizing the response envelope from `metadata`/`status` and
//! holding completion until both `end` and `status` have been seen. For
//! server-streaming calls with the streaming retry engine enabled, a failed
//! attempt is classified against the retry policy; transient failures tear
//! down the upstream, wait out a jittered backoff, rebuild the request
//! through the resumption function, and start a new attempt. Already
//! delivered data is never replayed; the resumption function is responsible
//! for advancing the request past it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream;

use crate::backoff::{jittered, AbandonReason, RetryClock};
use crate::context::{CallContext, Controller};
use crate::engine::{
    CallEvent, CallStream, Data, DuplexStreamingCall, DuplexStreamingStub, ResponseEnvelope,
    StreamEvent, StreamingCall, StreamingStub,
};
use crate::error::CallError;
use crate::options::CallSettings;
use crate::retry::RetryPolicy;

/// Note attached when the retry engine observes a failure it will not retry.
pub const NOT_TRANSIENT_NOTE: &str =
    "Exception occurred in retry method that was not classified as transient";
/// Terminal message when both retry budgets are configured.
pub const BOTH_BUDGETS_MSG: &str =
    "Cannot set both totalTimeoutMillis and maxRetries in backoffSettings.";
/// Note attached when retries are configured but the budget is zero.
pub const MAX_RETRIES_ZERO_NOTE: &str = "Max retries is set to zero.";

/// Legacy server-streaming mode retries this many "no response" failures
/// when no explicit budget is configured.
const LEGACY_DEFAULT_NO_RESPONSE_RETRIES: u32 = 2;

/// The call shape being proxied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingType {
    ServerStreaming,
    ClientStreaming,
    BidiStreaming,
}

/// Relays upstream lifecycle events to consumer events.
///
/// Owns the synthesized-response and end-buffering rules shared by every
/// mode: exactly one `response` per logical stream, emitted before `status`;
/// completion only once both `end` and `status` have arrived.
struct EventRelay<Msg> {
    pending: VecDeque<StreamEvent<Msg>>,
    response_emitted: bool,
    status_received: bool,
    data_end: bool,
}

impl<Msg> EventRelay<Msg> {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            response_emitted: false,
            status_received: false,
            data_end: false,
        }
    }

    /// Translate one non-error upstream event. Returns `true` when the
    /// logical stream is complete.
    fn on_event(&mut self, event: CallEvent<Msg>) -> bool {
        match event {
            CallEvent::Metadata(metadata) => {
                self.pending.push_back(StreamEvent::Metadata(metadata.clone()));
                if !self.response_emitted {
                    self.response_emitted = true;
                    self.pending
                        .push_back(StreamEvent::Response(ResponseEnvelope::ok(Some(metadata))));
                }
                false
            }
            CallEvent::Response(envelope) => {
                self.response_emitted = true;
                self.pending.push_back(StreamEvent::Response(envelope));
                false
            }
            CallEvent::Data(message) => {
                self.pending.push_back(StreamEvent::Data(message));
                false
            }
            CallEvent::Status(status) => {
                if !self.response_emitted {
                    self.response_emitted = true;
                    self.pending
                        .push_back(StreamEvent::Response(ResponseEnvelope::ok(None)));
                }
                self.status_received = true;
                self.pending.push_back(StreamEvent::Status(status));
                self.data_end
            }
            CallEvent::End => {
                self.data_end = true;
                self.status_received
            }
            CallEvent::Error(err) => {
                self.pending.push_back(StreamEvent::Error(err));
                true
            }
        }
    }

    /// Forget per-attempt progress before a retry. The response envelope is
    /// per logical stream and survives.
    fn reset_attempt(&mut self) {
        self.status_received = false;
        self.data_end = false;
    }
}

enum Step<Msg> {
    Cancelled,
    Event(Option<CallEvent<Msg>>),
}

/// Await the next upstream event, racing consumer cancellation. Cancellation
/// is reported once; afterwards the caller drains the upstream for its
/// cancellation error.
async fn next_step<Msg: Data>(
    attempt: &mut CallStream<Msg>,
    consumer_ctx: &Arc<dyn CallContext>,
    cancel_forwarded: bool,
) -> Step<Msg> {
    if cancel_forwarded {
        return Step::Event(attempt.next().await);
    }
    tokio::select! {
        biased;
        _ = consumer_ctx.cancelled() => Step::Cancelled,
        event = attempt.next() => Step::Event(event),
    }
}

/// The retry state machine for server-streaming calls (the
/// `streaming_retries` mode).
struct RetryState<Req, Msg> {
    stub: Arc<dyn StreamingStub<Req, Msg>>,
    policy: RetryPolicy<Req>,
    clock: RetryClock,
    original_request: Req,
    request: Req,
    consumer_ctx: Arc<dyn CallContext>,
    attempt: Option<CallStream<Msg>>,
    relay: EventRelay<Msg>,
    finished: bool,
    cancel_forwarded: bool,
    retry_count: u32,
    delay: Duration,
    rpc_timeout: Duration,
    deadline: Option<Instant>,
    total_timeout_millis: Option<u128>,
}

impl<Req, Msg> RetryState<Req, Msg>
where
    Req: Data + Clone,
    Msg: Data,
{
    fn new(
        stub: Arc<dyn StreamingStub<Req, Msg>>,
        request: Req,
        policy: RetryPolicy<Req>,
        consumer_ctx: Arc<dyn CallContext>,
    ) -> Self {
        let clock = RetryClock::new(policy.backoff.clone());
        let delay = policy.backoff.initial_retry_delay;
        let rpc_timeout = policy.backoff.initial_rpc_timeout;
        let deadline = policy.backoff.total_timeout.map(|t| Instant::now() + t);
        let total_timeout_millis = policy.backoff.total_timeout.map(|t| t.as_millis());
        Self {
            stub,
            policy,
            clock,
            original_request: request.clone(),
            request,
            consumer_ctx,
            attempt: None,
            relay: EventRelay::new(),
            finished: false,
            cancel_forwarded: false,
            retry_count: 0,
            delay,
            rpc_timeout,
            deadline,
            total_timeout_millis,
        }
    }

    async fn next_event(&mut self) -> Option<StreamEvent<Msg>> {
        loop {
            if let Some(event) = self.relay.pending.pop_front() {
                if event.is_terminal() {
                    self.finished = true;
                }
                return Some(event);
            }
            if self.finished {
                return None;
            }

            if self.attempt.is_none() {
                if self.consumer_ctx.is_cancelled() {
                    self.finished = true;
                    return Some(StreamEvent::Error(CallError::cancelled(
                        "stream cancelled before the next attempt started",
                    )));
                }
                match self
                    .stub
                    .call(self.request.clone(), Some(self.rpc_timeout))
                    .await
                {
                    Ok(attempt) => self.attempt = Some(attempt),
                    Err(err) => {
                        self.handle_error(err).await;
                        continue;
                    }
                }
            }

            let step = {
                let attempt = self.attempt.as_mut().expect("attempt is live");
                next_step(attempt, &self.consumer_ctx, self.cancel_forwarded).await
            };
            match step {
                Step::Cancelled => {
                    if let Some(attempt) = &self.attempt {
                        attempt.cancel();
                    }
                    self.cancel_forwarded = true;
                }
                Step::Event(Some(CallEvent::Data(message))) => {
                    // Progress resets the consecutive-failure budget.
                    self.retry_count = 0;
                    self.relay.pending.push_back(StreamEvent::Data(message));
                }
                Step::Event(Some(CallEvent::Error(err))) => {
                    self.handle_error(err).await;
                }
                Step::Event(Some(event)) => {
                    if self.relay.on_event(event) {
                        self.finished = true;
                    }
                }
                Step::Event(None) => {
                    // Upstream exhausted without a terminal event; nothing
                    // more will arrive.
                    self.attempt = None;
                    self.finished = true;
                }
            }
        }
    }

    /// Decide the fate of a failed attempt: terminal error, or backoff and a
    /// fresh attempt.
    async fn handle_error(&mut self, mut err: CallError) {
        self.attempt = None;
        err.parse_status_details();

        if self.cancel_forwarded || self.consumer_ctx.is_cancelled() {
            // The user's cancellation, not a transient failure.
            self.relay.pending.push_back(StreamEvent::Error(err));
            return;
        }

        let max_retries = self.policy.backoff.max_retries;
        let total_timeout = self.policy.backoff.total_timeout;

        // With no retry budget there is no retry regime; the failure is
        // terminal no matter what the policy says.
        if max_retries.is_none() && total_timeout.is_none() {
            self.relay
                .pending
                .push_back(StreamEvent::Error(err.with_note(NOT_TRANSIENT_NOTE)));
            return;
        }
        if max_retries.is_some() && total_timeout.is_some() {
            self.relay
                .pending
                .push_back(StreamEvent::Error(CallError::invalid_argument(
                    BOTH_BUDGETS_MSG,
                )));
            return;
        }
        if !self.policy.should_retry_error(&err) {
            self.relay
                .pending
                .push_back(StreamEvent::Error(err.with_note(NOT_TRANSIENT_NOTE)));
            return;
        }

        match self
            .clock
            .exceeded(self.retry_count, Instant::now(), self.deadline)
        {
            Some(AbandonReason::MaxRetries) => {
                self.relay
                    .pending
                    .push_back(StreamEvent::Error(CallError::deadline_exceeded(format!(
                        "Exceeded maximum number of retries retrying error {err} before any response was received"
                    ))));
                return;
            }
            Some(AbandonReason::DeadlineElapsed) => {
                let millis = self.total_timeout_millis.unwrap_or_default();
                self.relay
                    .pending
                    .push_back(StreamEvent::Error(CallError::deadline_exceeded(format!(
                        "Total timeout of API exceeded {millis} milliseconds retrying error {err}  before any response was received."
                    ))));
                return;
            }
            None => {}
        }
        if max_retries == Some(0) {
            self.relay
                .pending
                .push_back(StreamEvent::Error(err.with_note(MAX_RETRIES_ZERO_NOTE)));
            return;
        }

        let sleep = self.clock.jittered(self.delay);
        tracing::debug!(
            id = self.consumer_ctx.id(),
            retry_count = self.retry_count,
            sleep_ms = sleep.as_millis() as u64,
            %err,
            "retrying stream after transient error"
        );
        let consumer_ctx = self.consumer_ctx.clone();
        tokio::select! {
            biased;
            _ = consumer_ctx.cancelled() => {
                self.relay
                    .pending
                    .push_back(StreamEvent::Error(CallError::cancelled(
                        "stream cancelled during retry backoff",
                    )));
                return;
            }
            _ = tokio::time::sleep(sleep) => {}
        }

        self.retry_count += 1;
        let now = Instant::now();
        self.delay = self.clock.next_delay(self.delay);
        self.rpc_timeout = self.clock.next_timeout(self.rpc_timeout, self.deadline, now);
        self.request = self.policy.next_request(&self.original_request);
        self.relay.reset_attempt();
    }
}

/// Single-attempt forwarding with event synthesis: client/bidi streaming and
/// the non-retrying server-streaming paths share it. `no_response_retries`
/// is the legacy server-streaming mode's budget for attempts that failed
/// before delivering any event; zero disables retries entirely.
struct PassthroughState<Req, Msg> {
    stub: Arc<dyn StreamingStub<Req, Msg>>,
    request: Req,
    rpc_timeout: Option<Duration>,
    consumer_ctx: Arc<dyn CallContext>,
    attempt: Option<CallStream<Msg>>,
    relay: EventRelay<Msg>,
    finished: bool,
    cancel_forwarded: bool,
    received_any: bool,
    retries_left: u32,
    retry_delay: Duration,
}

impl<Req, Msg> PassthroughState<Req, Msg>
where
    Req: Data + Clone,
    Msg: Data,
{
    async fn next_event(&mut self) -> Option<StreamEvent<Msg>> {
        loop {
            if let Some(event) = self.relay.pending.pop_front() {
                if event.is_terminal() {
                    self.finished = true;
                }
                return Some(event);
            }
            if self.finished {
                return None;
            }

            if self.attempt.is_none() {
                if self.consumer_ctx.is_cancelled() {
                    self.finished = true;
                    return Some(StreamEvent::Error(CallError::cancelled(
                        "stream cancelled before the call started",
                    )));
                }
                match self.stub.call(self.request.clone(), self.rpc_timeout).await {
                    Ok(attempt) => self.attempt = Some(attempt),
                    Err(err) => {
                        self.handle_error(err).await;
                        continue;
                    }
                }
            }

            let step = {
                let attempt = self.attempt.as_mut().expect("attempt is live");
                next_step(attempt, &self.consumer_ctx, self.cancel_forwarded).await
            };
            match step {
                Step::Cancelled => {
                    if let Some(attempt) = &self.attempt {
                        attempt.cancel();
                    }
                    self.cancel_forwarded = true;
                }
                Step::Event(Some(CallEvent::Error(err))) => {
                    self.handle_error(err).await;
                }
                Step::Event(Some(event)) => {
                    self.received_any = true;
                    if self.relay.on_event(event) {
                        self.finished = true;
                    }
                }
                Step::Event(None) => {
                    self.attempt = None;
                    self.finished = true;
                }
            }
        }
    }

    async fn handle_error(&mut self, err: CallError) {
        self.attempt = None;
        let user_cancelled = self.cancel_forwarded || self.consumer_ctx.is_cancelled();
        if !user_cancelled && !self.received_any && self.retries_left > 0 {
            self.retries_left -= 1;
            tracing::debug!(
                id = self.consumer_ctx.id(),
                retries_left = self.retries_left,
                %err,
                "retrying stream that failed before any response"
            );
            tokio::time::sleep(jittered(self.retry_delay)).await;
            return;
        }
        self.relay.pending.push_back(StreamEvent::Error(err));
    }
}

/// REST-based server streaming: the upstream is handed to the consumer
/// unchanged, one attempt, never retried by this engine.
struct RestState<Req, Msg> {
    stub: Arc<dyn StreamingStub<Req, Msg>>,
    request: Req,
    rpc_timeout: Option<Duration>,
    consumer_ctx: Arc<dyn CallContext>,
    attempt: Option<CallStream<Msg>>,
    finished: bool,
    cancel_forwarded: bool,
}

impl<Req, Msg> RestState<Req, Msg>
where
    Req: Data + Clone,
    Msg: Data,
{
    async fn next_event(&mut self) -> Option<StreamEvent<Msg>> {
        loop {
            if self.finished {
                return None;
            }
            if self.attempt.is_none() {
                match self.stub.call(self.request.clone(), self.rpc_timeout).await {
                    Ok(attempt) => self.attempt = Some(attempt),
                    Err(err) => {
                        self.finished = true;
                        return Some(StreamEvent::Error(err));
                    }
                }
            }
            let step = {
                let attempt = self.attempt.as_mut().expect("attempt is live");
                next_step(attempt, &self.consumer_ctx, self.cancel_forwarded).await
            };
            match step {
                Step::Cancelled => {
                    if let Some(attempt) = &self.attempt {
                        attempt.cancel();
                    }
                    self.cancel_forwarded = true;
                }
                Step::Event(Some(CallEvent::Metadata(md))) => {
                    return Some(StreamEvent::Metadata(md));
                }
                Step::Event(Some(CallEvent::Response(envelope))) => {
                    return Some(StreamEvent::Response(envelope));
                }
                Step::Event(Some(CallEvent::Data(message))) => {
                    return Some(StreamEvent::Data(message));
                }
                Step::Event(Some(CallEvent::Status(status))) => {
                    return Some(StreamEvent::Status(status));
                }
                Step::Event(Some(CallEvent::Error(err))) => {
                    self.finished = true;
                    return Some(StreamEvent::Error(err));
                }
                Step::Event(Some(CallEvent::End)) | Step::Event(None) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }
}

/// The duplex proxy over a stub call.
///
/// Presents a single logical stream to the consumer; for server-streaming
/// calls, transparently tears down and restarts the upstream on retryable
/// failures per the resolved [`CallSettings`].
pub struct StreamProxy<Req, Msg> {
    stream_type: StreamingType,
    stub: Arc<dyn StreamingStub<Req, Msg>>,
    settings: CallSettings<Req>,
}

impl<Req, Msg> StreamProxy<Req, Msg>
where
    Req: Data + Clone,
    Msg: Data,
{
    pub fn new(
        stream_type: StreamingType,
        stub: Arc<dyn StreamingStub<Req, Msg>>,
        settings: CallSettings<Req>,
    ) -> Self {
        Self {
            stream_type,
            stub,
            settings,
        }
    }

    /// Open the logical stream. The first upstream attempt is issued on the
    /// consumer's first poll.
    pub fn call(&self, request: Req) -> StreamingCall<Msg> {
        match self.stream_type {
            StreamingType::ServerStreaming => {
                if self.settings.rest_transport {
                    self.rest_call(request)
                } else if self.settings.streaming_retries {
                    self.retrying_call(request)
                } else {
                    self.legacy_call(request)
                }
            }
            // Client and bidi streaming bypass the retry machinery: one
            // attempt, events forwarded, cancellation propagated.
            StreamingType::ClientStreaming | StreamingType::BidiStreaming => {
                self.single_attempt_call(request, 0)
            }
        }
    }

    fn policy(&self) -> RetryPolicy<Req> {
        self.settings.retry.clone().unwrap_or_default()
    }

    fn retrying_call(&self, request: Req) -> StreamingCall<Msg> {
        let consumer_ctx: Arc<dyn CallContext> = Arc::new(Controller::new());
        let state = RetryState::new(
            self.stub.clone(),
            request,
            self.policy(),
            consumer_ctx.clone(),
        );
        let stream = stream::unfold(state, |mut state| async move {
            state.next_event().await.map(|event| (event, state))
        });
        StreamingCall::new(Box::pin(stream), consumer_ctx)
    }

    fn legacy_call(&self, request: Req) -> StreamingCall<Msg> {
        let budget = self
            .settings
            .retry
            .as_ref()
            .and_then(|policy| policy.backoff.max_retries)
            .unwrap_or(LEGACY_DEFAULT_NO_RESPONSE_RETRIES);
        self.single_attempt_call(request, budget)
    }

    fn single_attempt_call(&self, request: Req, no_response_retries: u32) -> StreamingCall<Msg> {
        let policy = self.policy();
        let consumer_ctx: Arc<dyn CallContext> = Arc::new(Controller::new());
        let state = PassthroughState {
            stub: self.stub.clone(),
            request,
            rpc_timeout: self
                .settings
                .retry
                .as_ref()
                .map(|p| p.backoff.initial_rpc_timeout),
            consumer_ctx: consumer_ctx.clone(),
            attempt: None,
            relay: EventRelay::new(),
            finished: false,
            cancel_forwarded: false,
            received_any: false,
            retries_left: no_response_retries,
            retry_delay: policy.backoff.initial_retry_delay,
        };
        let stream = stream::unfold(state, |mut state| async move {
            state.next_event().await.map(|event| (event, state))
        });
        StreamingCall::new(Box::pin(stream), consumer_ctx)
    }

    fn rest_call(&self, request: Req) -> StreamingCall<Msg> {
        let consumer_ctx: Arc<dyn CallContext> = Arc::new(Controller::new());
        let state = RestState {
            stub: self.stub.clone(),
            request,
            rpc_timeout: self
                .settings
                .retry
                .as_ref()
                .map(|p| p.backoff.initial_rpc_timeout),
            consumer_ctx: consumer_ctx.clone(),
            attempt: None,
            finished: false,
            cancel_forwarded: false,
        };
        let stream = stream::unfold(state, |mut state| async move {
            state.next_event().await.map(|event| (event, state))
        });
        StreamingCall::new(Box::pin(stream), consumer_ctx)
    }
}

/// Open a client- or bidi-streaming call through a duplex stub: one upstream
/// attempt, lifecycle events forwarded with the usual synthesis, consumer
/// writes passed through untouched.
pub async fn duplex_call<Req, In, Msg>(
    stream_type: StreamingType,
    stub: Arc<dyn DuplexStreamingStub<Req, In, Msg>>,
    request: Req,
    settings: CallSettings<Req>,
) -> Result<DuplexStreamingCall<In, Msg>, CallError>
where
    Req: Data + Clone,
    In: Data,
    Msg: Data,
{
    debug_assert!(stream_type != StreamingType::ServerStreaming);
    let rpc_timeout = settings
        .retry
        .as_ref()
        .map(|policy| policy.backoff.initial_rpc_timeout);
    let upstream = stub.call(request, rpc_timeout).await?;
    let writer = upstream.writer.clone();

    let consumer_ctx: Arc<dyn CallContext> = Arc::new(Controller::new());
    let state = DuplexRelayState {
        upstream: upstream.events,
        relay: EventRelay::new(),
        consumer_ctx: consumer_ctx.clone(),
        finished: false,
        cancel_forwarded: false,
    };
    let stream = stream::unfold(state, |mut state| async move {
        state.next_event().await.map(|event| (event, state))
    });
    Ok(DuplexStreamingCall::new(
        StreamingCall::new(Box::pin(stream), consumer_ctx),
        writer,
    ))
}

struct DuplexRelayState<Msg> {
    upstream: CallStream<Msg>,
    relay: EventRelay<Msg>,
    consumer_ctx: Arc<dyn CallContext>,
    finished: bool,
    cancel_forwarded: bool,
}

impl<Msg: Data> DuplexRelayState<Msg> {
    async fn next_event(&mut self) -> Option<StreamEvent<Msg>> {
        loop {
            if let Some(event) = self.relay.pending.pop_front() {
                if event.is_terminal() {
                    self.finished = true;
                }
                return Some(event);
            }
            if self.finished {
                return None;
            }
            let step = next_step(&mut self.upstream, &self.consumer_ctx, self.cancel_forwarded).await;
            match step {
                Step::Cancelled => {
                    self.upstream.cancel();
                    self.cancel_forwarded = true;
                }
                Step::Event(Some(event)) => {
                    if self.relay.on_event(event) {
                        self.finished = true;
                    }
                }
                Step::Event(None) => {
                    self.finished = true;
                }
            }
        }
    }
}
