// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests for the stream proxy over a scripted stub: one script of
//! lifecycle events per upstream attempt.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use relay_client::backoff::BackoffSettings;
use relay_client::context::{CallContext, Controller};
use relay_client::diagnostics::Diagnostics;
use relay_client::engine::{
    async_trait, CallEvent, CallStream, Status, StreamEvent, StreamingCall, StreamingStub,
};
use relay_client::error::{CallError, Code, Metadata};
use relay_client::options::CallOptions;
use relay_client::retry::RetryPolicy;
use relay_client::stream;
use relay_client::engine::{DuplexCallStream, DuplexStreamingStub};
use relay_client::streaming::{
    duplex_call, StreamProxy, StreamingType, BOTH_BUDGETS_MSG, MAX_RETRIES_ZERO_NOTE,
    NOT_TRANSIENT_NOTE,
};
use tokio::sync::mpsc;

/// One step of a scripted attempt.
enum ScriptStep {
    Event(CallEvent<String>),
    Sleep(Duration),
    /// Park until the attempt is cancelled, then emit the cancellation
    /// error.
    Hang,
}

struct ScriptedStub {
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    requests: Mutex<Vec<Value>>,
    attempt_contexts: Mutex<Vec<Arc<dyn CallContext>>>,
}

impl ScriptedStub {
    fn new(scripts: Vec<Vec<ScriptStep>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            attempt_contexts: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn attempt_context(&self, index: usize) -> Arc<dyn CallContext> {
        self.attempt_contexts.lock().unwrap()[index].clone()
    }
}

fn cancellation_error() -> CallError {
    CallError::cancelled("call cancelled by the consumer")
}

#[async_trait]
impl StreamingStub<Value, String> for ScriptedStub {
    async fn call(
        &self,
        request: Value,
        _timeout: Option<Duration>,
    ) -> Result<CallStream<String>, CallError> {
        self.requests.lock().unwrap().push(request);
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        let ctx: Arc<dyn CallContext> = Arc::new(Controller::new());
        self.attempt_contexts.lock().unwrap().push(ctx.clone());

        let steps: VecDeque<ScriptStep> = script.into_iter().collect();
        let events = stream::unfold(
            (steps, ctx.clone(), false),
            |(mut steps, ctx, done)| async move {
                if done {
                    return None;
                }
                loop {
                    if ctx.is_cancelled() {
                        return Some((CallEvent::Error(cancellation_error()), (steps, ctx, true)));
                    }
                    match steps.pop_front() {
                        None => return None,
                        Some(ScriptStep::Event(event)) => {
                            return Some((event, (steps, ctx, false)));
                        }
                        Some(ScriptStep::Sleep(duration)) => {
                            tokio::time::sleep(duration).await;
                        }
                        Some(ScriptStep::Hang) => {
                            ctx.cancelled().await;
                            return Some((
                                CallEvent::Error(cancellation_error()),
                                (steps, ctx, true),
                            ));
                        }
                    }
                }
            },
        );
        Ok(CallStream::new(Box::pin(events), ctx))
    }
}

fn metadata(key: &str) -> Metadata {
    Metadata::from([(key.to_string(), vec![1u8])])
}

fn ev(event: CallEvent<String>) -> ScriptStep {
    ScriptStep::Event(event)
}

fn data(message: &str) -> ScriptStep {
    ev(CallEvent::Data(message.to_string()))
}

fn unavailable() -> CallError {
    CallError::new(Code::Unavailable, "connection reset")
}

fn fast_backoff() -> relay_client::backoff::BackoffSettingsBuilder {
    let mut builder = BackoffSettings::builder();
    builder
        .initial_retry_delay(Duration::from_millis(1))
        .retry_delay_multiplier(1.0)
        .max_retry_delay(Duration::from_millis(5));
    builder
}

fn proxy_with(
    stub: &Arc<ScriptedStub>,
    policy: Option<RetryPolicy<Value>>,
) -> StreamProxy<Value, String> {
    let mut options = CallOptions::new().with_streaming_retries(true);
    if let Some(policy) = policy {
        options = options.with_retry(policy);
    }
    let settings = options.resolve_with(&Diagnostics::new()).unwrap();
    StreamProxy::new(StreamingType::ServerStreaming, stub.clone(), settings)
}

async fn collect(call: StreamingCall<String>) -> Vec<StreamEvent<String>> {
    call.collect_events().await
}

fn data_of(events: &[StreamEvent<String>]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Data(message) => Some(message.clone()),
            _ => None,
        })
        .collect()
}

fn terminal_error(events: &[StreamEvent<String>]) -> &CallError {
    match events.last() {
        Some(StreamEvent::Error(err)) => err,
        other => panic!("expected a terminal error event, got {other:?}"),
    }
}

#[tokio::test]
async fn events_are_ordered_and_response_is_not_duplicated() {
    let stub = ScriptedStub::new(vec![vec![
        ev(CallEvent::Metadata(metadata("foo"))),
        data("a"),
        data("b"),
        ev(CallEvent::End),
        ev(CallEvent::Status(Status::ok())),
    ]]);
    let events = collect(proxy_with(&stub, None).call(json!({}))).await;

    let shape: Vec<&str> = events
        .iter()
        .map(|event| match event {
            StreamEvent::Metadata(_) => "metadata",
            StreamEvent::Response(_) => "response",
            StreamEvent::Data(_) => "data",
            StreamEvent::Status(_) => "status",
            StreamEvent::Error(_) => "error",
        })
        .collect();
    assert_eq!(
        shape,
        vec!["metadata", "response", "data", "data", "status"]
    );
}

#[tokio::test]
async fn response_is_synthesized_from_metadata() {
    let md = metadata("foo");
    let stub = ScriptedStub::new(vec![vec![
        ev(CallEvent::Metadata(md.clone())),
        ev(CallEvent::End),
        ev(CallEvent::Status(Status::ok().with_metadata(md.clone()))),
    ]]);
    let events = collect(proxy_with(&stub, None).call(json!({}))).await;

    let envelope = events
        .iter()
        .find_map(|event| match event {
            StreamEvent::Response(envelope) => Some(envelope.clone()),
            _ => None,
        })
        .expect("a response envelope");
    assert_eq!(envelope.code, 200);
    assert_eq!(envelope.message, "OK");
    assert_eq!(envelope.details, "");
    assert_eq!(envelope.metadata, Some(md));
}

#[tokio::test]
async fn response_is_synthesized_from_status_without_metadata() {
    let stub = ScriptedStub::new(vec![vec![
        ev(CallEvent::End),
        ev(CallEvent::Status(Status::ok().with_metadata(metadata("m")))),
    ]]);
    let events = collect(proxy_with(&stub, None).call(json!({}))).await;

    match &events[0] {
        StreamEvent::Response(envelope) => {
            assert_eq!(envelope.code, 200);
            assert_eq!(envelope.message, "OK");
            assert_eq!(envelope.details, "");
            assert!(envelope.metadata.is_none());
        }
        other => panic!("expected the synthesized response first, got {other:?}"),
    }
    assert!(matches!(events[1], StreamEvent::Status(_)));
    assert_eq!(events.len(), 2);
}

#[tokio::test]
async fn retries_preserve_already_delivered_data() {
    let stub = ScriptedStub::new(vec![
        vec![
            ev(CallEvent::Metadata(metadata("foo"))),
            data("Hello"),
            data("World"),
            ev(CallEvent::Error(unavailable())),
        ],
        vec![
            data("testing"),
            data("retries"),
            ev(CallEvent::End),
            ev(CallEvent::Status(Status::ok())),
        ],
    ]);
    let policy = RetryPolicy::new(
        vec![Code::Unavailable],
        fast_backoff().max_retries(1u32).build().unwrap(),
    );
    let events = collect(proxy_with(&stub, Some(policy)).call(json!({}))).await;

    assert_eq!(data_of(&events), vec!["Hello", "World", "testing", "retries"]);
    assert!(matches!(events.last(), Some(StreamEvent::Status(_))));
    assert_eq!(stub.call_count(), 2);
}

#[tokio::test]
async fn resumption_function_rebuilds_the_next_request() {
    let stub = ScriptedStub::new(vec![
        vec![ev(CallEvent::Error(unavailable()))],
        vec![ev(CallEvent::End), ev(CallEvent::Status(Status::ok()))],
    ]);
    let policy = RetryPolicy::new(
        vec![Code::Unavailable],
        fast_backoff().max_retries(2u32).build().unwrap(),
    )
    .with_resume_request(|request: &Value| {
        json!({"arg": request["arg"].as_i64().unwrap_or(0) + 2})
    });
    let events = collect(proxy_with(&stub, Some(policy)).call(json!({"arg": 0}))).await;

    assert!(matches!(events.last(), Some(StreamEvent::Status(_))));
    assert_eq!(stub.requests(), vec![json!({"arg": 0}), json!({"arg": 2})]);
}

#[tokio::test]
async fn both_budgets_fail_with_invalid_argument() {
    let stub = ScriptedStub::new(vec![vec![ev(CallEvent::Error(unavailable()))]]);
    let policy = RetryPolicy::new(
        vec![Code::Unavailable],
        fast_backoff()
            .max_retries(1u32)
            .total_timeout(Duration::from_millis(10))
            .build()
            .unwrap(),
    );
    let events = collect(proxy_with(&stub, Some(policy)).call(json!({}))).await;

    let err = terminal_error(&events);
    assert_eq!(err.code, Code::InvalidArgument);
    assert_eq!(err.message, BOTH_BUDGETS_MSG);
    assert_eq!(stub.call_count(), 1);
}

#[tokio::test]
async fn exceeding_max_retries_surfaces_deadline_exceeded() {
    let stub = ScriptedStub::new(vec![
        vec![ev(CallEvent::Error(unavailable()))],
        vec![ev(CallEvent::Error(unavailable()))],
        vec![ev(CallEvent::Error(unavailable()))],
    ]);
    let policy = RetryPolicy::new(
        vec![Code::Unavailable],
        fast_backoff().max_retries(2u32).build().unwrap(),
    );
    let events = collect(proxy_with(&stub, Some(policy)).call(json!({}))).await;

    let err = terminal_error(&events);
    assert_eq!(err.code, Code::DeadlineExceeded);
    assert!(
        err.message.starts_with("Exceeded maximum number of retries"),
        "unexpected message: {}",
        err.message
    );
    assert_eq!(stub.call_count(), 3);
}

#[tokio::test]
async fn exceeding_total_timeout_surfaces_deadline_exceeded() {
    let scripts = (0..5)
        .map(|_| {
            vec![
                ScriptStep::Sleep(Duration::from_millis(6)),
                ev(CallEvent::Error(unavailable())),
            ]
        })
        .collect();
    let stub = ScriptedStub::new(scripts);
    let policy = RetryPolicy::new(
        vec![Code::Unavailable],
        fast_backoff()
            .total_timeout(Duration::from_millis(10))
            .build()
            .unwrap(),
    );
    let events = collect(proxy_with(&stub, Some(policy)).call(json!({}))).await;

    let err = terminal_error(&events);
    assert_eq!(err.code, Code::DeadlineExceeded);
    assert!(
        err.message
            .contains("Total timeout of API exceeded 10 milliseconds"),
        "unexpected message: {}",
        err.message
    );
}

#[tokio::test]
async fn non_retryable_errors_carry_the_transient_note() {
    let stub = ScriptedStub::new(vec![vec![ev(CallEvent::Error(CallError::new(
        Code::InvalidArgument,
        "bad request",
    )))]]);
    let policy = RetryPolicy::new(
        vec![Code::NotFound],
        fast_backoff().max_retries(2u32).build().unwrap(),
    );
    let events = collect(proxy_with(&stub, Some(policy)).call(json!({}))).await;

    let err = terminal_error(&events);
    assert_eq!(err.code, Code::InvalidArgument);
    assert_eq!(err.message, "bad request");
    assert_eq!(err.note.as_deref(), Some(NOT_TRANSIENT_NOTE));
    assert_eq!(stub.call_count(), 1);
}

#[tokio::test]
async fn no_budget_means_no_retry_regime() {
    let stub = ScriptedStub::new(vec![vec![ev(CallEvent::Error(unavailable()))]]);
    // Retryable code, but neither max_retries nor total_timeout configured.
    let policy = RetryPolicy::new(vec![Code::Unavailable], fast_backoff().build().unwrap());
    let events = collect(proxy_with(&stub, Some(policy)).call(json!({}))).await;

    let err = terminal_error(&events);
    assert_eq!(err.code, Code::Unavailable);
    assert_eq!(err.note.as_deref(), Some(NOT_TRANSIENT_NOTE));
    assert_eq!(stub.call_count(), 1);
}

#[tokio::test]
async fn zero_max_retries_attaches_its_own_note() {
    let stub = ScriptedStub::new(vec![vec![ev(CallEvent::Error(unavailable()))]]);
    let policy = RetryPolicy::new(
        vec![Code::Unavailable],
        fast_backoff().max_retries(0u32).build().unwrap(),
    );
    let events = collect(proxy_with(&stub, Some(policy)).call(json!({}))).await;

    let err = terminal_error(&events);
    assert_eq!(err.code, Code::Unavailable);
    assert_eq!(err.note.as_deref(), Some(MAX_RETRIES_ZERO_NOTE));
    assert_eq!(stub.call_count(), 1);
}

#[tokio::test]
async fn cancel_mid_stream_forwards_the_cancellation_error() {
    let stub = ScriptedStub::new(vec![vec![
        ev(CallEvent::Metadata(metadata("foo"))),
        data("1"),
        data("2"),
        data("3"),
        data("4"),
        data("5"),
        ScriptStep::Hang,
    ]]);
    let policy = RetryPolicy::new(
        vec![Code::Unavailable],
        fast_backoff().max_retries(5u32).build().unwrap(),
    );
    let mut call = proxy_with(&stub, Some(policy)).call(json!({}));

    let mut seen_data = 0;
    while seen_data < 5 {
        match call.next().await.expect("stream is still live") {
            StreamEvent::Data(_) => seen_data += 1,
            StreamEvent::Error(err) => panic!("unexpected error: {err}"),
            _ => {}
        }
    }
    call.cancel();

    match call.next().await {
        Some(StreamEvent::Error(err)) => {
            assert_eq!(err.code, Code::Cancelled);
            assert!(err.note.is_none());
        }
        other => panic!("expected the cancellation error, got {other:?}"),
    }
    assert!(call.next().await.is_none());
    assert!(stub.attempt_context(0).is_cancelled());
    assert_eq!(stub.call_count(), 1);
}

#[tokio::test]
async fn progress_keeps_the_retry_budget_fresh() {
    // data, error, data, error... must run past the retry budget as long as
    // every attempt makes progress.
    let mut scripts: Vec<Vec<ScriptStep>> = (0..5)
        .map(|i| {
            vec![
                data(&format!("chunk-{i}")),
                ev(CallEvent::Error(unavailable())),
            ]
        })
        .collect();
    scripts.push(vec![
        data("final"),
        ev(CallEvent::End),
        ev(CallEvent::Status(Status::ok())),
    ]);
    let stub = ScriptedStub::new(scripts);
    let policy = RetryPolicy::new(
        vec![Code::Unavailable],
        fast_backoff().max_retries(2u32).build().unwrap(),
    );
    let events = collect(proxy_with(&stub, Some(policy)).call(json!({}))).await;

    assert_eq!(data_of(&events).len(), 6);
    assert!(matches!(events.last(), Some(StreamEvent::Status(_))));
    assert_eq!(stub.call_count(), 6);
}

#[tokio::test]
async fn rest_streaming_is_never_retried() {
    let stub = ScriptedStub::new(vec![vec![data("a"), ev(CallEvent::Error(unavailable()))]]);
    let policy = RetryPolicy::new(
        vec![Code::Unavailable],
        fast_backoff().max_retries(5u32).build().unwrap(),
    );
    let settings = CallOptions::new()
        .with_retry(policy)
        .with_rest_transport(true)
        .resolve_with(&Diagnostics::new())
        .unwrap();
    let proxy = StreamProxy::new(StreamingType::ServerStreaming, stub.clone(), settings);
    let events = collect(proxy.call(json!({}))).await;

    assert_eq!(data_of(&events), vec!["a"]);
    let err = terminal_error(&events);
    assert_eq!(err.code, Code::Unavailable);
    assert_eq!(err.message, "connection reset");
    assert!(err.note.is_none());
    assert_eq!(stub.call_count(), 1);
}

#[tokio::test]
async fn legacy_mode_retries_only_attempts_without_any_response() {
    let stub = ScriptedStub::new(vec![
        vec![ev(CallEvent::Error(unavailable()))],
        vec![
            ev(CallEvent::Metadata(metadata("foo"))),
            data("a"),
            ev(CallEvent::End),
            ev(CallEvent::Status(Status::ok())),
        ],
    ]);
    // streaming_retries stays off: the legacy wrapper with its default
    // budget of two "no response" retries.
    let settings = CallOptions::new().resolve_with(&Diagnostics::new()).unwrap();
    let proxy = StreamProxy::new(StreamingType::ServerStreaming, stub.clone(), settings);
    let events = collect(proxy.call(json!({}))).await;

    assert_eq!(data_of(&events), vec!["a"]);
    assert!(matches!(events.last(), Some(StreamEvent::Status(_))));
    assert_eq!(stub.call_count(), 2);
}

/// Echoes written messages back as data, then completes after the second
/// write.
struct EchoStub;

#[async_trait]
impl DuplexStreamingStub<Value, String, String> for EchoStub {
    async fn call(
        &self,
        _request: Value,
        _timeout: Option<Duration>,
    ) -> Result<DuplexCallStream<String, String>, CallError> {
        let (tx, rx) = mpsc::channel::<String>(8);
        let ctx: Arc<dyn CallContext> = Arc::new(Controller::new());
        let events = stream::unfold(
            (rx, 0u32, ctx.clone()),
            |(mut rx, phase, ctx)| async move {
                match phase {
                    0 | 1 => match rx.recv().await {
                        Some(message) => Some((CallEvent::Data(message), (rx, phase + 1, ctx))),
                        None => Some((CallEvent::End, (rx, 3, ctx))),
                    },
                    2 => Some((CallEvent::End, (rx, 3, ctx))),
                    3 => Some((CallEvent::Status(Status::ok()), (rx, 4, ctx))),
                    _ => None,
                }
            },
        );
        Ok(DuplexCallStream::new(
            CallStream::new(Box::pin(events), ctx.clone()),
            tx,
        ))
    }
}

#[tokio::test]
async fn bidi_streaming_passes_writes_through_and_synthesizes_the_response() {
    let settings = CallOptions::new().resolve_with(&Diagnostics::new()).unwrap();
    let mut call = duplex_call(
        StreamingType::BidiStreaming,
        Arc::new(EchoStub),
        json!({}),
        settings,
    )
    .await
    .unwrap();

    call.send("ping".to_string()).await.unwrap();
    assert!(matches!(
        call.next().await,
        Some(StreamEvent::Data(ref m)) if m == "ping"
    ));
    call.send("pong".to_string()).await.unwrap();
    assert!(matches!(
        call.next().await,
        Some(StreamEvent::Data(ref m)) if m == "pong"
    ));

    // One synthesized response before the terminal status, even without
    // upstream metadata.
    assert!(matches!(call.next().await, Some(StreamEvent::Response(_))));
    assert!(matches!(call.next().await, Some(StreamEvent::Status(_))));
    assert!(call.next().await.is_none());
}

#[tokio::test]
async fn legacy_mode_forwards_errors_after_data_was_delivered() {
    let stub = ScriptedStub::new(vec![vec![data("a"), ev(CallEvent::Error(unavailable()))]]);
    let settings = CallOptions::new().resolve_with(&Diagnostics::new()).unwrap();
    let proxy = StreamProxy::new(StreamingType::ServerStreaming, stub.clone(), settings);
    let events = collect(proxy.call(json!({}))).await;

    let err = terminal_error(&events);
    assert_eq!(err.code, Code::Unavailable);
    assert_eq!(stub.call_count(), 1);
}
