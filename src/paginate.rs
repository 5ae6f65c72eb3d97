// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Page engine: turns a page-token RPC into a restartable lazy sequence.
//!
//! A [`PageDescriptor`] names the three field paths of a page-token method:
//! where the token goes on the request, where the next token comes back on
//! the response, and where the resources live. The engine offers three
//! consumption surfaces over a [`UnaryStub`]:
//!
//! - [`list`] — eager: concatenate all pages into one vector;
//! - [`iterate`] — lazy stream of one resource per poll, with internal
//!   buffering and a bounded tolerance for empty pages;
//! - [`page_stream`] — event stream: the raw response per page, then one
//!   event per resource.
//!
//! Requests and responses are `serde_json::Value`s; the engine reads and
//! writes nested fields through dot-separated paths and never interprets
//! resource payloads.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream;
use serde_json::Value;

use crate::diagnostics::{Diagnostics, AUTOPAGINATE_TRUE_WARNING};
use crate::engine::{DataStream, UnaryStub};
use crate::error::CallError;
use crate::options::CallSettings;

/// Consecutive pages with zero resources tolerated before the engine stops
/// polling; guards against services that page forever without producing
/// anything.
const MAX_EMPTY_PAGES: u32 = 10;

/// Field paths of one page-token RPC method. Constructed once per method at
/// stub initialization and shared across calls.
#[derive(Debug, Clone)]
pub struct PageDescriptor {
    pub request_page_token_field: String,
    pub response_page_token_field: String,
    pub resource_field: String,
}

impl PageDescriptor {
    pub fn new(
        request_page_token_field: impl Into<String>,
        response_page_token_field: impl Into<String>,
        resource_field: impl Into<String>,
    ) -> Self {
        Self {
            request_page_token_field: request_page_token_field.into(),
            response_page_token_field: response_page_token_field.into(),
            resource_field: resource_field.into(),
        }
    }
}

/// One event on the [`page_stream`] surface.
#[derive(Debug, Clone)]
pub enum PageEvent {
    /// The raw response of one page.
    Response(Value),
    /// One resource.
    Data(Value),
}

/// Read a nested field through a dot-separated path.
fn get_path<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Write a nested field through a dot-separated path, creating intermediate
/// objects as needed.
fn set_path(value: &mut Value, path: &str, new: Value) {
    let mut current = value;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        let map = current.as_object_mut().expect("object was just ensured");
        if segments.peek().is_none() {
            map.insert(segment.to_string(), new);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
}

struct Page {
    resources: Vec<Value>,
    next_request: Option<Value>,
    raw: Value,
}

/// Split a response into its resources and the request for the next page.
///
/// A map-shaped resource field yields `[key, value]` pairs. An absent, null,
/// or empty next-page token ends the sequence.
fn parse_page(descriptor: &PageDescriptor, request: &Value, response: Value) -> Page {
    let resources = match get_path(&response, &descriptor.resource_field) {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(key, value)| Value::Array(vec![Value::String(key.clone()), value.clone()]))
            .collect(),
        _ => Vec::new(),
    };
    let token = get_path(&response, &descriptor.response_page_token_field)
        .and_then(Value::as_str)
        .filter(|token| !token.is_empty())
        .map(str::to_string);
    let next_request = token.map(|token| {
        let mut next = request.clone();
        set_path(
            &mut next,
            &descriptor.request_page_token_field,
            Value::String(token),
        );
        next
    });
    Page {
        resources,
        next_request,
        raw: response,
    }
}

/// Seed the first request: an explicit `page_token` in the options pins only
/// the first page; every later request carries the token returned by the
/// previous page.
fn first_request(descriptor: &PageDescriptor, mut request: Value, settings: &CallSettings<Value>) -> Value {
    if let Some(token) = &settings.page_token {
        set_path(
            &mut request,
            &descriptor.request_page_token_field,
            Value::String(token.clone()),
        );
    }
    request
}

/// Eagerly collect all pages into one flat resource list.
pub async fn list(
    stub: Arc<dyn UnaryStub>,
    descriptor: Arc<PageDescriptor>,
    request: Value,
    settings: CallSettings<Value>,
) -> Result<Vec<Value>, CallError> {
    let mut resources = Vec::new();
    let mut next = Some(first_request(&descriptor, request, &settings));
    let mut empty_pages = 0u32;
    while let Some(request) = next.take() {
        let response = stub.call(request.clone()).await?;
        let page = parse_page(&descriptor, &request, response);
        next = page.next_request;
        if page.resources.is_empty() {
            empty_pages += 1;
            if empty_pages > MAX_EMPTY_PAGES {
                tracing::warn!(empty_pages, "giving up on paging after consecutive empty pages");
                break;
            }
            continue;
        }
        empty_pages = 0;
        for resource in page.resources {
            resources.push(resource);
            if let Some(max) = settings.max_results {
                if resources.len() >= max {
                    return Ok(resources);
                }
            }
        }
    }
    Ok(resources)
}

struct IterateState {
    stub: Arc<dyn UnaryStub>,
    descriptor: Arc<PageDescriptor>,
    next_request: Option<Value>,
    cache: VecDeque<Value>,
    empty_pages: u32,
    finished: bool,
}

impl IterateState {
    async fn next_item(&mut self) -> Option<Result<Value, CallError>> {
        loop {
            if let Some(item) = self.cache.pop_front() {
                return Some(Ok(item));
            }
            if self.finished {
                return None;
            }
            let Some(request) = self.next_request.take() else {
                self.finished = true;
                return None;
            };
            match self.stub.call(request.clone()).await {
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
                Ok(response) => {
                    let page = parse_page(&self.descriptor, &request, response);
                    self.next_request = page.next_request;
                    if page.resources.is_empty() {
                        self.empty_pages += 1;
                        if self.empty_pages > MAX_EMPTY_PAGES {
                            tracing::warn!(
                                empty_pages = self.empty_pages,
                                "giving up on paging after consecutive empty pages"
                            );
                            self.finished = true;
                            return None;
                        }
                        continue;
                    }
                    self.empty_pages = 0;
                    self.cache.extend(page.resources);
                }
            }
        }
    }
}

/// Lazy asynchronous sequence: one resource per poll. The first page request
/// is issued on the first poll; when the consumer stops polling, no further
/// page is dispatched.
pub fn iterate(
    stub: Arc<dyn UnaryStub>,
    descriptor: Arc<PageDescriptor>,
    request: Value,
    settings: CallSettings<Value>,
) -> DataStream<Result<Value, CallError>> {
    iterate_with(stub, descriptor, request, settings, Diagnostics::global())
}

pub fn iterate_with(
    stub: Arc<dyn UnaryStub>,
    descriptor: Arc<PageDescriptor>,
    request: Value,
    settings: CallSettings<Value>,
    diagnostics: &Diagnostics,
) -> DataStream<Result<Value, CallError>> {
    warn_auto_paginate(&settings, diagnostics);
    let state = IterateState {
        stub,
        next_request: Some(first_request(&descriptor, request, &settings)),
        descriptor,
        cache: VecDeque::new(),
        empty_pages: 0,
        finished: false,
    };
    Box::pin(stream::unfold(state, |mut state| async move {
        state.next_item().await.map(|item| (item, state))
    }))
}

struct PageStreamState {
    stub: Arc<dyn UnaryStub>,
    descriptor: Arc<PageDescriptor>,
    next_request: Option<Value>,
    pending: VecDeque<PageEvent>,
    remaining: Option<usize>,
    finished: bool,
}

impl PageStreamState {
    async fn next_event(&mut self) -> Option<Result<PageEvent, CallError>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            if self.finished {
                return None;
            }
            let Some(request) = self.next_request.take() else {
                self.finished = true;
                return None;
            };
            match self.stub.call(request.clone()).await {
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
                Ok(response) => {
                    let page = parse_page(&self.descriptor, &request, response);
                    self.next_request = page.next_request;
                    self.pending.push_back(PageEvent::Response(page.raw));
                    for resource in page.resources {
                        if resource.is_null() {
                            continue;
                        }
                        if self.remaining == Some(0) {
                            break;
                        }
                        if let Some(remaining) = self.remaining.as_mut() {
                            *remaining -= 1;
                        }
                        self.pending.push_back(PageEvent::Data(resource));
                    }
                    if self.remaining == Some(0) {
                        self.next_request = None;
                    }
                }
            }
        }
    }
}

/// Event stream: the raw response per page, one event per non-null resource,
/// completing at `max_results` or when no next-page token is returned. The
/// first page request is issued on the first poll, and the next page is held
/// until the consumer polls again.
pub fn page_stream(
    stub: Arc<dyn UnaryStub>,
    descriptor: Arc<PageDescriptor>,
    request: Value,
    settings: CallSettings<Value>,
) -> DataStream<Result<PageEvent, CallError>> {
    page_stream_with(stub, descriptor, request, settings, Diagnostics::global())
}

pub fn page_stream_with(
    stub: Arc<dyn UnaryStub>,
    descriptor: Arc<PageDescriptor>,
    request: Value,
    settings: CallSettings<Value>,
    diagnostics: &Diagnostics,
) -> DataStream<Result<PageEvent, CallError>> {
    warn_auto_paginate(&settings, diagnostics);
    let state = PageStreamState {
        stub,
        next_request: Some(first_request(&descriptor, request, &settings)),
        descriptor,
        pending: VecDeque::new(),
        remaining: settings.max_results,
        finished: false,
    };
    Box::pin(stream::unfold(state, |mut state| async move {
        state.next_event().await.map(|event| (event, state))
    }))
}

/// The lazy surfaces manage paging themselves; an explicit `autoPaginate:
/// true` is forced off, with a once-per-process warning.
fn warn_auto_paginate(settings: &CallSettings<Value>, diagnostics: &Diagnostics) {
    if settings.auto_paginate == Some(true) {
        diagnostics.emit(
            AUTOPAGINATE_TRUE_WARNING,
            "autoPaginate is ignored by manual paging surfaces; pages are fetched on demand",
        );
    }
}
