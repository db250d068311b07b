// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Value, json};

use super::{ByteStream, EngineTransport, Headers, REQUEST_ID_HEADER, TransportError};
use crate::config::EngineEndpoint;
use crate::protocols::{DEFAULT_BLOCK_SIZE, EngineId, KvTransferParams, block_count};

/// What a recorded call was for, judged from its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Carries a handle stub with `do_remote_decode = true`.
    Prefill,
    /// Any other completion call.
    Decode,
    /// A GET.
    Stats,
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub engine_id: EngineId,
    pub path: String,
    pub kind: CallKind,
    pub request_id: Option<String>,
    pub payload: Option<Value>,
}

impl RecordedCall {
    pub fn handle(&self) -> Option<KvTransferParams> {
        self.payload
            .as_ref()
            .and_then(|p| p.get("kv_transfer_params"))
            .and_then(|h| serde_json::from_value(h.clone()).ok())
    }
}

/// One scripted reply.
pub enum MockResponse {
    Json(Value),
    Status { status: u16, body: Value },
    ConnectError,
    Stream(Vec<Bytes>),
    /// Yields `chunks`, then fails mid-stream.
    StreamError { chunks: Vec<Bytes>, message: String },
    Delayed(Duration, Box<MockResponse>),
    /// Runs `hook` once the inner reply is ready, before it is returned.
    WithHook(Box<dyn Fn() + Send + Sync>, Box<MockResponse>),
}

impl MockResponse {
    pub fn json(value: Value) -> Self {
        MockResponse::Json(value)
    }

    pub fn status(status: u16, body: Value) -> Self {
        MockResponse::Status { status, body }
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        MockResponse::Delayed(delay, Box::new(inner))
    }

    pub fn with_hook(hook: impl Fn() + Send + Sync + 'static, inner: MockResponse) -> Self {
        MockResponse::WithHook(Box::new(hook), Box::new(inner))
    }

    /// Server-sent events, one `data:` line per chunk, ending with `[DONE]`.
    pub fn sse<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut frames: Vec<Bytes> = chunks
            .into_iter()
            .map(|text| Bytes::from(format!("data: {}\n\n", completion_chunk(text.as_ref()))))
            .collect();
        frames.push(Bytes::from_static(b"data: [DONE]\n\n"));
        MockResponse::Stream(frames)
    }
}

fn completion_chunk(text: &str) -> Value {
    json!({"object": "text_completion", "choices": [{"index": 0, "text": text}]})
}

enum Resolved {
    Body(Bytes),
    Chunks(Vec<Bytes>, Option<String>),
}

#[derive(Default)]
struct MockState {
    scripted: HashMap<EngineId, VecDeque<MockResponse>>,
    calls: Vec<RecordedCall>,
}

/// In-memory [`EngineTransport`] that replays scripted responses per engine
/// and records every call.
///
/// When an engine has no scripted response left it behaves like a healthy
/// engine: prefill calls get a handle naming the engine itself, with one block
/// per `block_size` whitespace separated words of the prompt; decode calls
/// get a short completion.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    block_size: u32,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    /// Queue a response for the next call to `engine_id`.
    pub fn push(&self, engine_id: impl Into<EngineId>, response: MockResponse) {
        self.state
            .lock()
            .scripted
            .entry(engine_id.into())
            .or_default()
            .push_back(response);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().calls.clone()
    }

    pub fn calls_to(&self, engine_id: &EngineId) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| &c.engine_id == engine_id)
            .collect()
    }

    pub fn calls_for(&self, request_id: &str, kind: CallKind) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.kind == kind && c.request_id.as_deref() == Some(request_id))
            .collect()
    }

    fn record(
        &self,
        endpoint: &EngineEndpoint,
        path: &str,
        payload: Option<&Bytes>,
        headers: &Headers,
    ) -> (Option<Value>, Option<MockResponse>) {
        let payload: Option<Value> = payload.and_then(|p| serde_json::from_slice(p).ok());
        let kind = match &payload {
            None => CallKind::Stats,
            Some(p) if p.pointer("/kv_transfer_params/do_remote_decode") == Some(&Value::Bool(true)) => {
                CallKind::Prefill
            }
            Some(_) => CallKind::Decode,
        };
        let mut state = self.state.lock();
        state.calls.push(RecordedCall {
            engine_id: endpoint.id.clone(),
            path: path.to_string(),
            kind,
            request_id: headers.get(REQUEST_ID_HEADER).cloned(),
            payload: payload.clone(),
        });
        let scripted = state
            .scripted
            .get_mut(&endpoint.id)
            .and_then(VecDeque::pop_front);
        (payload, scripted)
    }

    fn default_response(&self, endpoint: &EngineEndpoint, payload: Option<&Value>) -> MockResponse {
        let Some(payload) = payload else {
            return MockResponse::json(json!({
                "engine_id": endpoint.id,
                "waiting_queue_length": 0,
                "running_queue_length": 0,
                "kv_cache_tokens_used": 0,
            }));
        };

        let prompt = payload.get("prompt").and_then(Value::as_str).unwrap_or("");
        let is_prefill =
            payload.pointer("/kv_transfer_params/do_remote_decode") == Some(&Value::Bool(true));
        if is_prefill {
            let words = prompt.split_whitespace().count();
            let blocks = block_count(words, self.block_size) as u64;
            return MockResponse::json(json!({
                "choices": [{"index": 0, "text": ""}],
                "usage": {"prompt_tokens": words, "completion_tokens": 1},
                "kv_transfer_params": {
                    "do_remote_prefill": true,
                    "do_remote_decode": false,
                    "remote_engine_id": endpoint.id,
                    "remote_block_ids": (0..blocks).collect::<Vec<_>>(),
                    "remote_host": endpoint.host,
                    "remote_port": endpoint.port,
                    "remote_tp_size": 1,
                },
            }));
        }

        if payload.get("stream").and_then(Value::as_bool) == Some(true) {
            MockResponse::sse(["Hello", ",", " world"])
        } else {
            MockResponse::json(json!({
                "object": "text_completion",
                "choices": [{"index": 0, "text": "Hello, world", "finish_reason": "length"}],
            }))
        }
    }

    async fn resolve(mut response: MockResponse) -> Result<Resolved, TransportError> {
        let mut hooks = Vec::new();
        let resolved = loop {
            response = match response {
                MockResponse::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    *inner
                }
                MockResponse::WithHook(hook, inner) => {
                    hooks.push(hook);
                    *inner
                }
                MockResponse::Json(value) => {
                    break Ok(Resolved::Body(Bytes::from(value.to_string())));
                }
                MockResponse::Status { status, body } => {
                    break Err(TransportError::Status {
                        status,
                        body: body.to_string(),
                    });
                }
                MockResponse::ConnectError => {
                    break Err(TransportError::Connect("connection refused".to_string()));
                }
                MockResponse::Stream(chunks) => break Ok(Resolved::Chunks(chunks, None)),
                MockResponse::StreamError { chunks, message } => {
                    break Ok(Resolved::Chunks(chunks, Some(message)));
                }
            };
        };
        for hook in hooks {
            hook();
        }
        resolved
    }

    async fn respond(
        &self,
        endpoint: &EngineEndpoint,
        path: &str,
        payload: Option<&Bytes>,
        headers: &Headers,
    ) -> Result<Resolved, TransportError> {
        let (payload, scripted) = self.record(endpoint, path, payload, headers);
        let response =
            scripted.unwrap_or_else(|| self.default_response(endpoint, payload.as_ref()));
        Self::resolve(response).await
    }
}

#[async_trait]
impl EngineTransport for MockTransport {
    async fn post(
        &self,
        endpoint: &EngineEndpoint,
        path: &str,
        payload: Bytes,
        headers: Headers,
    ) -> Result<Bytes, TransportError> {
        match self.respond(endpoint, path, Some(&payload), &headers).await? {
            Resolved::Body(body) => Ok(body),
            Resolved::Chunks(_, Some(message)) => Err(TransportError::Stream(message)),
            Resolved::Chunks(chunks, None) => Ok(Bytes::from(chunks.concat())),
        }
    }

    async fn post_streaming(
        &self,
        endpoint: &EngineEndpoint,
        path: &str,
        payload: Bytes,
        headers: Headers,
    ) -> Result<ByteStream, TransportError> {
        let (chunks, failure) = match self.respond(endpoint, path, Some(&payload), &headers).await? {
            Resolved::Body(body) => (vec![body], None),
            Resolved::Chunks(chunks, failure) => (chunks, failure),
        };
        let items = chunks
            .into_iter()
            .map(Ok)
            .chain(failure.map(|message| Err(TransportError::Stream(message))));
        Ok(Box::pin(futures::stream::iter(items)))
    }

    async fn get(&self, endpoint: &EngineEndpoint, path: &str) -> Result<Bytes, TransportError> {
        match self.respond(endpoint, path, None, &Headers::new()).await? {
            Resolved::Body(body) => Ok(body),
            Resolved::Chunks(chunks, _) => Ok(Bytes::from(chunks.concat())),
        }
    }
}
