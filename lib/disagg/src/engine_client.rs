// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Engine Client
//!
//! [`EngineClient`] issues prefill and decode calls to one engine through an
//! [`EngineTransport`]. Transient transport failures are retried in place with
//! bounded exponential backoff; application level refusals are classified and
//! returned immediately so the coordinator can pick another engine.
//!
//! Every call carries the request id in the `X-Request-Id` header.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use derive_builder::Builder;
use futures::Stream;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::EngineEndpoint;
use crate::error::{DisaggError, RejectionKind};
use crate::protocols::{CompletionRequest, EngineId};

mod http;
mod mock;

pub use http::{HttpTransport, HttpTransportConfig};
pub use mock::{CallKind, MockResponse, MockTransport, RecordedCall};

/// Type alias for request headers
pub type Headers = HashMap<String, String>;

/// Header correlating every engine call with the coordinated request.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// OpenAI compatible completions route served by the engines.
pub const COMPLETIONS_PATH: &str = "/v1/completions";

/// Longest slice of an error body kept in error messages.
const MAX_ERROR_BODY: usize = 512;

/// Failure below the application protocol, as reported by a transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out")]
    Timeout,

    #[error("engine returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("response stream broke: {0}")]
    Stream(String),

    #[error("unreadable response body: {0}")]
    Body(String),
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// Transport used to reach engines.
///
/// Implementations only move bytes; classification and retries live in
/// [`EngineClient`].
#[async_trait]
pub trait EngineTransport: Send + Sync {
    /// POST `payload` and wait for the whole response body.
    async fn post(
        &self,
        endpoint: &EngineEndpoint,
        path: &str,
        payload: Bytes,
        headers: Headers,
    ) -> Result<Bytes, TransportError>;

    /// POST `payload` and return the response body as it arrives.
    async fn post_streaming(
        &self,
        endpoint: &EngineEndpoint,
        path: &str,
        payload: Bytes,
        headers: Headers,
    ) -> Result<ByteStream, TransportError>;

    /// GET a JSON document, used for stats polling.
    async fn get(&self, endpoint: &EngineEndpoint, path: &str) -> Result<Bytes, TransportError>;
}

/// Retry policy for transient transport errors.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(default)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,

    /// Delay before the first retry; doubles on every further retry.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Per-attempt deadline. Unset leaves it to the transport.
    #[serde(with = "humantime_serde")]
    #[builder(setter(strip_option))]
    pub request_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_secs(1),
            request_timeout: None,
        }
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }
}

/// Exponential backoff with jitter, capped at the policy maximum.
#[derive(Debug)]
struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    fn new(policy: &RetryPolicy) -> Self {
        Self {
            current: policy.base_delay.min(policy.max_delay),
            max: policy.max_delay,
        }
    }

    /// A delay in `[d/2, d]`, then doubles `d`.
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        let nanos = delay.as_nanos().min(u64::MAX as u128) as u64;
        if nanos < 2 {
            return delay;
        }
        Duration::from_nanos(rand::rng().random_range(nanos / 2..=nanos))
    }
}

pub struct EngineClient {
    transport: Arc<dyn EngineTransport>,
    policy: RetryPolicy,
}

impl EngineClient {
    pub fn new(transport: Arc<dyn EngineTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    /// Unary completion call. Returns the raw response body.
    pub async fn call(
        &self,
        endpoint: &EngineEndpoint,
        payload: &CompletionRequest,
        request_id: &str,
    ) -> Result<Bytes, DisaggError> {
        let body = encode_payload(endpoint, payload)?;
        let headers = request_headers(request_id);
        self.with_retry(endpoint, request_id, || {
            self.transport
                .post(endpoint, COMPLETIONS_PATH, body.clone(), headers.clone())
        })
        .await
    }

    /// Streaming completion call. Only establishing the stream is retried;
    /// once bytes flow, failures surface as stream items.
    pub async fn call_streaming(
        &self,
        endpoint: &EngineEndpoint,
        payload: &CompletionRequest,
        request_id: &str,
    ) -> Result<ByteStream, DisaggError> {
        let body = encode_payload(endpoint, payload)?;
        let headers = request_headers(request_id);
        self.with_retry(endpoint, request_id, || {
            self.transport
                .post_streaming(endpoint, COMPLETIONS_PATH, body.clone(), headers.clone())
        })
        .await
    }

    /// Single GET without retries.
    pub async fn fetch(&self, endpoint: &EngineEndpoint, path: &str) -> Result<Value, DisaggError> {
        let body = self
            .transport
            .get(endpoint, path)
            .await
            .map_err(|err| classify(err, &endpoint.id))?;
        serde_json::from_slice(&body).map_err(|err| DisaggError::InvalidResponse {
            engine: endpoint.id.clone(),
            message: err.to_string(),
        })
    }

    async fn with_retry<T, F, Fut>(
        &self,
        endpoint: &EngineEndpoint,
        request_id: &str,
        mut op: F,
    ) -> Result<T, DisaggError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut backoff = Backoff::new(&self.policy);
        let mut attempt = 0;
        loop {
            let result = match self.policy.request_timeout {
                Some(timeout) => tokio::time::timeout(timeout, op())
                    .await
                    .unwrap_or(Err(TransportError::Timeout)),
                None => op().await,
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => classify(err, &endpoint.id),
            };

            if !err.is_transient() || attempt >= self.policy.max_retries {
                tracing::debug!(
                    request_id,
                    engine_id = %endpoint.id,
                    attempts = attempt + 1,
                    error = %err,
                    "engine call failed"
                );
                return Err(err);
            }

            attempt += 1;
            let delay = backoff.next_delay();
            tracing::warn!(
                request_id,
                engine_id = %endpoint.id,
                attempt,
                max_retries = self.policy.max_retries,
                delay_us = delay.as_micros() as u64,
                error = %err,
                "transient engine error, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn request_headers(request_id: &str) -> Headers {
    HashMap::from([(REQUEST_ID_HEADER.to_string(), request_id.to_string())])
}

fn encode_payload(
    endpoint: &EngineEndpoint,
    payload: &CompletionRequest,
) -> Result<Bytes, DisaggError> {
    serde_json::to_vec(payload)
        .map(Bytes::from)
        .map_err(|err| DisaggError::InvalidResponse {
            engine: endpoint.id.clone(),
            message: format!("failed to encode request: {err}"),
        })
}

/// Map a transport failure onto the error taxonomy.
///
/// Connection failures, timeouts, 502 and 504 are transient. Any other
/// non-success status is an application level rejection.
pub fn classify(err: TransportError, engine: &EngineId) -> DisaggError {
    match err {
        TransportError::Connect(message) | TransportError::Stream(message) => {
            DisaggError::TransientTransport {
                engine: engine.clone(),
                message,
            }
        }
        TransportError::Timeout => DisaggError::TransientTransport {
            engine: engine.clone(),
            message: "request timed out".to_string(),
        },
        TransportError::Status { status, body } if status == 502 || status == 504 => {
            DisaggError::TransientTransport {
                engine: engine.clone(),
                message: format!("status {status}: {}", truncate(&body)),
            }
        }
        TransportError::Status { status, body } => DisaggError::EngineRejection {
            engine: engine.clone(),
            kind: rejection_kind(status, &body),
            status,
            message: truncate(&body).to_string(),
        },
        TransportError::Body(message) => DisaggError::InvalidResponse {
            engine: engine.clone(),
            message,
        },
    }
}

/// The body's error type wins over the status code.
fn rejection_kind(status: u16, body: &str) -> RejectionKind {
    let declared = serde_json::from_str::<Value>(body).ok().and_then(|value| {
        [
            value.pointer("/error/type"),
            value.pointer("/error/code"),
            value.get("type"),
            value.get("code"),
        ]
        .into_iter()
        .flatten()
        .find_map(|v| v.as_str().map(str::to_ascii_lowercase))
    });

    match declared.as_deref() {
        Some("cache_exhausted" | "kv_cache_exhausted" | "out_of_kv_cache") => {
            return RejectionKind::CacheExhausted;
        }
        Some("handle_mismatch" | "block_count_mismatch") => return RejectionKind::HandleMismatch,
        _ => {}
    }

    match status {
        429 | 503 | 507 => RejectionKind::CacheExhausted,
        400..=499 => RejectionKind::BadRequest,
        _ => RejectionKind::Other,
    }
}

fn truncate(body: &str) -> &str {
    if body.len() <= MAX_ERROR_BODY {
        return body;
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
