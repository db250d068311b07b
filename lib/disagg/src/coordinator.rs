// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Request Coordinator
//!
//! Drives one completion request through the two-phase protocol:
//!
//! 1. pick a decode engine with the cache-aware scheduler,
//! 2. run the prefill on a prefill engine and receive the cache transfer
//!    handle (or synthesize the handle locally in `mock_pd` mode),
//! 3. send the original request plus the handle to the decode engine and
//!    relay its output.
//!
//! Decode failures are retried on other decode engines while the handle is
//! still valid. Handle mismatches and expired handles restart the request from
//! the prefill phase. Every handle that may have left an orphaned cache region
//! behind is recorded in the [`AbortLedger`] and reported to its engine on the
//! next handle sent there.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{DisaggSettings, EngineEndpoint, ProxyMode};
use crate::engine_client::{ByteStream, EngineClient, TransportError, classify};
use crate::error::{DisaggError, ErrorCode, RequestError};
use crate::logging;
use crate::metrics::{InflightGuard, Metrics, names};
use crate::protocols::{
    CompletionRequest, EngineId, HandleError, KvTransferParams, PrefillResponse, RequestPhase,
};
use crate::scheduler::{Scheduler, SelectionRequest};
use crate::stats::StatsAggregator;
use crate::tokenizers::{Tokenizer, block_aligned_prompt};

mod ledger;
mod lifecycle;

pub use ledger::{
    AbortLedger, DispatchGuard, HandleRegistry, OutstandingHandle, PendingCounter, PendingGuard,
    RequestIdGuard, RequestIds,
};
pub use lifecycle::{Request, RequestState};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// `max_tokens` sent with the prefill call.
    pub prefill_max_tokens: u32,

    /// Decode reselections allowed after the first decode attempt.
    pub max_decode_retries: u32,

    /// Prefill attempts per request, including restarts.
    pub max_prefill_attempts: u32,

    /// How long a handle may be retried on other decode engines, measured
    /// from its receipt. Past it a failed decode restarts from prefill.
    #[serde(with = "humantime_serde")]
    pub handle_validity_window: Duration,

    /// Age past which an unconsumed handle is reclaimed.
    #[serde(with = "humantime_serde")]
    pub reclaim_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub reclaim_interval: Duration,

    /// Refuse new requests while the engines together hold this many KV
    /// tokens or more. Unset means unlimited.
    pub global_kv_token_ceiling: Option<u64>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            prefill_max_tokens: 1,
            max_decode_retries: 2,
            max_prefill_attempts: 2,
            handle_validity_window: Duration::from_secs(30),
            reclaim_timeout: Duration::from_secs(60),
            reclaim_interval: Duration::from_secs(5),
            global_kv_token_ceiling: None,
        }
    }
}

pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<Bytes, RequestError>> + Send>>;

/// Decode output relayed to the caller.
pub enum CompletionResponse {
    /// Full response body of a non-streaming decode.
    Unary(Bytes),
    /// Chunks of a streaming decode. A failure after the first chunk is
    /// delivered as a final `Err` item.
    Stream(ResponseStream),
}

impl std::fmt::Debug for CompletionResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionResponse::Unary(body) => f.debug_tuple("Unary").field(body).finish(),
            CompletionResponse::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Snapshot served by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub mode: ProxyMode,
    pub pool: String,
    pub decoder_url: Option<String>,
    pub prefill_instances: usize,
    pub decode_instances: usize,
    pub known_engines: usize,
    pub total_kv_tokens: u64,
}

/// A handle ready for the decode phase.
struct Handoff {
    handle: KvTransferParams,
    remote: EngineId,
    received_at: Instant,
    payload: CompletionRequest,
}

enum PrefillStep {
    Ready(Handoff),
    Restart(DisaggError),
}

enum DecodeStep {
    Done(Outcome),
    Reselect(DisaggError),
    Restart(DisaggError),
}

enum Outcome {
    Unary(Bytes),
    Stream {
        inner: ByteStream,
        engine_id: EngineId,
        pending: PendingGuard,
        started: Instant,
    },
}

pub struct Coordinator {
    mode: ProxyMode,
    pool_name: String,
    block_size: u32,
    config: CoordinatorConfig,
    prefill_engines: HashMap<EngineId, EngineEndpoint>,
    decode_engines: HashMap<EngineId, EngineEndpoint>,
    scheduler: Scheduler,
    client: Arc<EngineClient>,
    tokenizer: Option<Arc<dyn Tokenizer>>,
    metrics: Arc<Metrics>,
    ledger: AbortLedger,
    handles: HandleRegistry,
    pending: PendingCounter,
    request_ids: RequestIds,
    // prefill engine id -> remote_engine_id it put in its last handle
    remote_ids: DashMap<EngineId, EngineId>,
    next_request_id: AtomicU64,
}

impl Coordinator {
    pub fn new(
        settings: &DisaggSettings,
        aggregator: Arc<StatsAggregator>,
        client: Arc<EngineClient>,
        tokenizer: Option<Arc<dyn Tokenizer>>,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        if settings.decode_engines.is_empty() {
            anyhow::bail!("at least one decode engine must be configured");
        }
        match settings.mode {
            ProxyMode::Disaggregated if settings.prefill_engines.is_empty() => {
                anyhow::bail!("disaggregated mode needs at least one prefill engine");
            }
            ProxyMode::MockPd if tokenizer.is_none() => {
                anyhow::bail!("mock_pd mode needs a tokenizer to build handles");
            }
            _ => {}
        }

        let prefill_engines: HashMap<EngineId, EngineEndpoint> = settings
            .prefill_engines
            .iter()
            .map(|e| (e.id.clone(), e.clone()))
            .collect();
        let decode_engines: HashMap<EngineId, EngineEndpoint> = settings
            .decode_engines
            .iter()
            .map(|e| (e.id.clone(), e.clone()))
            .collect();

        let scheduler = Scheduler::new(
            &settings.scheduler,
            settings.block_size,
            aggregator,
            settings.decode_engines.iter().map(|e| e.id.clone()).collect(),
            settings.prefill_engines.iter().map(|e| e.id.clone()).collect(),
        );

        Ok(Self {
            mode: settings.mode,
            pool_name: settings.pool_name.clone(),
            block_size: settings.block_size,
            config: settings.coordinator.clone(),
            prefill_engines,
            decode_engines,
            scheduler,
            client,
            tokenizer,
            metrics,
            ledger: AbortLedger::new(),
            handles: HandleRegistry::new(),
            pending: PendingCounter::new(),
            request_ids: RequestIds::new(),
            remote_ids: DashMap::new(),
            next_request_id: AtomicU64::new(1),
        })
    }

    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    pub fn aggregator(&self) -> &Arc<StatsAggregator> {
        self.scheduler.aggregator()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn ledger(&self) -> &AbortLedger {
        &self.ledger
    }

    pub fn handles(&self) -> &HandleRegistry {
        &self.handles
    }

    pub fn request_ids(&self) -> &RequestIds {
        &self.request_ids
    }

    /// Next generated request id, `<pool>-<n>`.
    pub fn next_request_id(&self) -> String {
        let n = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.pool_name, n)
    }

    pub fn health(&self) -> HealthReport {
        let decoder_url = self
            .scheduler
            .select_decode_engine(&SelectionRequest::new("healthcheck"))
            .ok()
            .and_then(|selection| self.decode_engines.get(&selection.engine_id))
            .map(EngineEndpoint::base_url);

        let aggregator = self.aggregator();
        HealthReport {
            status: if decoder_url.is_some() {
                "healthy"
            } else {
                "degraded"
            },
            mode: self.mode,
            pool: self.pool_name.clone(),
            decoder_url,
            prefill_instances: self.prefill_engines.len(),
            decode_instances: self.decode_engines.len(),
            known_engines: aggregator.len(),
            total_kv_tokens: aggregator.total_kv_tokens(),
        }
    }

    /// Coordinate one request from admission to its decode output.
    ///
    /// `request_id` is generated when not supplied. A caller supplied id that
    /// is already in flight is refused. Cancelling `cancel` at any
    /// point ends the request as ABORTED; a handle that was already received is
    /// then reported to its engine through the abort ledger.
    pub async fn handle_request(
        &self,
        payload: CompletionRequest,
        request_id: Option<String>,
        cancel: CancellationToken,
    ) -> Result<CompletionResponse, RequestError> {
        let request_id = request_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| self.next_request_id());
        let span = logging::request_span(&request_id);
        self.run(payload, request_id, cancel).instrument(span).await
    }

    async fn run(
        &self,
        payload: CompletionRequest,
        request_id: String,
        cancel: CancellationToken,
    ) -> Result<CompletionResponse, RequestError> {
        let mut guard = self.metrics.clone().create_inflight_guard();
        let mut request = Request::new(request_id, payload.prompt.clone(), payload.max_tokens);

        let Some(claim) = self.request_ids.claim(&request.request_id) else {
            let duplicate = DisaggError::DuplicateRequestId(request.request_id.clone());
            let err = self.terminate(
                &mut request,
                RequestPhase::Admission,
                ErrorCode::DuplicateRequestId,
                duplicate,
            );
            guard.mark_failed(err.code);
            return Err(err);
        };

        match self.coordinate(&mut request, payload, &cancel).await {
            Ok(Outcome::Unary(body)) => {
                guard.mark_ok();
                Ok(CompletionResponse::Unary(body))
            }
            Ok(Outcome::Stream {
                inner,
                engine_id,
                pending,
                started,
            }) => Ok(CompletionResponse::Stream(relay_stream(
                request,
                inner,
                engine_id,
                pending,
                claim,
                guard,
                self.metrics.clone(),
                started,
                cancel,
            ))),
            Err(err) => {
                guard.mark_failed(err.code);
                Err(err)
            }
        }
    }

    async fn coordinate(
        &self,
        request: &mut Request,
        payload: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Outcome, RequestError> {
        let prompt_tokens = self.admit(request, &payload)?;
        let request_id = request.request_id.clone();

        let mut tried: HashSet<EngineId> = HashSet::new();
        let mut decode_retries = 0;
        let mut last_failure: Option<(RequestPhase, ErrorCode, DisaggError)> = None;
        let mut last_mismatch: Option<HandleError> = None;

        'prefill: for attempt in 1..=self.config.max_prefill_attempts {
            if attempt > 1 {
                self.metrics.inc_prefill_restart();
                tracing::info!(request_id, attempt, "restarting from prefill");
            }

            let mut decode = match self.pick_decode(&request_id, &tried) {
                Ok(endpoint) => endpoint,
                Err(err) => {
                    return Err(match last_failure {
                        Some((phase, code, cause)) => {
                            self.abandon(request, phase, code, cause)
                        }
                        None => self.terminate(
                            request,
                            RequestPhase::Admission,
                            ErrorCode::NoEligibleEngine,
                            err,
                        ),
                    });
                }
            };

            let handoff = match self.mode {
                ProxyMode::MockPd => self.synthesize(request, &payload, &decode)?,
                ProxyMode::Disaggregated => {
                    match self.prefill(request, &payload, prompt_tokens, cancel).await? {
                        PrefillStep::Ready(handoff) => handoff,
                        PrefillStep::Restart(err) => {
                            if let DisaggError::HandleMismatch(mismatch) = &err {
                                // a second identical handle will not get better
                                if last_mismatch.as_ref() == Some(mismatch) {
                                    return Err(self.abandon(
                                        request,
                                        RequestPhase::Prefill,
                                        ErrorCode::PrefillFailed,
                                        err,
                                    ));
                                }
                                last_mismatch = Some(mismatch.clone());
                            }
                            last_failure =
                                Some((RequestPhase::Prefill, ErrorCode::PrefillFailed, err));
                            continue 'prefill;
                        }
                    }
                }
            };

            advance(request, RequestState::HandleReceived);
            self.handles
                .register(&request_id, handoff.remote.clone(), handoff.received_at);
            tracing::info!(
                request_id,
                remote_engine_id = %handoff.remote,
                blocks = handoff.handle.block_count(),
                "cache transfer handle received"
            );

            if cancel.is_cancelled() {
                self.handles.consume(&request_id);
                self.ledger.record(&handoff.remote, request_id.clone());
                return Err(self.terminate(
                    request,
                    RequestPhase::Decode,
                    ErrorCode::Cancelled,
                    DisaggError::Cancelled,
                ));
            }

            loop {
                let err = match self.decode(request, &handoff, &decode, cancel).await? {
                    DecodeStep::Done(outcome) => return Ok(outcome),
                    DecodeStep::Restart(err) => {
                        self.release_handle(&request_id, &handoff);
                        last_failure = Some((
                            RequestPhase::Decode,
                            ErrorCode::DecodeFailedAfterPrefill,
                            err,
                        ));
                        continue 'prefill;
                    }
                    DecodeStep::Reselect(err) => err,
                };

                tried.insert(decode.id.clone());
                if decode_retries >= self.config.max_decode_retries {
                    self.release_handle(&request_id, &handoff);
                    return Err(self.terminate(
                        request,
                        RequestPhase::Decode,
                        ErrorCode::DecodeFailedAfterPrefill,
                        err,
                    ));
                }

                if handoff.received_at.elapsed() > self.config.handle_validity_window {
                    tracing::info!(
                        request_id,
                        window_ms = self.config.handle_validity_window.as_millis() as u64,
                        "handle validity window elapsed"
                    );
                    self.release_handle(&request_id, &handoff);
                    last_failure = Some((
                        RequestPhase::Decode,
                        ErrorCode::DecodeFailedAfterPrefill,
                        err,
                    ));
                    continue 'prefill;
                }

                decode = match self.pick_decode(&request_id, &tried) {
                    Ok(endpoint) => endpoint,
                    Err(_) => {
                        self.release_handle(&request_id, &handoff);
                        return Err(self.terminate(
                            request,
                            RequestPhase::Decode,
                            ErrorCode::DecodeFailedAfterPrefill,
                            err,
                        ));
                    }
                };
                decode_retries += 1;
                self.metrics.inc_decode_reselection();
                tracing::info!(
                    request_id,
                    engine_id = %decode.id,
                    retry = decode_retries,
                    "reselected decode engine"
                );
            }
        }

        let (phase, code, cause) = last_failure.unwrap_or((
            RequestPhase::Prefill,
            ErrorCode::PrefillFailed,
            DisaggError::NoEligibleEngine,
        ));
        Err(self.abandon(request, phase, code, cause))
    }

    /// Validate the request and apply the admission ceiling. Returns the
    /// prompt token count when a tokenizer is configured.
    fn admit(
        &self,
        request: &mut Request,
        payload: &CompletionRequest,
    ) -> Result<Option<usize>, RequestError> {
        let phase = RequestPhase::Admission;
        if payload.prompt.is_empty() {
            return Err(self.terminate(
                request,
                phase,
                ErrorCode::InvalidRequest,
                DisaggError::InvalidRequest("prompt must not be empty".to_string()),
            ));
        }
        if payload.max_tokens == 0 {
            return Err(self.terminate(
                request,
                phase,
                ErrorCode::InvalidRequest,
                DisaggError::InvalidRequest("max_tokens must be at least 1".to_string()),
            ));
        }

        if let Some(ceiling) = self.config.global_kv_token_ceiling {
            let used = self.aggregator().total_kv_tokens();
            if used >= ceiling {
                return Err(self.terminate(
                    request,
                    phase,
                    ErrorCode::AdmissionRejected,
                    DisaggError::AdmissionRejected { used, ceiling },
                ));
            }
        }

        let prompt_tokens = match &self.tokenizer {
            Some(tokenizer) => match tokenizer.token_count(&payload.prompt) {
                Ok(count) => Some(count),
                Err(err) => {
                    return Err(self.terminate(request, phase, ErrorCode::TokenizerFailed, err));
                }
            },
            None => None,
        };

        tracing::info!(
            request_id = %request.request_id,
            prompt_tokens,
            max_tokens = payload.max_tokens,
            stream = payload.is_stream(),
            "request admitted"
        );
        Ok(prompt_tokens)
    }

    fn pick_decode(
        &self,
        request_id: &str,
        exclude: &HashSet<EngineId>,
    ) -> Result<EngineEndpoint, DisaggError> {
        let selection = self.scheduler.select_decode_engine(
            &SelectionRequest::new(request_id)
                .excluding(exclude.iter().cloned())
                .with_pending(self.pending.snapshot()),
        )?;
        tracing::debug!(
            request_id,
            engine_id = %selection.engine_id,
            score = selection.score,
            stale = selection.stale,
            candidates = selection.candidates,
            "selected decode engine"
        );
        self.decode_engines
            .get(&selection.engine_id)
            .cloned()
            .ok_or(DisaggError::UnknownEngine(selection.engine_id))
    }

    /// Ledger key for handles going to a prefill engine: the remote id it
    /// reported last, or its own id before it has reported one.
    fn remote_key(&self, prefill: &EngineId) -> EngineId {
        self.remote_ids
            .get(prefill)
            .map(|remote| remote.clone())
            .unwrap_or_else(|| prefill.clone())
    }

    async fn prefill(
        &self,
        request: &mut Request,
        payload: &CompletionRequest,
        prompt_tokens: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<PrefillStep, RequestError> {
        let phase = RequestPhase::Prefill;
        let request_id = request.request_id.clone();
        advance(request, RequestState::Prefilling);

        let selection = self
            .scheduler
            .select_prefill_engine(&SelectionRequest::new(&request_id))
            .map_err(|err| self.terminate(request, phase, ErrorCode::NoEligibleEngine, err))?;
        let Some(endpoint) = self.prefill_engines.get(&selection.engine_id) else {
            return Err(self.terminate(
                request,
                phase,
                ErrorCode::PrefillFailed,
                DisaggError::UnknownEngine(selection.engine_id),
            ));
        };

        let remote_key = self.remote_key(&endpoint.id);
        let aborted = self.ledger.drain(&remote_key);
        let mut stub = KvTransferParams::prefill_stub();
        stub.add_aborted(aborted.iter().cloned());
        let prefill_payload = payload.for_prefill(self.config.prefill_max_tokens, stub);

        tracing::info!(
            request_id,
            engine_id = %endpoint.id,
            aborted = aborted.len(),
            "dispatching prefill"
        );
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DisaggError::Cancelled),
            result = self.client.call(endpoint, &prefill_payload, &request_id) => result,
        };
        self.metrics.observe_phase(phase, started);
        self.record_call(phase, &result);

        let body = match result {
            Ok(body) => body,
            Err(DisaggError::Cancelled) => {
                // the engine may still write a cache region for this request
                self.ledger.restore(&remote_key, aborted);
                self.ledger.record(&remote_key, request_id);
                return Err(self.terminate(
                    request,
                    phase,
                    ErrorCode::Cancelled,
                    DisaggError::Cancelled,
                ));
            }
            Err(err) => {
                self.ledger.restore(&remote_key, aborted);
                return Err(self.terminate(request, phase, ErrorCode::PrefillFailed, err));
            }
        };

        let response: PrefillResponse = match serde_json::from_slice(&body) {
            Ok(response) => response,
            Err(err) => {
                return Err(self.terminate(
                    request,
                    phase,
                    ErrorCode::PrefillFailed,
                    DisaggError::InvalidResponse {
                        engine: endpoint.id.clone(),
                        message: err.to_string(),
                    },
                ));
            }
        };
        let Some(mut handle) = response.kv_transfer_params else {
            return Err(self.terminate(
                request,
                phase,
                ErrorCode::PrefillFailed,
                DisaggError::InvalidResponse {
                    engine: endpoint.id.clone(),
                    message: "response carries no kv_transfer_params".to_string(),
                },
            ));
        };

        let received_at = Instant::now();
        let remote = handle
            .remote_engine_id
            .clone()
            .unwrap_or_else(|| endpoint.id.clone());
        self.remote_ids.insert(endpoint.id.clone(), remote.clone());
        handle.aborted_request_ids.clear();

        // the engine count includes special tokens the local tokenizer omits
        let expected_tokens = response
            .usage
            .and_then(|usage| usage.prompt_tokens)
            .map(|n| n as usize)
            .or(prompt_tokens);
        let checked = match expected_tokens {
            Some(count) => handle.validate_for_prompt(count, self.block_size),
            None => handle.validate(),
        };
        if let Err(err) = checked {
            tracing::warn!(
                request_id,
                engine_id = %endpoint.id,
                error = %err,
                "prefill returned an unusable handle"
            );
            advance(request, RequestState::HandleReceived);
            self.ledger.record(&remote, request_id);
            return Ok(PrefillStep::Restart(err.into()));
        }

        Ok(PrefillStep::Ready(Handoff {
            handle,
            remote,
            received_at,
            payload: payload.clone(),
        }))
    }

    /// Build the handle locally, addressing the decode engine's own cache.
    fn synthesize(
        &self,
        request: &mut Request,
        payload: &CompletionRequest,
        decode: &EngineEndpoint,
    ) -> Result<Handoff, RequestError> {
        let phase = RequestPhase::Prefill;
        advance(request, RequestState::Prefilling);

        let Some(tokenizer) = &self.tokenizer else {
            return Err(self.terminate(
                request,
                phase,
                ErrorCode::TokenizerFailed,
                DisaggError::Tokenizer("no tokenizer configured".to_string()),
            ));
        };
        let (prompt, prompt_tokens) =
            match block_aligned_prompt(tokenizer.as_ref(), &payload.prompt, self.block_size) {
                Ok(aligned) => aligned,
                Err(err) => {
                    return Err(self.terminate(request, phase, ErrorCode::TokenizerFailed, err));
                }
            };

        let handle =
            KvTransferParams::synthesized(prompt_tokens, self.block_size, &decode.host, decode.port);
        let remote = handle
            .remote_engine_id
            .clone()
            .unwrap_or_else(|| decode.id.clone());
        tracing::debug!(
            request_id = %request.request_id,
            prompt_tokens,
            blocks = handle.block_count(),
            "synthesized cache transfer handle"
        );

        let mut payload = payload.clone();
        payload.prompt = prompt;
        Ok(Handoff {
            handle,
            remote,
            received_at: Instant::now(),
            payload,
        })
    }

    async fn decode(
        &self,
        request: &mut Request,
        handoff: &Handoff,
        endpoint: &EngineEndpoint,
        cancel: &CancellationToken,
    ) -> Result<DecodeStep, RequestError> {
        let phase = RequestPhase::Decode;
        let request_id = request.request_id.clone();
        advance(request, RequestState::Decoding);

        let Some(_attempt) = self.handles.dispatch(&request_id) else {
            tracing::info!(request_id, "handle reclaimed before decode");
            return Ok(DecodeStep::Restart(DisaggError::HandleExpired));
        };

        let mut handle = handoff.handle.clone();
        if self.mode == ProxyMode::MockPd {
            handle.remote_host = Some(endpoint.host.clone());
            handle.remote_port = Some(endpoint.port);
        }
        let aborted = self.ledger.drain(&handoff.remote);
        handle.add_aborted(aborted.iter().cloned());
        let decode_payload = handoff.payload.for_decode(handle);
        let stream = decode_payload.is_stream();

        let pending = self.pending.acquire(&endpoint.id);
        tracing::info!(
            request_id,
            engine_id = %endpoint.id,
            aborted = aborted.len(),
            stream,
            "dispatching decode"
        );
        let started = Instant::now();

        if stream {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(DisaggError::Cancelled),
                result = self.client.call_streaming(endpoint, &decode_payload, &request_id) => result,
            };
            self.record_call(phase, &result);
            return match result {
                Err(err) => {
                    drop(pending);
                    self.metrics.observe_phase(phase, started);
                    self.decode_failed(request, handoff, endpoint, aborted, err)
                }
                Ok(inner) => {
                    self.handles.consume(&request_id);
                    Ok(DecodeStep::Done(Outcome::Stream {
                        inner,
                        engine_id: endpoint.id.clone(),
                        pending,
                        started,
                    }))
                }
            };
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DisaggError::Cancelled),
            result = self.client.call(endpoint, &decode_payload, &request_id) => result,
        };
        drop(pending);
        self.metrics.observe_phase(phase, started);
        self.record_call(phase, &result);
        match result {
            Ok(body) => {
                self.handles.consume(&request_id);
                advance(request, RequestState::Completed);
                tracing::info!(
                    request_id,
                    engine_id = %endpoint.id,
                    bytes = body.len(),
                    elapsed_ms = request.arrival_time.elapsed().as_millis() as u64,
                    "request completed"
                );
                Ok(DecodeStep::Done(Outcome::Unary(body)))
            }
            Err(err) => self.decode_failed(request, handoff, endpoint, aborted, err),
        }
    }

    fn decode_failed(
        &self,
        request: &mut Request,
        handoff: &Handoff,
        endpoint: &EngineEndpoint,
        aborted: std::collections::BTreeSet<String>,
        err: DisaggError,
    ) -> Result<DecodeStep, RequestError> {
        self.ledger.restore(&handoff.remote, aborted);

        if matches!(err, DisaggError::Cancelled) {
            self.release_handle(&request.request_id, handoff);
            return Err(self.terminate(request, RequestPhase::Decode, ErrorCode::Cancelled, err));
        }

        tracing::warn!(
            request_id = %request.request_id,
            engine_id = %endpoint.id,
            error = %err,
            "decode attempt failed"
        );
        if err.requires_new_prefill() {
            return Ok(DecodeStep::Restart(err));
        }
        advance(request, RequestState::HandleReceived);
        Ok(DecodeStep::Reselect(err))
    }

    /// Drop a handle that will never be decoded and report its region. A
    /// handle the reclaimer already took is in the ledger.
    fn release_handle(&self, request_id: &str, handoff: &Handoff) {
        if self.handles.consume(request_id).is_some() {
            self.ledger.record(&handoff.remote, request_id);
        }
    }

    fn record_call<T>(&self, phase: RequestPhase, result: &Result<T, DisaggError>) {
        let outcome = match result {
            Ok(_) => names::outcome::OK,
            Err(DisaggError::Cancelled) => return,
            Err(err) if err.is_transient() => names::outcome::TRANSIENT,
            Err(_) => names::outcome::REJECTED,
        };
        self.metrics.inc_engine_call(phase, outcome);
    }

    /// Terminal failure after the retry budget ran out.
    fn abandon(
        &self,
        request: &mut Request,
        phase: RequestPhase,
        code: ErrorCode,
        cause: DisaggError,
    ) -> RequestError {
        tracing::warn!(
            request_id = %request.request_id,
            attempts = self.config.max_prefill_attempts,
            "giving up after prefill restarts"
        );
        self.terminate(request, phase, code, cause)
    }

    fn terminate(
        &self,
        request: &mut Request,
        phase: RequestPhase,
        code: ErrorCode,
        source: DisaggError,
    ) -> RequestError {
        let next = match code {
            ErrorCode::Cancelled => RequestState::Aborted,
            _ => RequestState::Failed,
        };
        advance(request, next);
        tracing::warn!(
            request_id = %request.request_id,
            %phase,
            %code,
            error = %source,
            "request failed"
        );
        RequestError::new(request.request_id.clone(), phase, code, source)
    }

    /// Move handles nobody consumed within `reclaim_timeout` into the ledger.
    pub fn reclaim_expired(&self, now: Instant) -> usize {
        let expired = self.handles.take_expired(now, self.config.reclaim_timeout);
        for (request_id, handle) in &expired {
            tracing::warn!(
                request_id,
                remote_engine_id = %handle.remote,
                age_ms = now.saturating_duration_since(handle.received_at).as_millis() as u64,
                "reclaiming unconsumed cache transfer handle"
            );
            self.ledger.record(&handle.remote, request_id.clone());
        }
        if !expired.is_empty() {
            self.metrics.inc_reclaimed_handles(expired.len() as u64);
        }
        expired.len()
    }

    pub fn start_reclaimer(self: Arc<Self>, cancel_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.reclaim_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        tracing::debug!("Handle reclaimer cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        self.reclaim_expired(Instant::now());
                    }
                }
            }
        })
    }
}

fn advance(request: &mut Request, next: RequestState) {
    if let Err(err) = request.transition(next) {
        tracing::error!(request_id = %request.request_id, error = %err, "lifecycle violation");
    }
}

enum StreamEvent {
    Chunk(Bytes),
    Broken(TransportError),
    End,
    Cancelled,
}

/// Relay decode chunks to the caller and settle the request when the stream
/// ends. Dropping the returned stream early counts the request as aborted.
#[allow(clippy::too_many_arguments)]
fn relay_stream(
    mut request: Request,
    mut inner: ByteStream,
    engine_id: EngineId,
    pending: PendingGuard,
    claim: RequestIdGuard,
    mut guard: InflightGuard,
    metrics: Arc<Metrics>,
    started: Instant,
    cancel: CancellationToken,
) -> ResponseStream {
    Box::pin(async_stream::stream! {
        let _pending = pending;
        let _claim = claim;
        let mut chunks: usize = 0;
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => StreamEvent::Cancelled,
                item = inner.next() => match item {
                    Some(Ok(bytes)) => StreamEvent::Chunk(bytes),
                    Some(Err(err)) => StreamEvent::Broken(err),
                    None => StreamEvent::End,
                },
            };

            match event {
                StreamEvent::Chunk(bytes) => {
                    chunks += 1;
                    if chunks == 1 {
                        tracing::info!(
                            request_id = %request.request_id,
                            engine_id = %engine_id,
                            ttft_ms = request.arrival_time.elapsed().as_millis() as u64,
                            "first decode chunk"
                        );
                    }
                    yield Ok(bytes);
                }
                StreamEvent::End => {
                    metrics.observe_phase(RequestPhase::Decode, started);
                    advance(&mut request, RequestState::Completed);
                    guard.mark_ok();
                    tracing::info!(
                        request_id = %request.request_id,
                        engine_id = %engine_id,
                        chunks,
                        elapsed_ms = request.arrival_time.elapsed().as_millis() as u64,
                        "request completed"
                    );
                    break;
                }
                StreamEvent::Broken(err) => {
                    let source = classify(err, &engine_id);
                    advance(&mut request, RequestState::Failed);
                    guard.mark_failed(ErrorCode::DecodeFailedAfterPrefill);
                    tracing::warn!(
                        request_id = %request.request_id,
                        engine_id = %engine_id,
                        chunks,
                        error = %source,
                        "decode stream broke"
                    );
                    yield Err(RequestError::new(
                        request.request_id.clone(),
                        RequestPhase::Decode,
                        ErrorCode::DecodeFailedAfterPrefill,
                        source,
                    ));
                    break;
                }
                StreamEvent::Cancelled => {
                    advance(&mut request, RequestState::Aborted);
                    guard.mark_failed(ErrorCode::Cancelled);
                    tracing::info!(
                        request_id = %request.request_id,
                        chunks,
                        "request cancelled mid-stream"
                    );
                    yield Err(RequestError::new(
                        request.request_id.clone(),
                        RequestPhase::Decode,
                        ErrorCode::Cancelled,
                        DisaggError::Cancelled,
                    ));
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineEndpoint;
    use crate::engine_client::{CallKind, MockResponse, MockTransport, RetryPolicy};
    use crate::protocols::EngineStats;
    use serde_json::json;

    fn settings() -> DisaggSettings {
        let mut settings = DisaggSettings::default();
        settings.pool_name = "test".to_string();
        settings.block_size = 4;
        settings.prefill_engines = vec![EngineEndpoint::new("p0", "10.0.0.1", 8100)];
        settings.decode_engines = vec![
            EngineEndpoint::new("d0", "10.0.0.2", 8200),
            EngineEndpoint::new("d1", "10.0.0.3", 8200),
        ];
        settings
    }

    fn coordinator(settings: &DisaggSettings, transport: &MockTransport) -> Coordinator {
        let metrics = Arc::new(Metrics::new().unwrap());
        let aggregator = Arc::new(StatsAggregator::with_metrics(metrics.clone()));
        aggregator
            .ingest(EngineStats::new("d0", 0, 0, 0, 1))
            .unwrap();
        aggregator
            .ingest(EngineStats::new("d1", 0, 0, 100, 1))
            .unwrap();
        let policy = RetryPolicy::builder().max_retries(0u32).build().unwrap();
        let client = Arc::new(EngineClient::new(Arc::new(transport.clone()), policy));
        Coordinator::new(settings, aggregator, client, None, metrics).unwrap()
    }

    #[test]
    fn test_request_ids_use_pool_prefix() {
        let transport = MockTransport::new().with_block_size(4);
        let coordinator = coordinator(&settings(), &transport);
        assert_eq!(coordinator.next_request_id(), "test-1");
        assert_eq!(coordinator.next_request_id(), "test-2");
    }

    #[test]
    fn test_new_requires_prefill_engines() {
        let mut settings = settings();
        settings.prefill_engines.clear();
        let metrics = Arc::new(Metrics::new().unwrap());
        let client = Arc::new(EngineClient::new(
            Arc::new(MockTransport::new()),
            RetryPolicy::default(),
        ));
        let result = Coordinator::new(
            &settings,
            Arc::new(StatsAggregator::new()),
            client,
            None,
            metrics,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unary_request_completes() {
        let transport = MockTransport::new().with_block_size(4);
        let coordinator = coordinator(&settings(), &transport);

        let response = coordinator
            .handle_request(
                CompletionRequest::new("a b c d e f g h i", 8),
                Some("r1".to_string()),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(matches!(response, CompletionResponse::Unary(_)));

        let decode = transport.calls_for("r1", CallKind::Decode);
        assert_eq!(decode.len(), 1);
        assert_eq!(decode[0].engine_id.as_str(), "d0");
        let handle = decode[0].handle().unwrap();
        assert_eq!(handle.block_count(), 2);
        assert_eq!(handle.remote_engine_id.unwrap().as_str(), "p0");
        assert!(coordinator.handles().is_empty());
    }

    #[tokio::test]
    async fn test_empty_prompt_is_invalid() {
        let transport = MockTransport::new();
        let coordinator = coordinator(&settings(), &transport);
        let err = coordinator
            .handle_request(CompletionRequest::new("", 8), None, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
        assert_eq!(err.phase, RequestPhase::Admission);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_admission_ceiling() {
        let mut settings = settings();
        settings.coordinator.global_kv_token_ceiling = Some(100);
        let transport = MockTransport::new();
        let coordinator = coordinator(&settings, &transport);
        let err = coordinator
            .handle_request(CompletionRequest::new("a b", 8), None, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::AdmissionRejected);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_handle_mismatch_restarts_prefill() {
        let transport = MockTransport::new().with_block_size(4);
        let mismatched = json!({
            "usage": {"prompt_tokens": 8},
            "kv_transfer_params": {
                "do_remote_prefill": true,
                "do_remote_decode": false,
                "remote_engine_id": "p0",
                "remote_block_ids": [0, 1, 2, 3, 4],
                "remote_host": "10.0.0.1",
                "remote_port": 8100,
            },
        });
        transport.push("p0", MockResponse::json(mismatched));
        let coordinator = coordinator(&settings(), &transport);

        coordinator
            .handle_request(
                CompletionRequest::new("a b c d e f g h", 8),
                Some("r1".to_string()),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let prefills = transport.calls_for("r1", CallKind::Prefill);
        assert_eq!(prefills.len(), 2);
        // the second prefill reports the region of the first one
        let stub = prefills[1].handle().unwrap();
        assert!(stub.aborted_request_ids.contains("r1"));
        assert_eq!(transport.calls_for("r1", CallKind::Decode).len(), 1);
    }

    #[tokio::test]
    async fn test_reclaimer_moves_stale_handles() {
        let transport = MockTransport::new();
        let coordinator = coordinator(&settings(), &transport);
        let start = Instant::now();
        coordinator
            .handles()
            .register("r9", EngineId::from("p0"), start);

        assert_eq!(coordinator.reclaim_expired(start + Duration::from_secs(1)), 0);
        assert_eq!(coordinator.reclaim_expired(start + Duration::from_secs(61)), 1);
        assert_eq!(coordinator.ledger().pending(&EngineId::from("p0")), 1);
    }

    #[test]
    fn test_health_report() {
        let transport = MockTransport::new();
        let coordinator = coordinator(&settings(), &transport);
        let report = coordinator.health();
        assert_eq!(report.status, "healthy");
        assert_eq!(report.decoder_url.as_deref(), Some("http://10.0.0.2:8200"));
        assert_eq!(report.known_engines, 2);
        assert_eq!(report.total_kv_tokens, 100);
        assert_eq!(report.prefill_instances, 1);
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["mode"], "disaggregated");
        assert_eq!(value["pool"], "test");
    }
}
