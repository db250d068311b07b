// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Prometheus metrics for the coordination layer.
//!
//! All metrics are owned by a [`Metrics`] instance and registered into a
//! caller-supplied [`Registry`]; nothing is registered globally, so several
//! coordinators can live in one process (tests do this).

use std::sync::Arc;
use std::time::Instant;

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
};

pub use prometheus::Registry;

use crate::error::ErrorCode;
use crate::protocols::{EngineId, RequestPhase};
use crate::stats::IngestOutcome;

pub mod names {
    pub const REQUESTS_TOTAL: &str = "disagg_requests_total";
    pub const INFLIGHT_REQUESTS: &str = "disagg_inflight_requests";
    pub const PHASE_DURATION_SECONDS: &str = "disagg_phase_duration_seconds";
    pub const ENGINE_CALLS_TOTAL: &str = "disagg_engine_calls_total";
    pub const DECODE_RESELECTIONS_TOTAL: &str = "disagg_decode_reselections_total";
    pub const PREFILL_RESTARTS_TOTAL: &str = "disagg_prefill_restarts_total";
    pub const RECLAIMED_HANDLES_TOTAL: &str = "disagg_reclaimed_handles_total";
    pub const STATS_INGESTED_TOTAL: &str = "disagg_stats_ingested_total";
    pub const ENGINE_KV_TOKENS: &str = "disagg_engine_kv_tokens";
    pub const TOTAL_KV_TOKENS: &str = "disagg_total_kv_tokens";

    pub mod status {
        pub const SUCCESS: &str = "success";
        pub const ERROR: &str = "error";
        pub const ABORTED: &str = "aborted";
    }

    pub mod outcome {
        pub const OK: &str = "ok";
        pub const TRANSIENT: &str = "transient";
        pub const REJECTED: &str = "rejected";
    }
}

pub struct Metrics {
    request_counter: IntCounterVec,
    inflight_gauge: IntGauge,
    phase_duration: HistogramVec,
    engine_calls: IntCounterVec,
    decode_reselections: IntCounter,
    prefill_restarts: IntCounter,
    reclaimed_handles: IntCounter,
    stats_ingested: IntCounterVec,
    engine_kv_tokens: IntGaugeVec,
    total_kv_tokens: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let request_counter = IntCounterVec::new(
            Opts::new(
                names::REQUESTS_TOTAL,
                "Coordinated requests by terminal status and error code",
            ),
            &["status", "code"],
        )?;

        let inflight_gauge = IntGauge::new(
            names::INFLIGHT_REQUESTS,
            "Requests between admission and a terminal state",
        )?;

        let phase_duration = HistogramVec::new(
            HistogramOpts::new(
                names::PHASE_DURATION_SECONDS,
                "Wall time spent in each request phase",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
            ]),
            &["phase"],
        )?;

        let engine_calls = IntCounterVec::new(
            Opts::new(
                names::ENGINE_CALLS_TOTAL,
                "Individual engine calls by phase and outcome",
            ),
            &["phase", "outcome"],
        )?;

        let decode_reselections = IntCounter::new(
            names::DECODE_RESELECTIONS_TOTAL,
            "Decode retries routed to a different engine",
        )?;

        let prefill_restarts = IntCounter::new(
            names::PREFILL_RESTARTS_TOTAL,
            "Requests that restarted from the prefill phase",
        )?;

        let reclaimed_handles = IntCounter::new(
            names::RECLAIMED_HANDLES_TOTAL,
            "Unconsumed cache transfer handles moved to the abort ledger",
        )?;

        let stats_ingested = IntCounterVec::new(
            Opts::new(
                names::STATS_INGESTED_TOTAL,
                "Engine stats records by ingestion outcome",
            ),
            &["outcome"],
        )?;

        let engine_kv_tokens = IntGaugeVec::new(
            Opts::new(
                names::ENGINE_KV_TOKENS,
                "KV cache tokens in use as last reported by each engine",
            ),
            &["engine_id"],
        )?;

        let total_kv_tokens = IntGauge::new(
            names::TOTAL_KV_TOKENS,
            "Sum of KV cache tokens in use across the pool",
        )?;

        Ok(Metrics {
            request_counter,
            inflight_gauge,
            phase_duration,
            engine_calls,
            decode_reselections,
            prefill_restarts,
            reclaimed_handles,
            stats_ingested,
            engine_kv_tokens,
            total_kv_tokens,
        })
    }

    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.request_counter.clone()))?;
        registry.register(Box::new(self.inflight_gauge.clone()))?;
        registry.register(Box::new(self.phase_duration.clone()))?;
        registry.register(Box::new(self.engine_calls.clone()))?;
        registry.register(Box::new(self.decode_reselections.clone()))?;
        registry.register(Box::new(self.prefill_restarts.clone()))?;
        registry.register(Box::new(self.reclaimed_handles.clone()))?;
        registry.register(Box::new(self.stats_ingested.clone()))?;
        registry.register(Box::new(self.engine_kv_tokens.clone()))?;
        registry.register(Box::new(self.total_kv_tokens.clone()))?;
        Ok(())
    }

    pub fn observe_phase(&self, phase: RequestPhase, started: Instant) {
        self.phase_duration
            .with_label_values(&[phase.as_ref()])
            .observe(started.elapsed().as_secs_f64());
    }

    pub fn inc_engine_call(&self, phase: RequestPhase, outcome: &str) {
        self.engine_calls
            .with_label_values(&[phase.as_ref(), outcome])
            .inc();
    }

    pub fn inc_decode_reselection(&self) {
        self.decode_reselections.inc();
    }

    pub fn inc_prefill_restart(&self) {
        self.prefill_restarts.inc();
    }

    pub fn inc_reclaimed_handles(&self, count: u64) {
        self.reclaimed_handles.inc_by(count);
    }

    pub fn inc_stats_ingested(&self, outcome: IngestOutcome) {
        self.stats_ingested
            .with_label_values(&[outcome.as_ref()])
            .inc();
    }

    pub fn set_engine_kv_tokens(&self, engine_id: &EngineId, tokens: u64) {
        self.engine_kv_tokens
            .with_label_values(&[engine_id.as_str()])
            .set(clamp_u64_to_i64(tokens));
    }

    pub fn set_total_kv_tokens(&self, tokens: u64) {
        self.total_kv_tokens.set(clamp_u64_to_i64(tokens));
    }

    /// Create a new [`InflightGuard`] for one coordinated request.
    ///
    /// A guard dropped without `mark_ok` or `mark_failed` counts the request
    /// as aborted, which is what happens when the caller goes away mid-flight.
    pub fn create_inflight_guard(self: Arc<Self>) -> InflightGuard {
        InflightGuard::new(self)
    }
}

fn clamp_u64_to_i64(value: u64) -> i64 {
    value.min(i64::MAX as u64) as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Success,
    Error(ErrorCode),
    Aborted,
}

/// RAII object for the inflight gauge and the request counter.
pub struct InflightGuard {
    metrics: Arc<Metrics>,
    status: Status,
    timer: Instant,
}

impl InflightGuard {
    fn new(metrics: Arc<Metrics>) -> Self {
        metrics.inflight_gauge.inc();
        InflightGuard {
            metrics,
            status: Status::Aborted,
            timer: Instant::now(),
        }
    }

    pub fn mark_ok(&mut self) {
        self.status = Status::Success;
    }

    pub fn mark_failed(&mut self, code: ErrorCode) {
        self.status = match code {
            ErrorCode::Cancelled => Status::Aborted,
            code => Status::Error(code),
        };
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.timer.elapsed().as_secs_f64()
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.metrics.inflight_gauge.dec();
        let (status, code): (&str, &str) = match &self.status {
            Status::Success => (names::status::SUCCESS, ""),
            Status::Error(code) => (names::status::ERROR, code.as_ref()),
            Status::Aborted => (names::status::ABORTED, "cancelled"),
        };
        self.metrics
            .request_counter
            .with_label_values(&[status, code])
            .inc();
    }
}
