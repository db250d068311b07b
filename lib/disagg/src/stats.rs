// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Stats Aggregator
//!
//! Keeps the Engine Table: the latest [`EngineStats`] per engine, newest
//! `observed_at` wins. Entries live in a [`DashMap`] so an update only locks
//! the shard holding that engine; unrelated engines are never serialized and
//! readers always see a whole record.
//!
//! Entries are never removed. Freshness is judged by the local receive time,
//! since `observed_at` is the engine's own clock and is not comparable across
//! engines.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineEndpoint;
use crate::engine_client::EngineClient;
use crate::error::IngestError;
use crate::metrics::Metrics;
use crate::protocols::{EngineId, EngineStats};

/// Path polled on engines that cannot push their stats.
pub const LOAD_METRICS_PATH: &str = "/load_metrics";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Poll every configured engine at this interval. Unset means push only.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Option<Duration>,

    /// Log the engine table at this interval. Unset disables the report.
    #[serde(with = "humantime_serde")]
    pub report_interval: Option<Duration>,
}

/// What a single ingestion did to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum IngestOutcome {
    /// First record seen for this engine.
    Inserted,
    /// Replaced an older record.
    Updated,
    /// Not newer than the current entry; the table is unchanged.
    Outdated,
    /// Dropped before reaching the table.
    Rejected,
}

/// One row of the Engine Table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEntry {
    pub stats: EngineStats,
    pub received_at: Instant,
}

impl EngineEntry {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.received_at)
    }
}

/// Read-only copy of the Engine Table.
pub type EngineTable = HashMap<EngineId, EngineEntry>;

/// Counts of one batch ingestion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub accepted: usize,
    pub outdated: usize,
    pub rejected: usize,
}

impl IngestSummary {
    fn record(&mut self, outcome: IngestOutcome) {
        match outcome {
            IngestOutcome::Inserted | IngestOutcome::Updated => self.accepted += 1,
            IngestOutcome::Outdated => self.outdated += 1,
            IngestOutcome::Rejected => self.rejected += 1,
        }
    }
}

#[derive(Default)]
pub struct StatsAggregator {
    table: DashMap<EngineId, EngineEntry>,
    metrics: Option<Arc<Metrics>>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(metrics: Arc<Metrics>) -> Self {
        Self {
            table: DashMap::new(),
            metrics: Some(metrics),
        }
    }

    /// Newest-timestamp-wins upsert. Re-ingesting a record already in the
    /// table is a no-op.
    pub fn ingest(&self, record: EngineStats) -> Result<IngestOutcome, IngestError> {
        self.ingest_at(record, Instant::now())
    }

    pub fn ingest_at(
        &self,
        record: EngineStats,
        now: Instant,
    ) -> Result<IngestOutcome, IngestError> {
        if record.engine_id.as_str().is_empty() {
            self.count(IngestOutcome::Rejected);
            return Err(IngestError::MissingEngineId);
        }

        let engine_id = record.engine_id.clone();
        let kv_tokens = record.kv_cache_tokens_used;
        let entry = EngineEntry {
            stats: record,
            received_at: now,
        };

        // the shard lock is held only inside this match
        let outcome = match self.table.entry(engine_id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(entry);
                IngestOutcome::Inserted
            }
            Entry::Occupied(mut slot) => {
                if entry.stats.observed_at > slot.get().stats.observed_at {
                    slot.insert(entry);
                    IngestOutcome::Updated
                } else {
                    IngestOutcome::Outdated
                }
            }
        };

        match outcome {
            IngestOutcome::Inserted | IngestOutcome::Updated => {
                tracing::trace!(engine_id = %engine_id, kv_tokens, "engine stats updated");
                if let Some(metrics) = &self.metrics {
                    metrics.set_engine_kv_tokens(&engine_id, kv_tokens);
                    metrics.set_total_kv_tokens(self.total_kv_tokens());
                }
            }
            _ => {
                tracing::trace!(engine_id = %engine_id, "ignoring outdated engine stats");
            }
        }
        self.count(outcome);
        Ok(outcome)
    }

    /// Ingest one record or an array of records from JSON. Malformed entries
    /// are dropped and logged without affecting the others.
    pub fn ingest_json(&self, value: Value) -> IngestSummary {
        let records = match value {
            Value::Array(records) => records,
            other => vec![other],
        };

        let mut summary = IngestSummary::default();
        for raw in records {
            let outcome = serde_json::from_value::<EngineStats>(raw)
                .map_err(IngestError::from)
                .and_then(|record| self.ingest(record));
            match outcome {
                Ok(outcome) => summary.record(outcome),
                Err(err) => {
                    if matches!(err, IngestError::Malformed(_)) {
                        self.count(IngestOutcome::Rejected);
                    }
                    tracing::warn!(error = %err, "dropping engine stats record");
                    summary.record(IngestOutcome::Rejected);
                }
            }
        }
        summary
    }

    pub fn snapshot(&self) -> EngineTable {
        self.table
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn get(&self, engine_id: &EngineId) -> Option<EngineEntry> {
        self.table.get(engine_id).map(|entry| entry.value().clone())
    }

    /// Sum of `kv_cache_tokens_used` over every entry, stale or not: an engine
    /// that stopped reporting may still hold its cache.
    pub fn total_kv_tokens(&self) -> u64 {
        self.table
            .iter()
            .map(|entry| entry.value().stats.kv_cache_tokens_used)
            .fold(0u64, u64::saturating_add)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    fn count(&self, outcome: IngestOutcome) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_stats_ingested(outcome);
        }
    }

    /// Poll `LOAD_METRICS_PATH` on every engine at `interval`.
    ///
    /// Records missing `engine_id` are attributed to the polled engine. Records
    /// missing `observed_at` are stamped with the poller's own monotonic clock
    /// in milliseconds.
    pub fn start_polling(
        self: Arc<Self>,
        client: Arc<EngineClient>,
        engines: Vec<EngineEndpoint>,
        interval: Duration,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let started = Instant::now();
            let mut interval = tokio::time::interval(interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(engines = engines.len(), "Started engine stats polling");

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        tracing::debug!("Engine stats polling task cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        let stamp = started.elapsed().as_millis() as u64;
                        let polls = engines.iter().map(|engine| {
                            let client = client.clone();
                            async move {
                                (engine, client.fetch(engine, LOAD_METRICS_PATH).await)
                            }
                        });
                        for (engine, result) in futures::future::join_all(polls).await {
                            match result {
                                Ok(value) => {
                                    let value = fill_poll_defaults(value, &engine.id, stamp);
                                    self.ingest_json(value);
                                }
                                Err(err) => {
                                    tracing::debug!(engine_id = %engine.id, error = %err, "stats poll failed");
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    /// Log the engine table at `interval`, heaviest KV user first.
    pub fn start_reporting(
        self: Arc<Self>,
        interval: Duration,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        tracing::debug!("Engine table reporter cancelled");
                        break;
                    }
                    _ = interval.tick() => self.report(Instant::now()),
                }
            }
        })
    }

    fn report(&self, now: Instant) {
        let rows = sorted_by_kv(self.snapshot());
        if rows.is_empty() {
            return;
        }
        tracing::info!(
            engines = rows.len(),
            total_kv_tokens = self.total_kv_tokens(),
            "engine table"
        );
        for entry in rows {
            tracing::info!(
                engine_id = %entry.stats.engine_id,
                kv_cache_tokens_used = entry.stats.kv_cache_tokens_used,
                waiting = entry.stats.waiting_queue_length,
                running = entry.stats.running_queue_length,
                age_ms = entry.age(now).as_millis() as u64,
                "engine load"
            );
        }
    }
}

/// Entries ordered by `kv_cache_tokens_used` descending, then engine id.
pub fn sorted_by_kv(table: EngineTable) -> Vec<EngineEntry> {
    let mut rows: Vec<EngineEntry> = table.into_values().collect();
    rows.sort_by(|a, b| {
        b.stats
            .kv_cache_tokens_used
            .cmp(&a.stats.kv_cache_tokens_used)
            .then_with(|| a.stats.engine_id.cmp(&b.stats.engine_id))
    });
    rows
}

fn fill_poll_defaults(value: Value, engine_id: &EngineId, stamp: u64) -> Value {
    let fill = |mut record: Value| {
        if let Value::Object(map) = &mut record {
            map.entry("engine_id")
                .or_insert_with(|| Value::String(engine_id.to_string()));
            map.entry("observed_at").or_insert_with(|| Value::from(stamp));
        }
        record
    };
    match value {
        Value::Array(records) => Value::Array(records.into_iter().map(fill).collect()),
        record => fill(record),
    }
}
