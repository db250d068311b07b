// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cache-Aware Scheduler
//!
//! Picks the engine for each phase from a snapshot of the Engine Table. The
//! policy is greedy and reserves nothing: two concurrent selections may pick
//! the same engine, and the imbalance corrects itself once the engine reports
//! its new load.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::DisaggError;
use crate::protocols::EngineId;
use crate::stats::{EngineTable, StatsAggregator};

/// How engines of one pool are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SelectionPolicy {
    /// Lowest weighted load score from the Engine Table.
    CacheAware,
    /// Rotate through the configured pool, ignoring stats.
    RoundRobin,
}

impl SelectionPolicy {
    pub fn build(self, config: &SchedulerConfig, block_size: u32) -> Box<dyn EngineSelector> {
        match self {
            SelectionPolicy::CacheAware => {
                Box::new(CacheAwareSelector::new(config.clone(), block_size))
            }
            SelectionPolicy::RoundRobin => Box::new(RoundRobinSelector::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub decode_policy: SelectionPolicy,

    pub prefill_policy: SelectionPolicy,

    /// Entries older than this are still eligible but pay `stale_penalty`.
    #[serde(with = "humantime_serde")]
    pub stale_after: Duration,

    /// Entries older than this are treated as unknown load and skipped.
    #[serde(with = "humantime_serde")]
    pub staleness_ceiling: Duration,

    pub stale_penalty: f64,

    pub waiting_weight: f64,

    pub running_weight: f64,

    /// Weight per cache block in use.
    pub kv_weight: f64,

    /// Weight per request admitted by this proxy but not yet completed.
    pub pending_weight: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            decode_policy: SelectionPolicy::CacheAware,
            prefill_policy: SelectionPolicy::RoundRobin,
            stale_after: Duration::from_secs(2),
            staleness_ceiling: Duration::from_secs(10),
            stale_penalty: 64.0,
            waiting_weight: 4.0,
            running_weight: 1.0,
            kv_weight: 1.0,
            pending_weight: 1.0,
        }
    }
}

/// Per-call inputs to a selection.
#[derive(Debug, Clone, Default)]
pub struct SelectionRequest {
    pub request_id: String,
    /// Engines that must not be chosen, e.g. a decode engine that already failed.
    pub exclude: HashSet<EngineId>,
    /// In-flight requests per engine that the engines have not reported yet.
    pub pending: HashMap<EngineId, u64>,
}

impl SelectionRequest {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Default::default()
        }
    }

    pub fn excluding(mut self, exclude: impl IntoIterator<Item = EngineId>) -> Self {
        self.exclude.extend(exclude);
        self
    }

    pub fn with_pending(mut self, pending: HashMap<EngineId, u64>) -> Self {
        self.pending = pending;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSelection {
    pub engine_id: EngineId,
    /// Weighted load score, lower is better. Zero for stats-free policies.
    pub score: f64,
    /// The chosen engine's stats were older than `stale_after`.
    pub stale: bool,
    /// Number of engines that were eligible.
    pub candidates: usize,
}

pub trait EngineSelector: Send + Sync {
    /// Choose one engine of `pool`. An empty pool means every engine in
    /// `table` is a member.
    fn select(
        &self,
        pool: &[EngineId],
        table: &EngineTable,
        request: &SelectionRequest,
        now: Instant,
    ) -> Result<EngineSelection, DisaggError>;
}

#[derive(Debug, Clone)]
struct Candidate {
    engine_id: EngineId,
    score: f64,
    kv_tokens: u64,
    stale: bool,
}

pub struct CacheAwareSelector {
    config: SchedulerConfig,
    block_size: u32,
}

impl CacheAwareSelector {
    pub fn new(config: SchedulerConfig, block_size: u32) -> Self {
        Self { config, block_size }
    }
}

impl EngineSelector for CacheAwareSelector {
    fn select(
        &self,
        pool: &[EngineId],
        table: &EngineTable,
        request: &SelectionRequest,
        now: Instant,
    ) -> Result<EngineSelection, DisaggError> {
        let members: Vec<&EngineId> = if pool.is_empty() {
            table.keys().collect()
        } else {
            pool.iter().collect()
        };

        let block_size = self.block_size.max(1) as f64;
        let mut candidates = Vec::with_capacity(members.len());

        for engine_id in members {
            if request.exclude.contains(engine_id) {
                continue;
            }
            let Some(entry) = table.get(engine_id) else {
                continue;
            };
            let age = entry.age(now);
            if age > self.config.staleness_ceiling {
                tracing::debug!(
                    request_id = %request.request_id,
                    engine_id = %engine_id,
                    age_ms = age.as_millis() as u64,
                    "skipping engine past the staleness ceiling"
                );
                continue;
            }
            let stale = age > self.config.stale_after;
            if stale {
                tracing::debug!(
                    request_id = %request.request_id,
                    engine_id = %engine_id,
                    age_ms = age.as_millis() as u64,
                    "stale stats, discounting engine"
                );
            }

            let stats = &entry.stats;
            let pending = request.pending.get(engine_id).copied().unwrap_or(0);
            let kv_blocks = stats.kv_cache_tokens_used as f64 / block_size;
            let mut score = self.config.waiting_weight * stats.waiting_queue_length as f64
                + self.config.running_weight * stats.running_queue_length as f64
                + self.config.kv_weight * kv_blocks
                + self.config.pending_weight * pending as f64;
            if stale {
                score += self.config.stale_penalty;
            }

            tracing::trace!(
                "score for engine_id={engine_id}: {score:.3} = {:.1} * {} waiting + {:.1} * {} running + {:.1} * {kv_blocks:.3} kv blocks + {:.1} * {pending} pending{}",
                self.config.waiting_weight,
                stats.waiting_queue_length,
                self.config.running_weight,
                stats.running_queue_length,
                self.config.kv_weight,
                self.config.pending_weight,
                if stale { " + stale penalty" } else { "" },
            );

            candidates.push(Candidate {
                engine_id: engine_id.clone(),
                score,
                kv_tokens: stats.kv_cache_tokens_used,
                stale,
            });
        }

        let count = candidates.len();
        let best = candidates
            .into_iter()
            .min_by(|a, b| {
                a.score
                    .total_cmp(&b.score)
                    .then_with(|| a.kv_tokens.cmp(&b.kv_tokens))
                    .then_with(|| a.engine_id.cmp(&b.engine_id))
            })
            .ok_or(DisaggError::NoEligibleEngine)?;

        tracing::debug!(
            request_id = %request.request_id,
            engine_id = %best.engine_id,
            score = best.score,
            kv_tokens = best.kv_tokens,
            stale = best.stale,
            candidates = count,
            "selected engine"
        );

        Ok(EngineSelection {
            engine_id: best.engine_id,
            score: best.score,
            stale: best.stale,
            candidates: count,
        })
    }
}

/// Rotates through the pool. Used where engines do not report stats.
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    next: AtomicUsize,
}

impl EngineSelector for RoundRobinSelector {
    fn select(
        &self,
        pool: &[EngineId],
        table: &EngineTable,
        request: &SelectionRequest,
        _now: Instant,
    ) -> Result<EngineSelection, DisaggError> {
        let mut members: Vec<&EngineId> = if pool.is_empty() {
            table.keys().collect()
        } else {
            pool.iter().collect()
        };
        if pool.is_empty() {
            members.sort();
        }
        let eligible: Vec<&EngineId> = members
            .into_iter()
            .filter(|id| !request.exclude.contains(*id))
            .collect();
        if eligible.is_empty() {
            return Err(DisaggError::NoEligibleEngine);
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % eligible.len();
        Ok(EngineSelection {
            engine_id: eligible[index].clone(),
            score: 0.0,
            stale: false,
            candidates: eligible.len(),
        })
    }
}

/// Engine selection for both phases, backed by the shared Stats Aggregator.
pub struct Scheduler {
    aggregator: Arc<StatsAggregator>,
    decode_pool: Vec<EngineId>,
    prefill_pool: Vec<EngineId>,
    decode_selector: Box<dyn EngineSelector>,
    prefill_selector: Box<dyn EngineSelector>,
}

impl Scheduler {
    pub fn new(
        config: &SchedulerConfig,
        block_size: u32,
        aggregator: Arc<StatsAggregator>,
        decode_pool: Vec<EngineId>,
        prefill_pool: Vec<EngineId>,
    ) -> Self {
        Self {
            aggregator,
            decode_pool,
            prefill_pool,
            decode_selector: config.decode_policy.build(config, block_size),
            prefill_selector: config.prefill_policy.build(config, block_size),
        }
    }

    pub fn aggregator(&self) -> &Arc<StatsAggregator> {
        &self.aggregator
    }

    /// Fails with [`DisaggError::NoEligibleEngine`] when no engine of the
    /// decode pool has an entry younger than the staleness ceiling.
    pub fn select_decode_engine(
        &self,
        request: &SelectionRequest,
    ) -> Result<EngineSelection, DisaggError> {
        self.select_decode_engine_at(request, Instant::now())
    }

    pub fn select_decode_engine_at(
        &self,
        request: &SelectionRequest,
        now: Instant,
    ) -> Result<EngineSelection, DisaggError> {
        let table = self.aggregator.snapshot();
        self.decode_selector
            .select(&self.decode_pool, &table, request, now)
    }

    pub fn select_prefill_engine(
        &self,
        request: &SelectionRequest,
    ) -> Result<EngineSelection, DisaggError> {
        if self.prefill_pool.is_empty() {
            return Err(DisaggError::NoEligibleEngine);
        }
        let table = self.aggregator.snapshot();
        self.prefill_selector
            .select(&self.prefill_pool, &table, request, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::EngineStats;
    use proptest::prelude::*;
    use rstest::rstest;

    fn ids(names: &[&str]) -> Vec<EngineId> {
        names.iter().map(|n| EngineId::from(*n)).collect()
    }

    fn scheduler(aggregator: Arc<StatsAggregator>, pool: &[&str]) -> Scheduler {
        Scheduler::new(
            &SchedulerConfig::default(),
            128,
            aggregator,
            ids(pool),
            Vec::new(),
        )
    }

    #[test]
    fn test_prefers_lower_kv_usage() {
        let aggregator = Arc::new(StatsAggregator::new());
        aggregator.ingest(EngineStats::new("e1", 0, 0, 100, 1)).unwrap();
        aggregator.ingest(EngineStats::new("e2", 0, 0, 50, 1)).unwrap();

        let scheduler = scheduler(aggregator, &[]);
        let selection = scheduler
            .select_decode_engine(&SelectionRequest::new("r1"))
            .unwrap();
        assert_eq!(selection.engine_id, EngineId::from("e2"));
        assert_eq!(selection.candidates, 2);
        assert!(!selection.stale);
    }

    #[rstest]
    #[case::kv_breaks_tie(EngineStats::new("b", 1, 0, 10, 1), EngineStats::new("a", 1, 0, 20, 1), "b")]
    #[case::id_breaks_tie(EngineStats::new("b", 1, 0, 10, 1), EngineStats::new("a", 1, 0, 10, 1), "a")]
    #[case::waiting_dominates(EngineStats::new("a", 3, 0, 0, 1), EngineStats::new("b", 0, 2, 0, 1), "b")]
    fn test_tie_breaks(
        #[case] first: EngineStats,
        #[case] second: EngineStats,
        #[case] expected: &str,
    ) {
        let mut config = SchedulerConfig::default();
        // a kv difference below one block must not move the score
        config.kv_weight = 0.0;
        let aggregator = Arc::new(StatsAggregator::new());
        aggregator.ingest(first).unwrap();
        aggregator.ingest(second).unwrap();
        let scheduler = Scheduler::new(&config, 128, aggregator, Vec::new(), Vec::new());
        let selection = scheduler
            .select_decode_engine(&SelectionRequest::new("r"))
            .unwrap();
        assert_eq!(selection.engine_id, EngineId::from(expected));
    }

    #[test]
    fn test_no_eligible_engine() {
        let aggregator = Arc::new(StatsAggregator::new());
        let scheduler = scheduler(aggregator.clone(), &["d0"]);
        assert!(matches!(
            scheduler.select_decode_engine(&SelectionRequest::new("r")),
            Err(DisaggError::NoEligibleEngine)
        ));

        // known but past the ceiling
        let t0 = Instant::now();
        aggregator
            .ingest_at(EngineStats::new("d0", 0, 0, 0, 1), t0)
            .unwrap();
        let later = t0 + Duration::from_secs(11);
        assert!(matches!(
            scheduler.select_decode_engine_at(&SelectionRequest::new("r"), later),
            Err(DisaggError::NoEligibleEngine)
        ));
    }

    #[test]
    fn test_stale_entries_are_discounted_not_excluded() {
        let aggregator = Arc::new(StatsAggregator::new());
        let t0 = Instant::now();
        // idle but stale
        aggregator
            .ingest_at(EngineStats::new("old", 0, 0, 0, 1), t0)
            .unwrap();
        // busier but fresh
        aggregator
            .ingest_at(
                EngineStats::new("fresh", 2, 4, 256, 1),
                t0 + Duration::from_secs(4),
            )
            .unwrap();
        let scheduler = scheduler(aggregator, &["old", "fresh"]);
        let now = t0 + Duration::from_secs(5);

        let selection = scheduler
            .select_decode_engine_at(&SelectionRequest::new("r"), now)
            .unwrap();
        assert_eq!(selection.engine_id, EngineId::from("fresh"));

        // with only the stale engine left it is still used
        let selection = scheduler
            .select_decode_engine_at(
                &SelectionRequest::new("r").excluding(ids(&["fresh"])),
                now,
            )
            .unwrap();
        assert_eq!(selection.engine_id, EngineId::from("old"));
        assert!(selection.stale);
    }

    #[test]
    fn test_pool_and_exclusion() {
        let aggregator = Arc::new(StatsAggregator::new());
        aggregator.ingest(EngineStats::new("d0", 0, 0, 0, 1)).unwrap();
        aggregator.ingest(EngineStats::new("d1", 0, 0, 500, 1)).unwrap();
        aggregator.ingest(EngineStats::new("p0", 0, 0, 0, 1)).unwrap();

        let scheduler = scheduler(aggregator, &["d0", "d1"]);
        let request = SelectionRequest::new("r").excluding(ids(&["d0"]));
        let selection = scheduler.select_decode_engine(&request).unwrap();
        assert_eq!(selection.engine_id, EngineId::from("d1"));

        let request = SelectionRequest::new("r").excluding(ids(&["d0", "d1"]));
        assert!(matches!(
            scheduler.select_decode_engine(&request),
            Err(DisaggError::NoEligibleEngine)
        ));
    }

    #[test]
    fn test_pending_requests_shift_selection() {
        let aggregator = Arc::new(StatsAggregator::new());
        aggregator.ingest(EngineStats::new("d0", 0, 0, 0, 1)).unwrap();
        aggregator.ingest(EngineStats::new("d1", 0, 1, 0, 1)).unwrap();
        let scheduler = scheduler(aggregator, &[]);

        let pending = HashMap::from([(EngineId::from("d0"), 3)]);
        let selection = scheduler
            .select_decode_engine(&SelectionRequest::new("r").with_pending(pending))
            .unwrap();
        assert_eq!(selection.engine_id, EngineId::from("d1"));
    }

    #[test]
    fn test_round_robin_prefill() {
        let aggregator = Arc::new(StatsAggregator::new());
        let scheduler = Scheduler::new(
            &SchedulerConfig::default(),
            128,
            aggregator,
            Vec::new(),
            ids(&["p0", "p1"]),
        );
        let picks: Vec<EngineId> = (0..4)
            .map(|_| {
                scheduler
                    .select_prefill_engine(&SelectionRequest::new("r"))
                    .unwrap()
                    .engine_id
            })
            .collect();
        assert_eq!(picks, ids(&["p0", "p1", "p0", "p1"]));
    }

    proptest! {
        #[test]
        fn never_selects_past_ceiling_when_fresher_exists(
            ages in proptest::collection::vec(0u64..30, 1..12),
            kvs in proptest::collection::vec(0u64..10_000, 12),
        ) {
            let aggregator = Arc::new(StatsAggregator::new());
            let t0 = Instant::now();
            let now = t0 + Duration::from_secs(30);
            for (i, age) in ages.iter().enumerate() {
                aggregator
                    .ingest_at(
                        EngineStats::new(format!("e{i}"), 0, 0, kvs[i], 1),
                        now - Duration::from_secs(*age),
                    )
                    .unwrap();
            }
            let config = SchedulerConfig::default();
            let scheduler = Scheduler::new(&config, 128, aggregator.clone(), Vec::new(), Vec::new());
            let fresh_exists = ages.iter().any(|a| Duration::from_secs(*a) <= config.staleness_ceiling);

            match scheduler.select_decode_engine_at(&SelectionRequest::new("r"), now) {
                Ok(selection) => {
                    let entry = aggregator.get(&selection.engine_id).unwrap();
                    prop_assert!(entry.age(now) <= config.staleness_ceiling);
                }
                Err(_) => prop_assert!(!fresh_exists),
            }
        }
    }
}
