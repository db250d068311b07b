// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::sync::Arc;

use dynamo_disagg::config::{DisaggSettings, EngineEndpoint};
use dynamo_disagg::coordinator::Coordinator;
use dynamo_disagg::engine_client::{EngineClient, MockTransport, RetryPolicy};
use dynamo_disagg::error::DisaggError;
use dynamo_disagg::metrics::{Metrics, Registry};
use dynamo_disagg::protocols::{EngineStats, Token};
use dynamo_disagg::stats::StatsAggregator;
use dynamo_disagg::tokenizers::Tokenizer;
use prometheus::Encoder;

pub const BLOCK_SIZE: u32 = 4;

pub struct Harness {
    pub transport: MockTransport,
    pub aggregator: Arc<StatsAggregator>,
    pub coordinator: Arc<Coordinator>,
    pub registry: Registry,
}

impl Harness {
    pub fn metrics_text(&self) -> String {
        let mut buffer = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .unwrap();
        String::from_utf8(buffer).unwrap()
    }

    pub fn report(&self, engine_id: &str, kv_cache_tokens_used: u64) {
        self.aggregator
            .ingest(EngineStats::new(engine_id, 0, 0, kv_cache_tokens_used, 1))
            .unwrap();
    }
}

/// One prefill engine `p0` and two decode engines `d0` and `d1`, no retries of
/// transient errors.
pub fn settings() -> DisaggSettings {
    let mut settings = DisaggSettings::default();
    settings.pool_name = "it".to_string();
    settings.block_size = BLOCK_SIZE;
    settings.prefill_engines = vec![EngineEndpoint::new("p0", "10.0.0.1", 8100)];
    settings.decode_engines = vec![
        EngineEndpoint::new("d0", "10.0.1.1", 8200),
        EngineEndpoint::new("d1", "10.0.1.2", 8200),
    ];
    settings.retry = RetryPolicy::builder().max_retries(0u32).build().unwrap();
    settings
}

pub fn harness(settings: DisaggSettings) -> Harness {
    harness_with_tokenizer(settings, None)
}

pub fn harness_with_tokenizer(
    settings: DisaggSettings,
    tokenizer: Option<Arc<dyn Tokenizer>>,
) -> Harness {
    let registry = Registry::new();
    let metrics = Arc::new(Metrics::new().unwrap());
    metrics.register(&registry).unwrap();

    let transport = MockTransport::new().with_block_size(settings.block_size);
    let aggregator = Arc::new(StatsAggregator::with_metrics(metrics.clone()));
    let client = Arc::new(EngineClient::new(
        Arc::new(transport.clone()),
        settings.retry.clone(),
    ));
    let coordinator = Arc::new(
        Coordinator::new(&settings, aggregator.clone(), client, tokenizer, metrics).unwrap(),
    );

    Harness {
        transport,
        aggregator,
        coordinator,
        registry,
    }
}

/// Prompt of `n` whitespace separated words.
pub fn prompt(n: usize) -> String {
    (0..n)
        .map(|i| (100 + i).to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Every word is a decimal token id.
pub struct NumberTokenizer;

impl Tokenizer for NumberTokenizer {
    fn encode(&self, input: &str) -> Result<Vec<Token>, DisaggError> {
        input
            .split_whitespace()
            .map(|word| {
                word.parse::<Token>()
                    .map_err(|e| DisaggError::Tokenizer(e.to_string()))
            })
            .collect()
    }

    fn decode(&self, token_ids: &[Token]) -> Result<String, DisaggError> {
        Ok(token_ids
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(" "))
    }
}
