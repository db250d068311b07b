// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Disaggregated prefill/decode proxy.
//!
//! Settings come from defaults, then the TOML file named by
//! `DYN_DISAGG_CONFIG_PATH`, then `DYN_DISAGG_*` environment variables, then
//! the flags below.
//!
//! ```text
//! disagg-proxy --prefill p0=10.0.0.1:8100 --decode d0=10.0.0.2:8200 \
//!     --decode d1=10.0.0.3:8200 --stats-poll-interval 1s
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use dynamo_disagg::config::{DisaggSettings, EngineEndpoint, ProxyMode};
use dynamo_disagg::coordinator::Coordinator;
use dynamo_disagg::engine_client::{EngineClient, HttpTransport};
use dynamo_disagg::http::service::HttpService;
use dynamo_disagg::logging;
use dynamo_disagg::metrics::{Metrics, Registry};
use dynamo_disagg::stats::StatsAggregator;
use dynamo_disagg::tokenizers::{HuggingFaceTokenizer, Tokenizer};

#[derive(Parser, Debug)]
#[command(name = "disagg-proxy", version, about = "Disaggregated prefill/decode proxy")]
struct Args {
    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Prefill engine, `[id=]host:port`. Repeat for several engines.
    #[arg(long = "prefill", value_name = "ENGINE")]
    prefill: Vec<EngineEndpoint>,

    /// Decode engine, `[id=]host:port`. Repeat for several engines.
    #[arg(long = "decode", value_name = "ENGINE")]
    decode: Vec<EngineEndpoint>,

    /// `disaggregated` or `mock_pd`
    #[arg(long)]
    mode: Option<ProxyMode>,

    /// Pool name, reported by the health check and used as request id prefix
    #[arg(long)]
    pool_name: Option<String>,

    /// KV cache block size in tokens
    #[arg(long)]
    block_size: Option<u32>,

    /// Path to a HuggingFace `tokenizer.json`. Required in mock_pd mode.
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// Retries of a transient engine failure
    #[arg(long)]
    max_retries: Option<u32>,

    /// Delay before the first retry, e.g. `1ms`
    #[arg(long, value_parser = humantime::parse_duration)]
    retry_delay: Option<Duration>,

    /// Poll `/load_metrics` on every engine at this interval
    #[arg(long, value_parser = humantime::parse_duration)]
    stats_poll_interval: Option<Duration>,

    /// Log the engine table at this interval
    #[arg(long, value_parser = humantime::parse_duration)]
    stats_report_interval: Option<Duration>,
}

impl Args {
    fn apply(self, settings: &mut DisaggSettings) -> Option<PathBuf> {
        if let Some(host) = self.host {
            settings.server.host = host;
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if !self.prefill.is_empty() {
            settings.prefill_engines = self.prefill;
        }
        if !self.decode.is_empty() {
            settings.decode_engines = self.decode;
        }
        if let Some(mode) = self.mode {
            settings.mode = mode;
        }
        if let Some(pool_name) = self.pool_name {
            settings.pool_name = pool_name;
        }
        if let Some(block_size) = self.block_size {
            settings.block_size = block_size;
        }
        if let Some(max_retries) = self.max_retries {
            settings.retry.max_retries = max_retries;
        }
        if let Some(delay) = self.retry_delay {
            settings.retry.base_delay = delay;
        }
        if self.stats_poll_interval.is_some() {
            settings.stats.poll_interval = self.stats_poll_interval;
        }
        if self.stats_report_interval.is_some() {
            settings.stats.report_interval = self.stats_report_interval;
        }
        self.tokenizer
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let args = Args::parse();

    let mut settings = DisaggSettings::from_settings()?;
    let tokenizer_path = args.apply(&mut settings);
    let settings = settings.validated()?;

    let registry = Registry::new();
    let metrics = Arc::new(Metrics::new()?);
    metrics.register(&registry)?;

    let aggregator = Arc::new(StatsAggregator::with_metrics(metrics.clone()));
    let transport = Arc::new(HttpTransport::from_env()?);
    let client = Arc::new(EngineClient::new(transport, settings.retry.clone()));

    let tokenizer: Option<Arc<dyn Tokenizer>> = match tokenizer_path {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading tokenizer");
            Some(Arc::new(HuggingFaceTokenizer::from_file(&path)?))
        }
        None => None,
    };

    let coordinator = Arc::new(Coordinator::new(
        &settings,
        aggregator.clone(),
        client.clone(),
        tokenizer,
        metrics,
    )?);

    let cancel_token = CancellationToken::new();
    let mut tasks = vec![coordinator.clone().start_reclaimer(cancel_token.child_token())];
    if let Some(interval) = settings.stats.poll_interval {
        let engines = settings
            .prefill_engines
            .iter()
            .chain(&settings.decode_engines)
            .cloned()
            .collect();
        tasks.push(aggregator.clone().start_polling(
            client,
            engines,
            interval,
            cancel_token.child_token(),
        ));
    }
    if let Some(interval) = settings.stats.report_interval {
        tasks.push(
            aggregator
                .clone()
                .start_reporting(interval, cancel_token.child_token()),
        );
    }

    let service = HttpService::new(coordinator, registry);
    let (address, server) = service
        .spawn(
            &settings.server.host,
            settings.server.port,
            cancel_token.clone(),
        )
        .await?;

    tracing::info!(
        %address,
        mode = %settings.mode,
        pool = %settings.pool_name,
        prefill_engines = settings.prefill_engines.len(),
        decode_engines = settings.decode_engines.len(),
        block_size = settings.block_size,
        "disagg proxy started"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    cancel_token.cancel();

    server.await?;
    for task in tasks {
        task.await?;
    }
    Ok(())
}
