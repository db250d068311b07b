// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Disaggregated prefill/decode coordination.
//!
//! A request is prefilled on one engine, which writes the prompt's KV cache
//! and hands back a cache transfer handle; a second engine, picked by a
//! cache-aware scheduler from pushed or polled engine load stats, pulls that
//! cache and produces the output tokens.

pub mod config;
pub mod coordinator;
pub mod engine_client;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod protocols;
pub mod scheduler;
pub mod stats;
pub mod tokenizers;

pub use config::DisaggSettings;
pub use coordinator::{CompletionResponse, Coordinator, CoordinatorConfig, RequestState};
pub use engine_client::{EngineClient, EngineTransport, RetryPolicy};
pub use error::{DisaggError, ErrorCode, RequestError};
pub use protocols::{EngineId, EngineStats, KvTransferParams};
pub use scheduler::Scheduler;
pub use stats::StatsAggregator;
