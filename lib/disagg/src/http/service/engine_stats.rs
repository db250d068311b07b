// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! HTTP endpoint through which engines push their load stats.
//!
//! ## Endpoints
//!
//! ### POST /engine_stats
//!
//! Ingest one Engine Stats Record or an array of them. Malformed records are
//! dropped and counted; the rest of the batch is still ingested.
//!
//! ```json
//! // Request
//! {"engine_id": "d0", "waiting_queue_length": 2, "running_queue_length": 5,
//!  "kv_cache_tokens_used": 4096, "observed_at": 1718000000123}
//! // Response
//! {"accepted": 1, "outdated": 0, "rejected": 0}
//! ```
//!
//! ### GET /engine_stats
//!
//! The Engine Table, heaviest KV user first.
//!
//! ```json
//! {"engines": [{"engine_id": "d0", ..., "age_ms": 120}], "total_kv_tokens": 4096}
//! ```

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::Request,
    http::{Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::Value;

use super::{RouteDoc, State};
use crate::protocols::EngineStats;
use crate::stats::sorted_by_kv;

#[derive(Debug, Serialize)]
pub struct EngineRow {
    #[serde(flatten)]
    pub stats: EngineStats,
    pub age_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct EngineTableResponse {
    pub engines: Vec<EngineRow>,
    pub total_kv_tokens: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Turn axum's plain text JSON rejections into JSON bodies.
async fn json_error_middleware(request: Request, next: Next) -> Response {
    let response = next.run(request).await;

    let status = response.status();
    if status == StatusCode::UNPROCESSABLE_ENTITY || status == StatusCode::BAD_REQUEST {
        let (_parts, body) = response.into_parts();
        let body_bytes = axum::body::to_bytes(body, usize::MAX)
            .await
            .unwrap_or_default();
        let error_message = String::from_utf8_lossy(&body_bytes).to_string();
        (
            status,
            Json(ErrorResponse {
                error: error_message,
            }),
        )
            .into_response()
    } else {
        response
    }
}

pub fn engine_stats_router(state: Arc<State>, path: Option<String>) -> (Vec<RouteDoc>, Router) {
    let base_path = path.unwrap_or_else(|| "/engine_stats".to_string());

    let docs: Vec<RouteDoc> = vec![
        RouteDoc::new(Method::POST, &base_path),
        RouteDoc::new(Method::GET, &base_path),
    ];

    let router = Router::new()
        .route(&base_path, post(ingest_handler))
        .route(&base_path, get(table_handler))
        .layer(axum::middleware::from_fn(json_error_middleware))
        .with_state(state);

    (docs, router)
}

async fn ingest_handler(
    axum::extract::State(state): axum::extract::State<Arc<State>>,
    Json(value): Json<Value>,
) -> impl IntoResponse {
    let summary = state.coordinator().aggregator().ingest_json(value);
    if summary.rejected > 0 {
        tracing::debug!(
            accepted = summary.accepted,
            rejected = summary.rejected,
            "dropped malformed engine stats"
        );
    }
    (StatusCode::OK, Json(summary))
}

async fn table_handler(
    axum::extract::State(state): axum::extract::State<Arc<State>>,
) -> impl IntoResponse {
    let aggregator = state.coordinator().aggregator();
    let now = Instant::now();
    let engines = sorted_by_kv(aggregator.snapshot())
        .into_iter()
        .map(|entry| EngineRow {
            age_ms: entry.age(now).as_millis() as u64,
            stats: entry.stats,
        })
        .collect();

    (
        StatusCode::OK,
        Json(EngineTableResponse {
            engines,
            total_kv_tokens: aggregator.total_kv_tokens(),
        }),
    )
}
