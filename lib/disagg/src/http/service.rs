// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! HTTP surface of the proxy.
//!
//! | Route | Purpose |
//! |---|---|
//! | `POST /v1/completions` | coordinated prefill + decode |
//! | `GET /healthcheck`, `GET /health` | pool health |
//! | `GET /live` | liveness |
//! | `POST /engine_stats`, `GET /engine_stats` | stats push and table dump |
//! | `GET /metrics` | prometheus text format |

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, http::Method, http::StatusCode, response::IntoResponse};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::coordinator::Coordinator;
use crate::logging::make_http_span;
use crate::metrics::Registry;

pub mod completions;
pub mod engine_stats;
pub mod health;
pub mod metrics;

/// Documentation of one route, logged at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDoc {
    method: Method,
    path: String,
}

impl RouteDoc {
    pub fn new<T: Into<String>>(method: Method, path: T) -> Self {
        RouteDoc {
            method,
            path: path.into(),
        }
    }
}

impl fmt::Display for RouteDoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// State shared by every handler.
pub struct State {
    coordinator: Arc<Coordinator>,
}

impl State {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }
}

#[derive(Clone)]
pub struct HttpService {
    router: Router,
    route_docs: Vec<RouteDoc>,
}

impl HttpService {
    pub fn new(coordinator: Arc<Coordinator>, registry: Registry) -> Self {
        let state = Arc::new(State::new(coordinator));

        let mut route_docs = Vec::new();
        let mut router = Router::new();
        for (docs, route) in [
            completions::completions_router(state.clone(), None),
            health::health_check_router(state.clone(), None),
            health::health_check_router(state.clone(), Some("/health".to_string())),
            health::live_check_router(state.clone(), None),
            engine_stats::engine_stats_router(state.clone(), None),
            metrics::router(registry, None),
        ] {
            route_docs.extend(docs);
            router = router.merge(route);
        }

        let router = router
            .fallback(|| async { (StatusCode::NOT_FOUND, "Route not found").into_response() })
            .layer(TraceLayer::new_for_http().make_span_with(make_http_span));

        Self { router, route_docs }
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn route_docs(&self) -> &[RouteDoc] {
        &self.route_docs
    }

    /// Bind `host:port` and serve until `cancel_token` is cancelled.
    pub async fn spawn(
        &self,
        host: &str,
        port: u16,
        cancel_token: CancellationToken,
    ) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
        let address = format!("{host}:{port}");
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to address {address}: {e}"))?;
        let actual_address = listener.local_addr()?;

        for doc in &self.route_docs {
            tracing::debug!(route = %doc, "registered route");
        }
        tracing::info!(address = %actual_address, "disagg proxy listening");

        let app = self.router.clone();
        let observer = cancel_token.child_token();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(observer.cancelled_owned())
                .await
            {
                tracing::error!("HTTP server error: {e}");
            }
        });

        Ok((actual_address, handle))
    }
}
