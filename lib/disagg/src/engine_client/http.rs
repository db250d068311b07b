// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! HTTP transport for engine calls

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use super::{ByteStream, EngineTransport, Headers, TransportError};
use crate::config::EngineEndpoint;
use crate::config::environment_names::http as env_http;

const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 100;
const DEFAULT_POOL_IDLE_TIMEOUT_SECS: u64 = 90;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
            pool_idle_timeout: Duration::from_secs(DEFAULT_POOL_IDLE_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

impl HttpTransportConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var(env_http::DYN_HTTP2_POOL_MAX_IDLE_PER_HOST)
            && let Ok(pool_size) = val.parse::<usize>()
        {
            config.pool_max_idle_per_host = pool_size;
        }

        if let Ok(val) = std::env::var(env_http::DYN_HTTP2_POOL_IDLE_TIMEOUT_SECS)
            && let Ok(timeout) = val.parse::<u64>()
        {
            config.pool_idle_timeout = Duration::from_secs(timeout);
        }

        if let Ok(val) = std::env::var(env_http::DYN_HTTP_CONNECT_TIMEOUT_SECS)
            && let Ok(timeout) = val.parse::<u64>()
        {
            config.connect_timeout = Duration::from_secs(timeout);
        }

        config
    }
}

/// Engine transport over plain HTTP/1.1 or HTTP/2, whichever the engine
/// negotiates. No overall request timeout is set here: decode streams can run
/// for minutes, so deadlines come from the retry policy.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_config(HttpTransportConfig::default())
    }

    pub fn with_config(config: HttpTransportConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { client })
    }

    pub fn from_env() -> Result<Self, reqwest::Error> {
        Self::with_config(HttpTransportConfig::from_env())
    }

    async fn send(
        &self,
        endpoint: &EngineEndpoint,
        path: &str,
        payload: Bytes,
        headers: Headers,
    ) -> Result<reqwest::Response, TransportError> {
        let mut req = self
            .client
            .post(endpoint.url(path))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload);

        for (key, value) in headers {
            req = req.header(key, value);
        }

        let response = req.send().await.map_err(from_reqwest)?;
        check_status(response).await
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(TransportError::Status {
        status: status.as_u16(),
        body: response.text().await.unwrap_or_default(),
    })
}

fn from_reqwest(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_decode() || err.is_body() {
        TransportError::Body(err.to_string())
    } else {
        TransportError::Connect(err.to_string())
    }
}

#[async_trait]
impl EngineTransport for HttpTransport {
    async fn post(
        &self,
        endpoint: &EngineEndpoint,
        path: &str,
        payload: Bytes,
        headers: Headers,
    ) -> Result<Bytes, TransportError> {
        let response = self.send(endpoint, path, payload, headers).await?;
        response.bytes().await.map_err(from_reqwest)
    }

    async fn post_streaming(
        &self,
        endpoint: &EngineEndpoint,
        path: &str,
        payload: Bytes,
        headers: Headers,
    ) -> Result<ByteStream, TransportError> {
        let response = self.send(endpoint, path, payload, headers).await?;
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| TransportError::Stream(err.to_string())));
        Ok(Box::pin(stream))
    }

    async fn get(&self, endpoint: &EngineEndpoint, path: &str) -> Result<Bytes, TransportError> {
        let response = self
            .client
            .get(endpoint.url(path))
            .send()
            .await
            .map_err(from_reqwest)?;
        check_status(response)
            .await?
            .bytes()
            .await
            .map_err(from_reqwest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_client::classify;
    use crate::protocols::EngineId;

    #[test]
    fn test_config_defaults() {
        let config = HttpTransportConfig::default();
        assert_eq!(config.pool_max_idle_per_host, 100);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(HttpTransport::with_config(config).is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_engine_is_transient() {
        let transport = HttpTransport::new().unwrap();
        // port 9 on localhost: nothing listens there in CI
        let endpoint = EngineEndpoint::new("d0", "127.0.0.1", 9);
        let err = transport
            .post(&endpoint, "/v1/completions", Bytes::from("{}"), Headers::new())
            .await
            .unwrap_err();
        assert!(classify(err, &EngineId::from("d0")).is_transient());
    }
}
