// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Proxy settings and configuration helpers.
//!
//! Settings are resolved in the following order, where the last has the highest
//! priority:
//! 1. Built-in defaults
//! 2. TOML file pointed to by `DYN_DISAGG_CONFIG_PATH`
//! 3. Environment variables prefixed with `DYN_DISAGG_`
//!
//! The proxy binary applies its command line flags on top of the result.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::coordinator::CoordinatorConfig;
use crate::engine_client::RetryPolicy;
use crate::protocols::{DEFAULT_BLOCK_SIZE, EngineId};
use crate::scheduler::SchedulerConfig;
use crate::stats::StatsConfig;

pub mod environment_names;

use environment_names::disagg as env_disagg;

/// Check if a string is truthy.
///
/// Truthy values: "1", "true", "on", "yes" (case-insensitive)
pub fn is_truthy(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "1" | "true" | "on" | "yes")
}

/// Check if an environment variable is truthy.
///
/// Returns `false` if the environment variable is not set or is invalid.
pub fn env_is_truthy(env: &str) -> bool {
    match std::env::var(env) {
        Ok(val) => is_truthy(val.as_str()),
        Err(_) => false,
    }
}

/// JSONL logging is enabled via `DYN_LOGGING_JSONL`.
pub fn jsonl_logging_enabled() -> bool {
    env_is_truthy(environment_names::logging::DYN_LOGGING_JSONL)
}

/// ANSI colours are disabled via `DYN_SDK_DISABLE_ANSI_LOGGING`.
pub fn disable_ansi_logging() -> bool {
    env_is_truthy(environment_names::logging::DYN_SDK_DISABLE_ANSI_LOGGING)
}

/// Local timezone timestamps are enabled via `DYN_LOG_USE_LOCAL_TZ`.
pub fn use_local_timezone() -> bool {
    env_is_truthy(environment_names::logging::DYN_LOG_USE_LOCAL_TZ)
}

/// How the proxy obtains the cache transfer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProxyMode {
    /// Prefill on a prefill engine, decode on a decode engine.
    #[default]
    Disaggregated,
    /// No prefill engine: the proxy synthesises the handle from the tokenized
    /// prompt and sends a block-truncated prompt to the decode engine.
    MockPd,
}

impl FromStr for ProxyMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "disaggregated" | "pd" => Ok(ProxyMode::Disaggregated),
            "mock_pd" | "mock" => Ok(ProxyMode::MockPd),
            _ => anyhow::bail!("Invalid proxy mode: '{s}'. Expected 'disaggregated' or 'mock_pd'"),
        }
    }
}

/// Address of one engine, written `id=host:port` or `host:port`.
///
/// When the id is omitted the `host:port` string is used as the id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EngineEndpoint {
    pub id: EngineId,
    pub host: String,
    pub port: u16,
}

impl EngineEndpoint {
    pub fn new(id: impl Into<EngineId>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }
}

impl fmt::Display for EngineEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}:{}", self.id, self.host, self.port)
    }
}

impl FromStr for EngineEndpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (id, address) = match s.split_once('=') {
            Some((id, address)) => (Some(id.trim()), address.trim()),
            None => (None, s.trim()),
        };
        let Some((host, port)) = address.rsplit_once(':') else {
            anyhow::bail!("Invalid engine address '{s}'. Expected [id=]host:port");
        };
        if host.is_empty() {
            anyhow::bail!("Invalid engine address '{s}': empty host");
        }
        let port: u16 = port
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid port in engine address '{s}': {e}"))?;
        let id = match id {
            Some("") => anyhow::bail!("Invalid engine address '{s}': empty id"),
            Some(id) => EngineId::from(id),
            None => EngineId::from(address),
        };
        Ok(Self::new(id, host, port))
    }
}

impl TryFrom<String> for EngineEndpoint {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<EngineEndpoint> for String {
    fn from(value: EngineEndpoint) -> Self {
        value.to_string()
    }
}

/// HTTP listener settings for the proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

/// Complete proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_settings"))]
pub struct DisaggSettings {
    pub mode: ProxyMode,

    /// Name reported by the health endpoint and used as request id prefix.
    pub pool_name: String,

    /// KV cache block size in tokens, fixed by the engine deployment.
    #[validate(range(min = 1))]
    pub block_size: u32,

    pub prefill_engines: Vec<EngineEndpoint>,

    pub decode_engines: Vec<EngineEndpoint>,

    pub server: ServerConfig,

    pub scheduler: SchedulerConfig,

    pub retry: RetryPolicy,

    pub coordinator: CoordinatorConfig,

    pub stats: StatsConfig,
}

impl Default for DisaggSettings {
    fn default() -> Self {
        Self {
            mode: ProxyMode::default(),
            pool_name: "default".to_string(),
            block_size: DEFAULT_BLOCK_SIZE,
            prefill_engines: Vec::new(),
            decode_engines: Vec::new(),
            server: ServerConfig::default(),
            scheduler: SchedulerConfig::default(),
            retry: RetryPolicy::default(),
            coordinator: CoordinatorConfig::default(),
            stats: StatsConfig::default(),
        }
    }
}

/// Upper bound for every retry and attempt count.
pub const MAX_RETRY_COUNT: u32 = 16;

fn validate_settings(settings: &DisaggSettings) -> Result<(), ValidationError> {
    if settings.scheduler.staleness_ceiling < settings.scheduler.stale_after {
        return Err(ValidationError::new(
            "staleness_ceiling must not be shorter than stale_after",
        ));
    }
    if settings.retry.base_delay > settings.retry.max_delay {
        return Err(ValidationError::new(
            "retry base_delay must not exceed max_delay",
        ));
    }
    if settings.coordinator.max_prefill_attempts == 0 {
        return Err(ValidationError::new("max_prefill_attempts must be at least 1"));
    }
    let counts = [
        settings.retry.max_retries,
        settings.coordinator.max_decode_retries,
        settings.coordinator.max_prefill_attempts,
    ];
    if counts.iter().any(|count| *count > MAX_RETRY_COUNT) {
        return Err(ValidationError::new(
            "retry and attempt counts must not exceed MAX_RETRY_COUNT",
        ));
    }
    Ok(())
}

impl DisaggSettings {
    pub fn figment() -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(DisaggSettings::default()));
        if let Ok(path) = std::env::var(env_disagg::DYN_DISAGG_CONFIG_PATH) {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(
            Env::prefixed(env_disagg::PREFIX)
                .filter_map(|k| {
                    let full_key = format!("{}{}", env_disagg::PREFIX, k.as_str());
                    // filters out empty environment variables and the config path itself
                    match std::env::var(&full_key) {
                        Ok(v) if !v.is_empty() && full_key != env_disagg::DYN_DISAGG_CONFIG_PATH => {
                            Some(k.into())
                        }
                        _ => None,
                    }
                })
                .split("__"),
        )
    }

    /// Load settings from the config file and the environment.
    pub fn from_settings() -> Result<Self> {
        let settings: DisaggSettings = Self::figment().extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from an explicit figment, for callers that layer their own
    /// providers.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let settings: DisaggSettings = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Re-run validation after callers changed fields, e.g. from CLI flags.
    pub fn validated(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }
}
