// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Environment variable names read by the disaggregation proxy, kept in one
//! place so that the settings loader, the logger and the docs agree.

/// Logging and tracing environment variables
pub mod logging {
    /// Log filter directives (e.g., "info,dynamo_disagg::scheduler=debug")
    pub const DYN_LOG: &str = "DYN_LOG";

    /// Path to logging configuration file
    pub const DYN_LOGGING_CONFIG_PATH: &str = "DYN_LOGGING_CONFIG_PATH";

    /// Enable JSONL logging format
    pub const DYN_LOGGING_JSONL: &str = "DYN_LOGGING_JSONL";

    /// Disable ANSI terminal colors in logs
    pub const DYN_SDK_DISABLE_ANSI_LOGGING: &str = "DYN_SDK_DISABLE_ANSI_LOGGING";

    /// Use local timezone for logging timestamps (default is UTC)
    pub const DYN_LOG_USE_LOCAL_TZ: &str = "DYN_LOG_USE_LOCAL_TZ";
}

/// Proxy settings
///
/// Every field of `DisaggSettings` can be set with `DYN_DISAGG_<FIELD>`; nested
/// sections use a double underscore, e.g. `DYN_DISAGG_SCHEDULER__STALE_AFTER=3s`.
pub mod disagg {
    /// Prefix for all settings environment variables
    pub const PREFIX: &str = "DYN_DISAGG_";

    /// Optional TOML file with proxy settings
    pub const DYN_DISAGG_CONFIG_PATH: &str = "DYN_DISAGG_CONFIG_PATH";
}

/// Engine HTTP client tuning
pub mod http {
    /// Idle connections kept per engine
    pub const DYN_HTTP2_POOL_MAX_IDLE_PER_HOST: &str = "DYN_HTTP2_POOL_MAX_IDLE_PER_HOST";

    /// Seconds before an idle pooled connection is closed
    pub const DYN_HTTP2_POOL_IDLE_TIMEOUT_SECS: &str = "DYN_HTTP2_POOL_IDLE_TIMEOUT_SECS";

    /// Seconds allowed for establishing a connection to an engine
    pub const DYN_HTTP_CONNECT_TIMEOUT_SECS: &str = "DYN_HTTP_CONNECT_TIMEOUT_SECS";
}
