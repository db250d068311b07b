// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the coordination layer.
//!
//! [`DisaggError`] is what individual components return. The coordinator folds
//! those into a terminal [`RequestError`] carrying the phase that failed and a
//! stable [`ErrorCode`].

use serde::Serialize;

use crate::protocols::{EngineId, HandleError, RequestPhase};

/// Why an engine refused a call at the application level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RejectionKind {
    /// The engine has no room left in its KV cache.
    CacheExhausted,
    /// The decode engine cannot honour the block count declared by the handle.
    HandleMismatch,
    /// The engine rejected the payload itself.
    BadRequest,
    /// Any other non-retryable refusal.
    Other,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DisaggError {
    #[error("transient transport error calling {engine}: {message}")]
    TransientTransport { engine: EngineId, message: String },

    #[error("engine {engine} rejected the request ({kind}, status {status}): {message}")]
    EngineRejection {
        engine: EngineId,
        kind: RejectionKind,
        status: u16,
        message: String,
    },

    #[error("cache transfer handle mismatch: {0}")]
    HandleMismatch(#[from] HandleError),

    #[error("no eligible engine: every known engine is missing or stale")]
    NoEligibleEngine,

    #[error("admission rejected: {used} kv tokens in use, ceiling is {ceiling}")]
    AdmissionRejected { used: u64, ceiling: u64 },

    #[error("request cancelled")]
    Cancelled,

    #[error("invalid response from {engine}: {message}")]
    InvalidResponse { engine: EngineId, message: String },

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("engine {0} is not part of the configured pool")]
    UnknownEngine(EngineId),

    #[error("cache transfer handle was reclaimed before decode")]
    HandleExpired,

    #[error("request id {0} is already in flight")]
    DuplicateRequestId(String),
}

impl DisaggError {
    /// Retrying the same call against the same engine may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, DisaggError::TransientTransport { .. })
    }

    /// Failures that invalidate the cache transfer handle and force a new
    /// prefill instead of a decode retry.
    pub fn requires_new_prefill(&self) -> bool {
        matches!(
            self,
            DisaggError::HandleMismatch(_)
                | DisaggError::HandleExpired
                | DisaggError::EngineRejection {
                    kind: RejectionKind::HandleMismatch,
                    ..
                }
        )
    }
}

/// Stable, caller visible classification of a terminal failure.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCode {
    PrefillFailed,
    /// Prefill succeeded, so the remote engine may still hold the cache region.
    DecodeFailedAfterPrefill,
    NoEligibleEngine,
    AdmissionRejected,
    Cancelled,
    InvalidRequest,
    /// Another request with the same caller supplied id is still in flight.
    DuplicateRequestId,
    TokenizerFailed,
}

impl ErrorCode {
    /// Whether the failure may have left an orphaned cache region behind.
    pub fn needs_reclamation(&self) -> bool {
        matches!(self, ErrorCode::DecodeFailedAfterPrefill)
    }
}

/// Terminal failure of one request, as returned by the coordinator.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code} during {phase}: {source}")]
pub struct RequestError {
    pub request_id: String,
    pub phase: RequestPhase,
    pub code: ErrorCode,
    #[source]
    pub source: DisaggError,
}

impl RequestError {
    pub fn new(
        request_id: impl Into<String>,
        phase: RequestPhase,
        code: ErrorCode,
        source: DisaggError,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            phase,
            code,
            source,
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: ErrorDetail {
                code: self.code,
                phase: self.phase,
                request_id: self.request_id.clone(),
                message: self.source.to_string(),
            },
        }
    }
}

/// JSON error body returned to HTTP callers and appended to truncated streams.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub code: ErrorCode,
    pub phase: RequestPhase,
    pub request_id: String,
    pub message: String,
}

/// Illegal request lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal lifecycle transition {from} -> {to}")]
pub struct LifecycleError {
    pub from: crate::coordinator::RequestState,
    pub to: crate::coordinator::RequestState,
}

/// A stats record that could not be ingested. Only the offending record is
/// dropped.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("malformed stats record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("stats record has an empty engine_id")]
    MissingEngineId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable_strings() {
        assert_eq!(
            ErrorCode::DecodeFailedAfterPrefill.to_string(),
            "decode_failed_after_prefill"
        );
        assert_eq!(ErrorCode::PrefillFailed.as_ref(), "prefill_failed");
        assert_eq!(
            serde_json::to_value(ErrorCode::NoEligibleEngine).unwrap(),
            "no_eligible_engine"
        );
        assert!(ErrorCode::DecodeFailedAfterPrefill.needs_reclamation());
        assert!(!ErrorCode::PrefillFailed.needs_reclamation());
        assert_eq!(ErrorCode::DuplicateRequestId.as_ref(), "duplicate_request_id");
    }

    #[test]
    fn test_reclaimed_handle_forces_new_prefill() {
        assert!(DisaggError::HandleExpired.requires_new_prefill());
        assert!(!DisaggError::DuplicateRequestId("r1".into()).requires_new_prefill());
        assert!(!DisaggError::NoEligibleEngine.requires_new_prefill());
    }

    #[test]
    fn test_handle_mismatch_forces_new_prefill() {
        let err = DisaggError::EngineRejection {
            engine: EngineId::from("d0"),
            kind: RejectionKind::HandleMismatch,
            status: 422,
            message: "blocks".into(),
        };
        assert!(err.requires_new_prefill());
        assert!(!err.is_transient());

        let err = DisaggError::EngineRejection {
            engine: EngineId::from("d0"),
            kind: RejectionKind::CacheExhausted,
            status: 507,
            message: "full".into(),
        };
        assert!(!err.requires_new_prefill());
    }

    #[test]
    fn test_request_error_body() {
        let err = RequestError::new(
            "pool-1",
            RequestPhase::Prefill,
            ErrorCode::PrefillFailed,
            DisaggError::Cancelled,
        );
        let body = serde_json::to_value(err.body()).unwrap();
        assert_eq!(body["error"]["code"], "prefill_failed");
        assert_eq!(body["error"]["phase"], "prefill");
        assert_eq!(body["error"]["request_id"], "pool-1");
    }
}
