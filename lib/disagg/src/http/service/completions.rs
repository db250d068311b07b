// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! `POST /v1/completions`
//!
//! The body is an OpenAI style completion request. Non-streaming requests get
//! the decode engine's JSON body back unchanged. Streaming requests get the
//! decode engine's SSE chunks relayed as they arrive; a failure after the first
//! chunk ends the stream with `data: {"error": ...}` instead of a silent cut.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Router,
    body::{Body, Bytes},
    extract::State as AxumState,
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{RouteDoc, State};
use crate::coordinator::CompletionResponse;
use crate::engine_client::REQUEST_ID_HEADER;
use crate::error::{DisaggError, ErrorCode, RequestError};
use crate::protocols::{CompletionRequest, RequestPhase};

/// Non-standard "client closed request".
const CLIENT_CLOSED_REQUEST: u16 = 499;

pub fn completions_router(state: Arc<State>, path: Option<String>) -> (Vec<RouteDoc>, Router) {
    let path = path.unwrap_or_else(|| "/v1/completions".to_string());
    let docs = vec![RouteDoc::new(Method::POST, &path)];
    let router = Router::new()
        .route(&path, post(handler_completions))
        .with_state(state);
    (docs, router)
}

async fn handler_completions(
    AxumState(state): AxumState<Arc<State>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let coordinator = state.coordinator();
    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| coordinator.next_request_id());

    let request: CompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            let err = RequestError::new(
                request_id,
                RequestPhase::Admission,
                ErrorCode::InvalidRequest,
                DisaggError::InvalidRequest(err.to_string()),
            );
            return error_response(&err);
        }
    };

    // the request runs on its own task so that a client going away cancels it
    // through the token instead of dropping in-flight engine calls
    let cancel = CancellationToken::new();
    let drop_guard = cancel.clone().drop_guard();
    let task = {
        let coordinator = coordinator.clone();
        let request_id = request_id.clone();
        tokio::spawn(
            async move {
                coordinator
                    .handle_request(request, Some(request_id), cancel)
                    .await
            }
            .in_current_span(),
        )
    };
    let result = task.await;
    drop_guard.disarm();

    let result = match result {
        Ok(result) => result,
        Err(err) => {
            tracing::error!(request_id, error = %err, "request task failed");
            return with_request_id(
                StatusCode::INTERNAL_SERVER_ERROR.into_response(),
                &request_id,
            );
        }
    };

    match result {
        Ok(CompletionResponse::Unary(body)) => with_request_id(
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                body,
            )
                .into_response(),
            &request_id,
        ),
        Ok(CompletionResponse::Stream(stream)) => {
            let body = Body::from_stream(stream.map(|item| {
                Ok::<Bytes, Infallible>(match item {
                    Ok(bytes) => bytes,
                    Err(err) => error_chunk(&err),
                })
            }));
            with_request_id(
                (
                    StatusCode::OK,
                    [
                        (header::CONTENT_TYPE, "text/event-stream"),
                        (header::CACHE_CONTROL, "no-cache"),
                    ],
                    body,
                )
                    .into_response(),
                &request_id,
            )
        }
        Err(err) => error_response(&err),
    }
}

pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NoEligibleEngine | ErrorCode::AdmissionRejected => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorCode::PrefillFailed | ErrorCode::DecodeFailedAfterPrefill => StatusCode::BAD_GATEWAY,
        ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorCode::DuplicateRequestId => StatusCode::CONFLICT,
        ErrorCode::Cancelled => {
            StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
        }
        ErrorCode::TokenizerFailed => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn error_response(err: &RequestError) -> Response {
    with_request_id(
        (status_for(err.code), axum::Json(err.body())).into_response(),
        &err.request_id,
    )
}

/// Trailing SSE event for a stream that broke after output was sent.
pub fn error_chunk(err: &RequestError) -> Bytes {
    let payload = serde_json::to_string(&err.body()).unwrap_or_default();
    Bytes::from(format!("data: {payload}\n\n"))
}

fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ErrorCode::NoEligibleEngine, 503)]
    #[case(ErrorCode::AdmissionRejected, 503)]
    #[case(ErrorCode::PrefillFailed, 502)]
    #[case(ErrorCode::DecodeFailedAfterPrefill, 502)]
    #[case(ErrorCode::InvalidRequest, 400)]
    #[case(ErrorCode::DuplicateRequestId, 409)]
    #[case(ErrorCode::Cancelled, 499)]
    fn test_status_mapping(#[case] code: ErrorCode, #[case] status: u16) {
        assert_eq!(status_for(code).as_u16(), status);
    }

    #[test]
    fn test_error_chunk_is_sse_event() {
        let err = RequestError::new(
            "r1",
            RequestPhase::Decode,
            ErrorCode::DecodeFailedAfterPrefill,
            DisaggError::Cancelled,
        );
        let chunk = error_chunk(&err);
        let text = std::str::from_utf8(&chunk).unwrap();
        assert!(text.starts_with("data: {\"error\":"));
        assert!(text.ends_with("\n\n"));
        assert!(text.contains("decode_failed_after_prefill"));
    }
}
