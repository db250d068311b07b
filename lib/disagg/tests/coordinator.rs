// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use common::{BLOCK_SIZE, NumberTokenizer, harness, harness_with_tokenizer, prompt, settings};
use dynamo_disagg::config::ProxyMode;
use dynamo_disagg::coordinator::CompletionResponse;
use dynamo_disagg::engine_client::{CallKind, MockResponse};
use dynamo_disagg::error::ErrorCode;
use dynamo_disagg::protocols::{CompletionRequest, EngineId, RequestPhase};

fn request(words: usize) -> CompletionRequest {
    CompletionRequest::new(prompt(words), 8)
}

fn streaming_request(words: usize) -> CompletionRequest {
    let mut request = request(words);
    request.extra.insert("stream".to_string(), Value::Bool(true));
    request
}

fn prefill_reply(engine: &str, prompt_tokens: usize) -> Value {
    let blocks = (prompt_tokens / BLOCK_SIZE as usize) as u64;
    json!({
        "usage": {"prompt_tokens": prompt_tokens},
        "kv_transfer_params": {
            "do_remote_prefill": true,
            "do_remote_decode": false,
            "remote_engine_id": engine,
            "remote_block_ids": (0..blocks).collect::<Vec<_>>(),
            "remote_host": "10.0.0.1",
            "remote_port": 8100,
            "remote_tp_size": 1,
        },
    })
}

#[tokio::test]
async fn test_two_phase_request_carries_handle_to_decode() {
    let h = harness(settings());
    h.report("d0", 0);
    h.report("d1", 0);

    let response = h
        .coordinator
        .handle_request(request(9), Some("r1".into()), CancellationToken::new())
        .await
        .unwrap();
    let CompletionResponse::Unary(body) = response else {
        panic!("expected a unary response");
    };
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["choices"][0]["text"], "Hello, world");

    let prefill = h.transport.calls_for("r1", CallKind::Prefill);
    assert_eq!(prefill.len(), 1);
    let prefill_payload = prefill[0].payload.as_ref().unwrap();
    assert_eq!(prefill_payload["max_tokens"], 1);
    assert_eq!(prefill_payload["stream"], false);

    let decode = h.transport.calls_for("r1", CallKind::Decode);
    assert_eq!(decode.len(), 1);
    let handle = decode[0].handle().unwrap();
    assert_eq!(handle.remote_engine_id, Some(EngineId::from("p0")));
    assert_eq!(handle.block_count(), 2);
    assert_eq!(decode[0].payload.as_ref().unwrap()["max_tokens"], 8);
    assert!(h.coordinator.handles().is_empty());
}

#[tokio::test]
async fn test_decode_goes_to_engine_with_less_cache() {
    let h = harness(settings());
    h.report("d0", 100);
    h.report("d1", 50);

    h.coordinator
        .handle_request(request(8), Some("r1".into()), CancellationToken::new())
        .await
        .unwrap();

    let decode = h.transport.calls_for("r1", CallKind::Decode);
    assert_eq!(decode.len(), 1);
    assert_eq!(decode[0].engine_id, EngineId::from("d1"));
}

#[tokio::test]
async fn test_prefill_failure_never_reaches_decode() {
    let h = harness(settings());
    h.report("d0", 0);
    h.transport
        .push("p0", MockResponse::status(500, json!({"error": "boom"})));

    let err = h
        .coordinator
        .handle_request(request(8), Some("r1".into()), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::PrefillFailed);
    assert_eq!(err.phase, RequestPhase::Prefill);
    assert!(h.transport.calls_for("r1", CallKind::Decode).is_empty());
    assert!(h.metrics_text().contains("prefill_failed"));
}

#[tokio::test]
async fn test_transient_prefill_failure_is_retried_in_place() {
    let mut settings = settings();
    settings.retry.max_retries = 2;
    let h = harness(settings);
    h.report("d0", 0);
    h.transport.push("p0", MockResponse::ConnectError);
    h.transport.push("p0", MockResponse::ConnectError);

    h.coordinator
        .handle_request(request(8), Some("r1".into()), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(h.transport.calls_for("r1", CallKind::Prefill).len(), 3);
    assert_eq!(h.transport.calls_for("r1", CallKind::Decode).len(), 1);
}

#[tokio::test]
async fn test_no_fresh_stats_is_a_capacity_error() {
    let h = harness(settings());

    let err = h
        .coordinator
        .handle_request(request(8), None, CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::NoEligibleEngine);
    assert!(err.request_id.starts_with("it-"));
    assert!(h.transport.calls().is_empty());
}

#[tokio::test]
async fn test_rejected_decode_is_retried_on_another_engine() {
    let h = harness(settings());
    h.report("d0", 0);
    h.report("d1", 10);
    h.transport.push(
        "d0",
        MockResponse::status(507, json!({"error": {"type": "cache_exhausted"}})),
    );

    h.coordinator
        .handle_request(request(8), Some("r1".into()), CancellationToken::new())
        .await
        .unwrap();

    let decode = h.transport.calls_for("r1", CallKind::Decode);
    assert_eq!(decode.len(), 2);
    assert_eq!(decode[0].engine_id, EngineId::from("d0"));
    assert_eq!(decode[1].engine_id, EngineId::from("d1"));
    // the same handle is reused, no second prefill
    assert_eq!(decode[0].handle(), decode[1].handle());
    assert_eq!(h.transport.calls_for("r1", CallKind::Prefill).len(), 1);
    assert!(
        h.metrics_text()
            .contains("disagg_decode_reselections_total 1")
    );
}

#[tokio::test]
async fn test_decode_exhaustion_flags_handle_for_reclamation() {
    let h = harness(settings());
    h.report("d0", 0);
    h.report("d1", 0);
    h.transport
        .push("d0", MockResponse::status(500, json!({"error": "down"})));
    h.transport
        .push("d1", MockResponse::status(500, json!({"error": "down"})));

    let err = h
        .coordinator
        .handle_request(request(8), Some("r1".into()), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::DecodeFailedAfterPrefill);
    assert_eq!(err.phase, RequestPhase::Decode);
    assert!(err.code.needs_reclamation());
    assert_eq!(h.transport.calls_for("r1", CallKind::Decode).len(), 2);
    assert_eq!(h.coordinator.ledger().pending(&EngineId::from("p0")), 1);

    // the orphaned region is reported with the next handle sent to p0
    h.coordinator
        .handle_request(request(8), Some("r2".into()), CancellationToken::new())
        .await
        .unwrap();
    let stub = h.transport.calls_for("r2", CallKind::Prefill)[0]
        .handle()
        .unwrap();
    assert!(stub.aborted_request_ids.contains("r1"));
    assert_eq!(h.coordinator.ledger().pending(&EngineId::from("p0")), 0);
}

#[tokio::test]
async fn test_cancel_between_phases_reports_abort_to_prefill_engine() {
    let h = harness(settings());
    h.report("d0", 0);

    let cancel = CancellationToken::new();
    let hook_token = cancel.clone();
    h.transport.push(
        "p0",
        MockResponse::with_hook(
            move || hook_token.cancel(),
            MockResponse::json(prefill_reply("p0", 8)),
        ),
    );

    let err = h
        .coordinator
        .handle_request(request(8), Some("r1".into()), cancel)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Cancelled);
    assert!(h.transport.calls_for("r1", CallKind::Decode).is_empty());

    h.coordinator
        .handle_request(request(8), Some("r2".into()), CancellationToken::new())
        .await
        .unwrap();
    let stub = h.transport.calls_for("r2", CallKind::Prefill)[0]
        .handle()
        .unwrap();
    assert_eq!(
        stub.aborted_request_ids.iter().collect::<Vec<_>>(),
        vec!["r1"]
    );
    assert!(h.metrics_text().contains("status=\"aborted\""));
}

#[tokio::test]
async fn test_expired_handle_restarts_from_prefill() {
    let mut settings = settings();
    settings.coordinator.handle_validity_window = Duration::from_millis(1);
    let h = harness(settings);
    h.report("d0", 0);
    h.report("d1", 10);
    h.transport.push(
        "d0",
        MockResponse::delayed(
            Duration::from_millis(20),
            MockResponse::status(503, json!({"error": "busy"})),
        ),
    );

    h.coordinator
        .handle_request(request(8), Some("r1".into()), CancellationToken::new())
        .await
        .unwrap();

    let prefill = h.transport.calls_for("r1", CallKind::Prefill);
    assert_eq!(prefill.len(), 2);
    assert!(
        prefill[1]
            .handle()
            .unwrap()
            .aborted_request_ids
            .contains("r1")
    );
    let decode = h.transport.calls_for("r1", CallKind::Decode);
    assert_eq!(decode.len(), 2);
    assert_eq!(decode[1].engine_id, EngineId::from("d1"));
    assert!(h.metrics_text().contains("disagg_prefill_restarts_total 1"));
}

#[tokio::test]
async fn test_decode_handle_mismatch_restarts_from_prefill() {
    let h = harness(settings());
    h.report("d0", 0);
    h.transport.push(
        "d0",
        MockResponse::status(422, json!({"error": {"code": "handle_mismatch"}})),
    );

    h.coordinator
        .handle_request(request(8), Some("r1".into()), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(h.transport.calls_for("r1", CallKind::Prefill).len(), 2);
    // a mismatch is not the engine's fault, d0 stays eligible
    let decode = h.transport.calls_for("r1", CallKind::Decode);
    assert_eq!(decode.len(), 2);
    assert!(decode.iter().all(|c| c.engine_id == EngineId::from("d0")));
}

#[tokio::test]
async fn test_streaming_relays_chunks_in_order() {
    let h = harness(settings());
    h.report("d0", 0);

    let response = h
        .coordinator
        .handle_request(streaming_request(8), Some("r1".into()), CancellationToken::new())
        .await
        .unwrap();
    let CompletionResponse::Stream(stream) = response else {
        panic!("expected a stream");
    };
    let chunks: Vec<_> = stream.collect().await;
    assert_eq!(chunks.len(), 4);
    let text: String = chunks
        .into_iter()
        .map(|c| String::from_utf8(c.unwrap().to_vec()).unwrap())
        .collect();
    assert!(text.contains("Hello"));
    assert!(text.ends_with("data: [DONE]\n\n"));
    assert!(h.metrics_text().contains("status=\"success\""));
}

#[tokio::test]
async fn test_mid_stream_failure_ends_with_error_item() {
    let h = harness(settings());
    h.report("d0", 0);
    h.transport.push(
        "d0",
        MockResponse::StreamError {
            chunks: vec![bytes::Bytes::from_static(b"data: {\"text\":\"Hi\"}\n\n")],
            message: "engine died".to_string(),
        },
    );

    let response = h
        .coordinator
        .handle_request(streaming_request(8), Some("r1".into()), CancellationToken::new())
        .await
        .unwrap();
    let CompletionResponse::Stream(mut stream) = response else {
        panic!("expected a stream");
    };
    assert!(stream.next().await.unwrap().is_ok());
    let err = stream.next().await.unwrap().unwrap_err();
    assert_eq!(err.code, ErrorCode::DecodeFailedAfterPrefill);
    assert_eq!(err.request_id, "r1");
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_mock_pd_synthesizes_handle_without_prefill() {
    let mut settings = settings();
    settings.mode = ProxyMode::MockPd;
    settings.prefill_engines.clear();
    let h = harness_with_tokenizer(settings, Some(Arc::new(NumberTokenizer)));
    h.report("d0", 0);
    h.report("d1", 10);

    h.coordinator
        .handle_request(
            CompletionRequest::new("10 11 12 13 14 15 16 17 18 19", 8),
            Some("r1".into()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(h.transport.calls_for("r1", CallKind::Prefill).is_empty());
    let decode = h.transport.calls_for("r1", CallKind::Decode);
    assert_eq!(decode.len(), 1);
    assert_eq!(decode[0].engine_id, EngineId::from("d0"));

    let payload = decode[0].payload.as_ref().unwrap();
    assert_eq!(payload["prompt"], "10 11 12 13 14 15 16 17");
    let handle = decode[0].handle().unwrap();
    assert!(handle.do_remote_prefill);
    assert!(!handle.do_remote_decode);
    assert_eq!(handle.remote_engine_id, Some(EngineId::from("0")));
    assert_eq!(handle.block_ids(), &[1, 2]);
    assert_eq!(handle.remote_host.as_deref(), Some("10.0.1.1"));
    assert_eq!(handle.remote_port, Some(8200));
}

#[tokio::test]
async fn test_mock_pd_short_prompt_is_untouched() {
    let mut settings = settings();
    settings.mode = ProxyMode::MockPd;
    let h = harness_with_tokenizer(settings, Some(Arc::new(NumberTokenizer)));
    h.report("d0", 0);

    h.coordinator
        .handle_request(
            CompletionRequest::new("7 8 9", 8),
            Some("r1".into()),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let decode = h.transport.calls_for("r1", CallKind::Decode);
    assert_eq!(decode[0].payload.as_ref().unwrap()["prompt"], "7 8 9");
    assert_eq!(decode[0].handle().unwrap().block_count(), 0);
}

#[tokio::test]
async fn test_every_engine_call_carries_request_id() {
    let h = harness(settings());
    h.report("d0", 0);

    h.coordinator
        .handle_request(request(4), Some("corr-42".into()), CancellationToken::new())
        .await
        .unwrap();
    let calls = h.transport.calls();
    assert_eq!(calls.len(), 2);
    assert!(
        calls
            .iter()
            .all(|c| c.request_id.as_deref() == Some("corr-42"))
    );
}

#[tokio::test]
async fn test_engine_token_count_wins_over_tokenizer() {
    // the engine counts a BOS token the local tokenizer does not, which
    // pushes the prompt across a block boundary
    let h = harness_with_tokenizer(settings(), Some(Arc::new(NumberTokenizer)));
    h.report("d0", 0);
    h.transport
        .push("p0", MockResponse::json(prefill_reply("p0", 8)));

    h.coordinator
        .handle_request(
            CompletionRequest::new("1 2 3 4 5 6 7", 8),
            Some("r1".into()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(h.transport.calls_for("r1", CallKind::Prefill).len(), 1);
    let decode = h.transport.calls_for("r1", CallKind::Decode);
    assert_eq!(decode.len(), 1);
    assert_eq!(decode[0].handle().unwrap().block_count(), 2);
    assert!(!h.metrics_text().contains("disagg_prefill_restarts_total 1"));
}

#[tokio::test]
async fn test_repeated_handle_mismatch_is_terminal() {
    let mut settings = settings();
    settings.coordinator.max_prefill_attempts = 3;
    let h = harness(settings);
    h.report("d0", 0);

    let mut reply = prefill_reply("p0", 8);
    reply["kv_transfer_params"]["remote_block_ids"] = json!([0, 1, 2, 3, 4]);
    h.transport.push("p0", MockResponse::json(reply.clone()));
    h.transport.push("p0", MockResponse::json(reply));

    let err = h
        .coordinator
        .handle_request(request(8), Some("r1".into()), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::PrefillFailed);
    assert_eq!(err.phase, RequestPhase::Prefill);
    assert_eq!(h.transport.calls_for("r1", CallKind::Prefill).len(), 2);
    assert!(h.transport.calls_for("r1", CallKind::Decode).is_empty());
}

#[tokio::test]
async fn test_reclaimer_leaves_handle_under_decode() {
    let mut settings = settings();
    settings.coordinator.reclaim_timeout = Duration::from_millis(20);
    let h = harness(settings);
    h.report("d0", 0);
    h.transport.push(
        "d0",
        MockResponse::delayed(
            Duration::from_millis(100),
            MockResponse::json(json!({"choices": [{"index": 0, "text": "late"}]})),
        ),
    );

    let coordinator = h.coordinator.clone();
    let task = tokio::spawn(async move {
        coordinator
            .handle_request(request(8), Some("r1".into()), CancellationToken::new())
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.coordinator.handles().len(), 1);
    assert_eq!(h.coordinator.reclaim_expired(Instant::now()), 0);

    task.await.unwrap().unwrap();
    assert!(h.coordinator.handles().is_empty());
    assert_eq!(h.coordinator.ledger().pending(&EngineId::from("p0")), 0);
    assert!(!h.metrics_text().contains("disagg_reclaimed_handles_total 1"));
}

#[tokio::test]
async fn test_duplicate_request_id_is_refused_while_in_flight() {
    let h = harness(settings());
    h.report("d0", 0);
    h.transport.push(
        "d0",
        MockResponse::delayed(
            Duration::from_millis(100),
            MockResponse::json(json!({"choices": [{"index": 0, "text": "first"}]})),
        ),
    );

    let coordinator = h.coordinator.clone();
    let first = tokio::spawn(async move {
        coordinator
            .handle_request(request(8), Some("dup".into()), CancellationToken::new())
            .await
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    let err = h
        .coordinator
        .handle_request(request(8), Some("dup".into()), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::DuplicateRequestId);
    assert_eq!(err.phase, RequestPhase::Admission);
    // the refused request never touched the first one's handle
    assert_eq!(h.coordinator.handles().len(), 1);

    first.await.unwrap().unwrap();
    assert!(h.coordinator.handles().is_empty());
    assert!(h.coordinator.request_ids().is_empty());
    assert_eq!(h.coordinator.ledger().total_pending(), 0);

    // the id is free again once the first request settled
    h.coordinator
        .handle_request(request(8), Some("dup".into()), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(h.transport.calls_for("dup", CallKind::Prefill).len(), 2);
}

#[tokio::test]
async fn test_stream_setup_failure_records_decode_duration() {
    let h = harness(settings());
    h.report("d0", 0);
    h.transport
        .push("d0", MockResponse::status(500, json!({"error": "down"})));

    let err = match h
        .coordinator
        .handle_request(streaming_request(8), Some("r1".into()), CancellationToken::new())
        .await
    {
        Err(err) => err,
        Ok(_) => panic!("expected the stream setup to fail"),
    };
    assert_eq!(err.code, ErrorCode::DecodeFailedAfterPrefill);
    assert!(
        h.metrics_text()
            .contains("disagg_phase_duration_seconds_count{phase=\"decode\"} 1")
    );
}
