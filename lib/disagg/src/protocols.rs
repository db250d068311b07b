// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wire and in-memory types exchanged between the proxy, prefill engines and
//! decode engines.
//!
//! The shapes here follow the `kv_transfer_params` contract used by vLLM style
//! engines: a prefill engine receives a stub with `do_remote_decode = true`
//! and answers with a populated handle which is then attached, unchanged
//! except for `aborted_request`, to the decode call.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Token identifier produced by the tokenizer collaborator.
pub type Token = u32;

/// Block size observed on deployed engines, in tokens per block.
pub const DEFAULT_BLOCK_SIZE: u32 = 128;

/// Default `max_tokens` when a client omits it (OpenAI completions default).
pub const DEFAULT_MAX_TOKENS: u32 = 16;

/// Opaque identity of one engine instance within a pool.
///
/// Engines report either strings or integers on the wire; both are accepted and
/// normalised to a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EngineId(String);

impl EngineId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EngineId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EngineId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawEngineId {
    Text(String),
    Number(u64),
}

impl From<RawEngineId> for EngineId {
    fn from(raw: RawEngineId) -> Self {
        match raw {
            RawEngineId::Text(s) => EngineId(s),
            RawEngineId::Number(n) => EngineId(n.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for EngineId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        RawEngineId::deserialize(deserializer).map(EngineId::from)
    }
}

/// Load snapshot of one engine, produced by the engine runtime.
///
/// `observed_at` is the engine's own monotonic clock. It orders records from the
/// same engine and is never compared across engines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub engine_id: EngineId,
    pub waiting_queue_length: u64,
    pub running_queue_length: u64,
    pub kv_cache_tokens_used: u64,
    pub observed_at: u64,
}

impl EngineStats {
    pub fn new(
        engine_id: impl Into<EngineId>,
        waiting_queue_length: u64,
        running_queue_length: u64,
        kv_cache_tokens_used: u64,
        observed_at: u64,
    ) -> Self {
        Self {
            engine_id: engine_id.into(),
            waiting_queue_length,
            running_queue_length,
            kv_cache_tokens_used,
            observed_at,
        }
    }
}

/// Which half of the two-phase request a call or failure belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RequestPhase {
    Admission,
    Prefill,
    Decode,
}

/// Problems detected while checking a [`KvTransferParams`] against a prompt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandleError {
    #[error("handle declares {declared} blocks but the prompt fills {expected}")]
    BlockCountMismatch { declared: usize, expected: usize },

    #[error("handle repeats block id {0}")]
    DuplicateBlockId(u64),

    #[error("remote_tp_size must be positive")]
    InvalidTpSize,

    #[error("handle is missing remote_engine_id")]
    MissingRemoteEngine,
}

fn default_tp_size() -> u32 {
    1
}

fn deserialize_optional_engine_id<'de, D>(deserializer: D) -> Result<Option<EngineId>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RawEngineId>::deserialize(deserializer)?.map(EngineId::from))
}

/// Cache Transfer Handle: locates the KV cache region written by a prefill
/// engine so that a decode engine can pull it instead of recomputing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvTransferParams {
    pub do_remote_prefill: bool,
    pub do_remote_decode: bool,
    #[serde(default, deserialize_with = "deserialize_optional_engine_id")]
    pub remote_engine_id: Option<EngineId>,
    #[serde(default)]
    pub remote_block_ids: Option<Vec<u64>>,
    #[serde(default)]
    pub remote_host: Option<String>,
    #[serde(default)]
    pub remote_port: Option<u16>,
    #[serde(default = "default_tp_size")]
    pub remote_tp_size: u32,
    #[serde(default, rename = "aborted_request")]
    pub aborted_request_ids: BTreeSet<String>,
}

impl KvTransferParams {
    /// Stub sent with the prefill call: the prefill engine fills in the remote
    /// fields and returns the populated handle.
    pub fn prefill_stub() -> Self {
        Self {
            do_remote_prefill: false,
            do_remote_decode: true,
            remote_engine_id: None,
            remote_block_ids: None,
            remote_host: None,
            remote_port: None,
            remote_tp_size: default_tp_size(),
            aborted_request_ids: BTreeSet::new(),
        }
    }

    /// Handle built by the proxy itself when no prefill engine is involved.
    ///
    /// Block ids are `1..=num_blocks`; the cache is addressed at the decode
    /// engine's own host and port.
    pub fn synthesized(
        prompt_token_count: usize,
        block_size: u32,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        let num_blocks = block_count(prompt_token_count, block_size) as u64;
        Self {
            do_remote_prefill: true,
            do_remote_decode: false,
            remote_engine_id: Some(EngineId::from("0")),
            remote_block_ids: Some((1..=num_blocks).collect()),
            remote_host: Some(remote_host.into()),
            remote_port: Some(remote_port),
            remote_tp_size: 1,
            aborted_request_ids: BTreeSet::new(),
        }
    }

    pub fn block_ids(&self) -> &[u64] {
        self.remote_block_ids.as_deref().unwrap_or_default()
    }

    pub fn block_count(&self) -> usize {
        self.block_ids().len()
    }

    /// Structural checks that do not depend on the prompt.
    pub fn validate(&self) -> Result<(), HandleError> {
        if self.remote_tp_size == 0 {
            return Err(HandleError::InvalidTpSize);
        }
        let mut seen = BTreeSet::new();
        for id in self.block_ids() {
            if !seen.insert(*id) {
                return Err(HandleError::DuplicateBlockId(*id));
            }
        }
        Ok(())
    }

    /// Checks that the declared block count is exactly what the prompt fills.
    pub fn validate_for_prompt(
        &self,
        prompt_token_count: usize,
        block_size: u32,
    ) -> Result<(), HandleError> {
        self.validate()?;
        let expected = block_count(prompt_token_count, block_size);
        let declared = self.block_count();
        if declared != expected {
            return Err(HandleError::BlockCountMismatch { declared, expected });
        }
        Ok(())
    }

    pub fn add_aborted<I>(&mut self, request_ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.aborted_request_ids.extend(request_ids);
    }
}

/// Number of full cache blocks covered by `token_count` tokens.
///
/// A remainder shorter than one block is not transferred and must be
/// recomputed by the decode engine.
pub fn block_count(token_count: usize, block_size: u32) -> usize {
    match block_size {
        0 => 0,
        size => token_count / size as usize,
    }
}

/// The block-aligned prefix of `tokens`, i.e. the part represented in a handle.
pub fn truncate_to_blocks(tokens: &[Token], block_size: u32) -> &[Token] {
    let len = block_count(tokens.len(), block_size) * block_size as usize;
    &tokens[..len]
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

/// Completion request as received from clients and forwarded to engines.
///
/// Fields the proxy does not interpret (`model`, `temperature`, `stream`, ...)
/// are carried through untouched in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kv_transfer_params: Option<KvTransferParams>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens,
            kv_transfer_params: None,
            extra: Map::new(),
        }
    }

    pub fn is_stream(&self) -> bool {
        self.extra
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Payload for the prefill phase: one output token, no streaming, and the
    /// given handle stub.
    pub fn for_prefill(&self, max_tokens: u32, stub: KvTransferParams) -> Self {
        let mut req = self.clone();
        req.max_tokens = max_tokens;
        req.kv_transfer_params = Some(stub);
        req.extra.insert("stream".to_string(), Value::Bool(false));
        req.extra.remove("stream_options");
        req
    }

    /// Payload for the decode phase: the original request plus the handle.
    pub fn for_decode(&self, handle: KvTransferParams) -> Self {
        let mut req = self.clone();
        req.kv_transfer_params = Some(handle);
        req
    }
}

/// The part of a prefill engine's completion payload the proxy reads.
#[derive(Debug, Clone, Deserialize)]
pub struct PrefillResponse {
    #[serde(default)]
    pub kv_transfer_params: Option<KvTransferParams>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
}
