// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tokenizer collaborator.
//!
//! The coordinator only needs token counts (to check the block count declared
//! by a handle) and, in mock PD mode, a block-aligned prefix of the prompt.

use std::path::Path;

use tokenizers::tokenizer::Tokenizer as HfTokenizer;

use crate::error::DisaggError;
use crate::protocols::{Token, truncate_to_blocks};

pub type Result<T> = std::result::Result<T, DisaggError>;

pub trait Tokenizer: Send + Sync {
    fn encode(&self, input: &str) -> Result<Vec<Token>>;

    fn decode(&self, token_ids: &[Token]) -> Result<String>;

    fn token_count(&self, input: &str) -> Result<usize> {
        Ok(self.encode(input)?.len())
    }
}

/// The prompt cut down to whole cache blocks, plus its token count.
///
/// Returns the original prompt untouched when it fills no complete block.
pub fn block_aligned_prompt(
    tokenizer: &dyn Tokenizer,
    prompt: &str,
    block_size: u32,
) -> Result<(String, usize)> {
    let tokens = tokenizer.encode(prompt)?;
    let prefix = truncate_to_blocks(&tokens, block_size);
    if prefix.is_empty() {
        return Ok((prompt.to_string(), tokens.len()));
    }
    if prefix.len() == tokens.len() {
        return Ok((prompt.to_string(), tokens.len()));
    }
    Ok((tokenizer.decode(prefix)?, tokens.len()))
}

pub struct HuggingFaceTokenizer {
    tokenizer: HfTokenizer,
}

impl HuggingFaceTokenizer {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let tokenizer = HfTokenizer::from_file(path.as_ref())
            .map_err(|err| DisaggError::Tokenizer(format!("Error loading tokenizer: {err}")))?;

        Ok(HuggingFaceTokenizer { tokenizer })
    }
}

impl Tokenizer for HuggingFaceTokenizer {
    fn encode(&self, input: &str) -> Result<Vec<Token>> {
        let encoding = self
            .tokenizer
            .encode(input, false)
            .map_err(|err| DisaggError::Tokenizer(format!("Error tokenizing input: {err}")))?;

        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, token_ids: &[Token]) -> Result<String> {
        self.tokenizer
            .decode(token_ids, false)
            .map_err(|err| DisaggError::Tokenizer(format!("Error de-tokenizing input: {err}")))
    }
}

impl From<HfTokenizer> for HuggingFaceTokenizer {
    fn from(tokenizer: HfTokenizer) -> Self {
        HuggingFaceTokenizer { tokenizer }
    }
}
