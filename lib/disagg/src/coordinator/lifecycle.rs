// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Request lifecycle state machine.
//!
//! ```text
//! CREATED -> PREFILLING -> HANDLE_RECEIVED -> DECODING -> COMPLETED
//!                ^               ^   |            |
//!                |               |   +------------+  (decode retry)
//!                +---------------+-------------------  (restart from prefill)
//! any non-terminal state -> FAILED | ABORTED
//! ```

use std::time::Instant;

use serde::Serialize;

use crate::error::LifecycleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Created,
    Prefilling,
    HandleReceived,
    Decoding,
    Completed,
    Failed,
    Aborted,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Aborted
        )
    }

    pub fn can_transition_to(&self, next: RequestState) -> bool {
        use RequestState::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Failed | Aborted)
                | (Created, Prefilling)
                | (Prefilling, HandleReceived)
                | (HandleReceived, Decoding)
                | (HandleReceived, Prefilling)
                | (Decoding, Completed)
                | (Decoding, HandleReceived)
                | (Decoding, Prefilling)
        )
    }
}

/// One request as owned by the coordinator for its whole duration.
#[derive(Debug, Clone)]
pub struct Request {
    pub request_id: String,
    pub prompt: String,
    pub max_output_tokens: u32,
    pub arrival_time: Instant,
    state: RequestState,
}

impl Request {
    pub fn new(request_id: impl Into<String>, prompt: impl Into<String>, max_output_tokens: u32) -> Self {
        Self {
            request_id: request_id.into(),
            prompt: prompt.into(),
            max_output_tokens,
            arrival_time: Instant::now(),
            state: RequestState::Created,
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn transition(&mut self, next: RequestState) -> Result<(), LifecycleError> {
        if !self.state.can_transition_to(next) {
            return Err(LifecycleError {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(
            request_id = %self.request_id,
            from = %self.state,
            to = %next,
            "request state transition"
        );
        self.state = next;
        Ok(())
    }
}
