// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bookkeeping shared by all requests of one coordinator: aborted request ids
//! waiting to be piggybacked on the next handle, handles not yet consumed by a
//! decode, decode dispatches not yet reflected in engine stats, and the
//! request ids currently in flight.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::{DashMap, mapref::entry::Entry};

use crate::protocols::EngineId;

/// Request ids whose cache region may be orphaned on a remote engine.
///
/// Ids are drained into the `aborted_request` field of the next handle sent
/// to that engine, so the engine can free the region early.
#[derive(Debug, Default)]
pub struct AbortLedger {
    entries: DashMap<EngineId, BTreeSet<String>>,
}

impl AbortLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, remote: &EngineId, request_id: impl Into<String>) {
        let request_id = request_id.into();
        tracing::debug!(remote_engine_id = %remote, request_id, "recording aborted request");
        self.entries
            .entry(remote.clone())
            .or_default()
            .insert(request_id);
    }

    /// Take every pending id for `remote`. The caller owns them until they are
    /// delivered, or hands them back with [`AbortLedger::restore`].
    pub fn drain(&self, remote: &EngineId) -> BTreeSet<String> {
        self.entries
            .remove(remote)
            .map(|(_, ids)| ids)
            .unwrap_or_default()
    }

    /// Put back ids whose delivery failed.
    pub fn restore(&self, remote: &EngineId, ids: BTreeSet<String>) {
        if ids.is_empty() {
            return;
        }
        self.entries.entry(remote.clone()).or_default().extend(ids);
    }

    pub fn pending(&self, remote: &EngineId) -> usize {
        self.entries.get(remote).map(|ids| ids.len()).unwrap_or(0)
    }

    pub fn total_pending(&self) -> usize {
        self.entries.iter().map(|entry| entry.value().len()).sum()
    }
}

#[derive(Debug, Clone)]
pub struct OutstandingHandle {
    pub remote: EngineId,
    pub received_at: Instant,
    /// A decode attempt currently holds the handle.
    pub in_flight: bool,
}

/// Handles received from prefill that no decode has consumed yet.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    handles: Arc<DashMap<String, OutstandingHandle>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request_id: &str, remote: EngineId, received_at: Instant) {
        self.handles.insert(
            request_id.to_string(),
            OutstandingHandle {
                remote,
                received_at,
                in_flight: false,
            },
        );
    }

    pub fn consume(&self, request_id: &str) -> Option<OutstandingHandle> {
        self.handles.remove(request_id).map(|(_, handle)| handle)
    }

    /// Hold the handle for one decode attempt; the reclaimer skips it until
    /// the guard drops. `None` when the handle is gone, e.g. reclaimed while
    /// the request was between attempts.
    pub fn dispatch(&self, request_id: &str) -> Option<DispatchGuard> {
        let mut handle = self.handles.get_mut(request_id)?;
        handle.in_flight = true;
        Some(DispatchGuard {
            handles: self.handles.clone(),
            request_id: request_id.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Remove and return every idle handle received more than `timeout`
    /// before `now`. Handles held by a decode attempt are left alone.
    pub fn take_expired(&self, now: Instant, timeout: Duration) -> Vec<(String, OutstandingHandle)> {
        let is_expired = |handle: &OutstandingHandle| {
            !handle.in_flight && now.saturating_duration_since(handle.received_at) > timeout
        };
        let candidates: Vec<String> = self
            .handles
            .iter()
            .filter(|entry| is_expired(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        // re-check under the shard lock, a decode may have claimed it since
        candidates
            .into_iter()
            .filter_map(|request_id| {
                self.handles
                    .remove_if(&request_id, |_, handle| is_expired(handle))
            })
            .collect()
    }
}

/// Makes a handle reclaimable again when its decode attempt ends without
/// consuming it.
#[derive(Debug)]
pub struct DispatchGuard {
    handles: Arc<DashMap<String, OutstandingHandle>>,
    request_id: String,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        if let Some(mut handle) = self.handles.get_mut(&self.request_id) {
            handle.in_flight = false;
        }
    }
}

/// Request ids with a request currently in flight.
///
/// Every per-request table is keyed by the request id, so two live requests
/// must never share one.
#[derive(Debug, Default)]
pub struct RequestIds {
    active: Arc<DashMap<String, ()>>,
}

impl RequestIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `request_id` for the lifetime of the returned guard, or `None`
    /// when another request holds it.
    pub fn claim(&self, request_id: &str) -> Option<RequestIdGuard> {
        match self.active.entry(request_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                entry.insert(());
                Some(RequestIdGuard {
                    active: self.active.clone(),
                    request_id: request_id.to_string(),
                })
            }
        }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

/// Releases a claimed request id on drop.
#[derive(Debug)]
pub struct RequestIdGuard {
    active: Arc<DashMap<String, ()>>,
    request_id: String,
}

impl Drop for RequestIdGuard {
    fn drop(&mut self) {
        self.active.remove(&self.request_id);
    }
}

/// Decode dispatches per engine that engine stats may not reflect yet.
#[derive(Debug, Default)]
pub struct PendingCounter {
    counts: Arc<DashMap<EngineId, u64>>,
}

impl PendingCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, engine_id: &EngineId) -> PendingGuard {
        *self.counts.entry(engine_id.clone()).or_insert(0) += 1;
        PendingGuard {
            counts: self.counts.clone(),
            engine_id: engine_id.clone(),
        }
    }

    pub fn get(&self, engine_id: &EngineId) -> u64 {
        self.counts.get(engine_id).map(|c| *c).unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<EngineId, u64> {
        self.counts
            .iter()
            .filter(|entry| *entry.value() > 0)
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

/// Decrements the pending count of one engine on drop.
pub struct PendingGuard {
    counts: Arc<DashMap<EngineId, u64>>,
    engine_id: EngineId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Some(mut count) = self.counts.get_mut(&self.engine_id) {
            *count = count.saturating_sub(1);
        }
    }
}
