// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory run store.
//!
//! Bounded LRU keyed by run id. Returned records are deep copies, so
//! callers can never mutate stored state; stored records keep whatever
//! timestamps the caller set. This store backs the SDK façade, the
//! executor core does not depend on it.

use chrono::{DateTime, Utc};
use llm_workflow_core::run::{Run, RunStatus};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use uuid::Uuid;

/// Default store capacity.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Default page size for [`RunStore::list_runs`].
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Hard cap on a single listing.
pub const MAX_LIST_LIMIT: usize = 10_000;

/// Query filter for [`RunStore::list_runs`].
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    /// Only runs of this workflow.
    pub workflow_id: Option<String>,
    /// Only runs in this status.
    pub status: Option<RunStatus>,
    /// Only runs started after this instant.
    pub started_after: Option<DateTime<Utc>>,
    /// Page size (0 = default 100, capped at 10 000).
    pub limit: usize,
    /// Page offset.
    pub offset: usize,
}

impl RunFilter {
    /// An unrestricted filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to one workflow.
    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    /// Restricts to one status.
    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restricts to runs started after the given instant.
    pub fn with_started_after(mut self, after: DateTime<Utc>) -> Self {
        self.started_after = Some(after);
        self
    }

    fn effective_limit(&self) -> usize {
        if self.limit == 0 {
            DEFAULT_LIST_LIMIT
        } else {
            self.limit.min(MAX_LIST_LIMIT)
        }
    }
}

/// Bounded LRU store of run records.
pub struct RunStore {
    inner: Mutex<LruCache<Uuid, Run>>,
}

impl Default for RunStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl RunStore {
    /// Creates a store with the given capacity (at least 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Inserts or replaces a run record.
    pub fn save_run(&self, run: &Run) {
        self.inner.lock().put(run.run_id, run.clone());
    }

    /// Fetches a deep copy of a run, marking it recently used.
    pub fn get_run(&self, run_id: Uuid) -> Option<Run> {
        self.inner.lock().get(&run_id).cloned()
    }

    /// Lists runs matching the filter, newest first.
    pub fn list_runs(&self, filter: &RunFilter) -> Vec<Run> {
        let inner = self.inner.lock();
        let mut matching: Vec<Run> = inner
            .iter()
            .map(|(_, run)| run)
            .filter(|run| {
                if let Some(workflow_id) = &filter.workflow_id {
                    if &run.workflow_id != workflow_id {
                        return false;
                    }
                }
                if let Some(status) = filter.status {
                    if run.status != status {
                        return false;
                    }
                }
                if let Some(after) = filter.started_after {
                    if run.started_at <= after {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.effective_limit())
            .collect()
    }

    /// Number of stored runs.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
