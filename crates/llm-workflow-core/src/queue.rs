// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded priority job queue for background dispatch.
//!
//! Ordering is priority-first (higher first) with strict FIFO among equal
//! priorities: the heap key is `(priority, created_at, sequence)` where
//! `sequence` is a monotonically increasing insertion counter. Consumers
//! block in [`JobQueue::dequeue`]; producers never block, a full queue
//! fails fast. Each enqueue wakes at most one waiting consumer.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use tokio::sync::Notify;

/// Queue lifecycle errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The queue has been closed.
    #[error("queue is closed")]
    Closed,
    /// The queue is at capacity.
    #[error("queue is full")]
    Full,
}

/// A unit of background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job id.
    pub id: String,
    /// Opaque job inputs.
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    /// Priority; higher is dequeued earlier.
    #[serde(default)]
    pub priority: i64,
    /// Creation timestamp; ties within a priority dequeue oldest first.
    pub created_at: DateTime<Utc>,
    /// Optional earliest execution time. Informational for consumers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a job with the given id and priority, stamped now.
    pub fn new(id: impl Into<String>, priority: i64) -> Self {
        Self {
            id: id.into(),
            inputs: HashMap::new(),
            priority,
            created_at: Utc::now(),
            scheduled_for: None,
        }
    }
}

struct QueueItem {
    job: Job,
    seq: u64,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    // Max-heap: higher priority first, then older, then lower sequence.
    fn cmp(&self, other: &Self) -> Ordering {
        self.job
            .priority
            .cmp(&other.job.priority)
            .then_with(|| other.job.created_at.cmp(&self.job.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner {
    heap: BinaryHeap<QueueItem>,
    next_seq: u64,
    closed: bool,
}

/// Bounded priority FIFO queue.
pub struct JobQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

impl JobQueue {
    /// Creates a queue with the given capacity (at least 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Inserts a job in priority order.
    ///
    /// Fails immediately with [`QueueError::Closed`] after [`close`] or
    /// [`QueueError::Full`] at capacity; never blocks. Wakes at most one
    /// waiting consumer.
    ///
    /// [`close`]: Self::close
    pub fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(QueueError::Closed);
            }
            if inner.heap.len() >= self.capacity {
                return Err(QueueError::Full);
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(QueueItem { job, seq });
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Removes and returns the highest-priority oldest job.
    ///
    /// Waits until an item exists or the queue is closed. A closed queue
    /// still drains remaining items before failing with
    /// [`QueueError::Closed`]. The returned future is cancel-safe, so a
    /// deadline composes via `tokio::time::timeout`.
    pub async fn dequeue(&self) -> Result<Job, QueueError> {
        loop {
            // Register interest before checking state so a concurrent
            // enqueue between the check and the await cannot be missed.
            let notified = self.notify.notified();

            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.heap.pop() {
                    return Ok(item.job);
                }
                if inner.closed {
                    return Err(QueueError::Closed);
                }
            }

            notified.await;
        }
    }

    /// Returns the head job without removing it, or `None` if empty.
    pub fn peek(&self) -> Option<Job> {
        self.inner.lock().heap.peek().map(|item| item.job.clone())
    }

    /// Number of queued jobs.
    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes the queue. Idempotent; pending and future `dequeue` callers
    /// fail once the queue is drained, and every `enqueue` fails.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        self.notify.notify_waiters();
    }
}
