// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Per-file-system transfer job queues.
//!
//! Jobs are opaque serialized capability pairs consumed by the owning
//! storage node. The queue is FIFO from the MGM's perspective; a
//! transaction batches appends so a partially built balancing round is
//! never visible to the consumer.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Opaque serialized capability pair (source + target).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    body: String,
}

impl TransferJob {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }

    pub fn body(&self) -> &str {
        &self.body
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    jobs: VecDeque<TransferJob>,
    txn: Option<Vec<TransferJob>>,
}

#[derive(Debug, Default)]
pub struct TransferQueue {
    inner: Mutex<QueueInner>,
}

impl TransferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start buffering appends; nested opens are idempotent.
    pub fn open_transaction(&self) {
        let mut inner = self.inner.lock();
        if inner.txn.is_none() {
            inner.txn = Some(Vec::new());
        }
    }

    /// Publish every buffered job atomically, in append order.
    pub fn close_transaction(&self) {
        let mut inner = self.inner.lock();
        if let Some(buffered) = inner.txn.take() {
            inner.jobs.extend(buffered);
        }
    }

    pub fn add(&self, job: TransferJob) {
        let mut inner = self.inner.lock();
        match inner.txn.as_mut() {
            Some(buffer) => buffer.push(job),
            None => inner.jobs.push_back(job),
        }
    }

    pub fn pop(&self) -> Option<TransferJob> {
        self.inner.lock().jobs.pop_front()
    }

    /// Published jobs only; an open transaction is not visible.
    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop published and buffered jobs, returning how many were discarded.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.jobs.len() + inner.txn.as_ref().map_or(0, Vec::len);
        inner.jobs.clear();
        inner.txn = None;
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let q = TransferQueue::new();
        q.add(TransferJob::new("a"));
        q.add(TransferJob::new("b"));

        assert_eq!(q.pop().unwrap().body(), "a");
        assert_eq!(q.pop().unwrap().body(), "b");
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_transaction_hides_partial_round() {
        let q = TransferQueue::new();
        q.open_transaction();
        q.add(TransferJob::new("a"));
        q.add(TransferJob::new("b"));

        assert_eq!(q.len(), 0);
        assert!(q.pop().is_none());

        q.close_transaction();
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().unwrap().body(), "a");
    }

    #[test]
    fn test_clear_drops_buffered_jobs_too() {
        let q = TransferQueue::new();
        q.add(TransferJob::new("a"));
        q.open_transaction();
        q.add(TransferJob::new("b"));

        assert_eq!(q.clear(), 2);
        q.close_transaction();
        assert!(q.is_empty());
    }
}
