// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded, time-ordered record buffer.
//!
//! Every sink owns one [`OrderedQueue`]. Producers (connection tasks) put records in without
//! ever waiting; the sink's drain loop takes them out in `(created_at, arrival)` order.
//!
//! When the buffer is full, the entry that would be served next (the oldest) is evicted to make
//! room, so a stalled sink keeps the most recent logs.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::debug;

use crate::record::{LogRecord, PriorityKey};

#[derive(Debug)]
struct Entry {
    key: PriorityKey,
    seq: u64,
    record: LogRecord,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

#[derive(Debug, Default)]
struct Inner {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
}

/// Capacity-limited priority queue with drop-oldest backpressure.
#[derive(Debug)]
pub struct OrderedQueue {
    max_size: usize,
    inner: Mutex<Inner>,
    notify: Notify,
    dropped: AtomicU64,
}

impl OrderedQueue {
    /// Creates a queue holding at most `max_size` records. `0` means unbounded.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Inserts a record, evicting the oldest entry first if the queue is full.
    pub fn put(&self, record: LogRecord) {
        let key = record.priority_key();
        {
            let mut inner = self.lock();
            if self.max_size > 0 && inner.heap.len() >= self.max_size {
                if let Some(Reverse(evicted)) = inner.heap.pop() {
                    self.dropped.fetch_add(1, AtomicOrdering::Relaxed);
                    debug!("Queue full, dropping record #{}", evicted.seq);
                }
            }

            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(Reverse(Entry { key, seq, record }));
        }
        self.notify.notify_one();
    }

    /// Waits until a record is available and removes the one with the smallest key.
    pub async fn get(&self) -> LogRecord {
        loop {
            if let Some(record) = self.try_get() {
                return record;
            }
            self.notify.notified().await;
        }
    }

    /// Removes the record with the smallest key without waiting.
    pub fn try_get(&self) -> Option<LogRecord> {
        self.lock().heap.pop().map(|Reverse(entry)| entry.record)
    }

    pub fn empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    /// Number of records evicted because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(AtomicOrdering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // The heap is never left half-updated, so a poisoned lock is still usable.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
