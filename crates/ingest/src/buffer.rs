//! Ingestion buffer: many concurrent producers, point-in-time snapshots.
//!
//! Records are appended fully formed under a short critical section, so a
//! snapshot never sees a partial record. Snapshots copy `Arc` pointers only
//! and are unaffected by later inserts.
//!
//! Growth is bounded by a [`RetentionPolicy`]: when the capacity is exceeded
//! the oldest records are evicted, and records older than `max_age` are
//! dropped on the next insert or snapshot.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use pullbridge_core::MessageRecord;

/// Default number of records retained.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Bounds on how much the buffer retains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Maximum retained records; `None` = unbounded.
    pub capacity: Option<NonZeroUsize>,
    /// Maximum record age; `None` = records never expire.
    pub max_age: Option<Duration>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            capacity: NonZeroUsize::new(DEFAULT_CAPACITY),
            max_age: None,
        }
    }
}

impl RetentionPolicy {
    /// Keep everything for the life of the process.
    pub fn unbounded() -> Self {
        Self {
            capacity: None,
            max_age: None,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = NonZeroUsize::new(capacity);
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }
}

/// Buffer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub retained: usize,
    pub inserted_total: u64,
    pub evicted_total: u64,
}

#[derive(Debug)]
struct Entry {
    inserted_at: Instant,
    record: Arc<MessageRecord>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: VecDeque<Entry>,
    inserted_total: u64,
    evicted_total: u64,
}

impl Inner {
    fn evict(&mut self, policy: &RetentionPolicy, now: Instant) {
        if let Some(max_age) = policy.max_age {
            while let Some(front) = self.entries.front() {
                if now.saturating_duration_since(front.inserted_at) <= max_age {
                    break;
                }
                self.entries.pop_front();
                self.evicted_total += 1;
            }
        }

        if let Some(capacity) = policy.capacity {
            while self.entries.len() > capacity.get() {
                self.entries.pop_front();
                self.evicted_total += 1;
            }
        }
    }
}

/// Insertion-ordered, thread-safe record buffer.
#[derive(Debug, Default)]
pub struct IngestionBuffer {
    policy: RetentionPolicy,
    inner: Mutex<Inner>,
}

impl IngestionBuffer {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    // A panicking producer cannot leave a half-written entry behind, so a
    // poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a record. Returns its 1-based insertion sequence number.
    pub fn insert(&self, record: MessageRecord) -> u64 {
        self.insert_at(record, Instant::now())
    }

    fn insert_at(&self, record: MessageRecord, now: Instant) -> u64 {
        let record = Arc::new(record);
        let mut inner = self.lock();
        inner.entries.push_back(Entry {
            inserted_at: now,
            record,
        });
        inner.inserted_total += 1;
        let sequence = inner.inserted_total;
        inner.evict(&self.policy, now);
        sequence
    }

    /// All retained records, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<MessageRecord>> {
        self.snapshot_at(Instant::now())
    }

    fn snapshot_at(&self, now: Instant) -> Vec<Arc<MessageRecord>> {
        let mut inner = self.lock();
        inner.evict(&self.policy, now);
        inner.entries.iter().map(|e| Arc::clone(&e.record)).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> BufferStats {
        let inner = self.lock();
        BufferStats {
            retained: inner.entries.len(),
            inserted_total: inner.inserted_total,
            evicted_total: inner.evicted_total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    fn record(body: &str) -> MessageRecord {
        MessageRecord::new(body, None, None)
    }

    fn bodies(snapshot: &[Arc<MessageRecord>]) -> Vec<String> {
        snapshot.iter().map(|r| r.body_text().into_owned()).collect()
    }

    #[test]
    fn empty_buffer_snapshots_to_empty() {
        let buffer = IngestionBuffer::new(RetentionPolicy::unbounded());
        assert!(buffer.snapshot().is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn snapshot_is_not_affected_by_later_inserts() {
        let buffer = IngestionBuffer::new(RetentionPolicy::unbounded());
        buffer.insert(record("a"));
        let snap = buffer.snapshot();
        buffer.insert(record("b"));

        assert_eq!(bodies(&snap), vec!["a"]);
        assert_eq!(bodies(&buffer.snapshot()), vec!["a", "b"]);
    }

    #[test]
    fn sequence_numbers_are_monotonic() {
        let buffer = IngestionBuffer::new(RetentionPolicy::unbounded());
        assert_eq!(buffer.insert(record("a")), 1);
        assert_eq!(buffer.insert(record("b")), 2);
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let buffer = IngestionBuffer::new(RetentionPolicy::unbounded().with_capacity(2));
        for body in ["a", "b", "c"] {
            buffer.insert(record(body));
        }

        assert_eq!(bodies(&buffer.snapshot()), vec!["b", "c"]);
        assert_eq!(
            buffer.stats(),
            BufferStats {
                retained: 2,
                inserted_total: 3,
                evicted_total: 1
            }
        );
    }

    #[test]
    fn zero_capacity_means_unbounded() {
        let policy = RetentionPolicy::default().with_capacity(0);
        assert_eq!(policy.capacity, None);
    }

    #[test]
    fn expired_records_are_dropped_on_snapshot() {
        let buffer =
            IngestionBuffer::new(RetentionPolicy::unbounded().with_max_age(Duration::from_secs(60)));
        let start = Instant::now();
        buffer.insert_at(record("old"), start);
        buffer.insert_at(record("new"), start + Duration::from_secs(50));

        let snap = buffer.snapshot_at(start + Duration::from_secs(90));
        assert_eq!(bodies(&snap), vec!["new"]);
        assert_eq!(buffer.stats().evicted_total, 1);
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let buffer = Arc::new(IngestionBuffer::new(RetentionPolicy::unbounded()));
        let producers: Vec<_> = (0..8)
            .map(|p| {
                let buffer = buffer.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        buffer.insert(record(&format!("{p}:{i}")));
                    }
                })
            })
            .collect();
        for t in producers {
            t.join().unwrap();
        }

        assert_eq!(buffer.snapshot().len(), 2000);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: every insert shows up exactly once and each producer's
        /// records appear in the order that producer inserted them.
        #[test]
        fn per_producer_order_is_preserved(
            counts in prop::collection::vec(0usize..50, 1..6)
        ) {
            let buffer = Arc::new(IngestionBuffer::new(RetentionPolicy::unbounded()));
            let handles: Vec<_> = counts
                .iter()
                .enumerate()
                .map(|(p, &n)| {
                    let buffer = buffer.clone();
                    thread::spawn(move || {
                        for i in 0..n {
                            buffer.insert(record(&format!("{p}:{i}")));
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }

            let snap = bodies(&buffer.snapshot());
            prop_assert_eq!(snap.len(), counts.iter().sum::<usize>());

            for (p, &n) in counts.iter().enumerate() {
                let prefix = format!("{p}:");
                let seen: Vec<usize> = snap
                    .iter()
                    .filter_map(|b| b.strip_prefix(&prefix))
                    .map(|i| i.parse().unwrap())
                    .collect();
                prop_assert_eq!(seen, (0..n).collect::<Vec<_>>());
            }
        }
    }
}
