//! Ten-lane priority queue with a time-boxed dedup index.
//!
//! Lane `i` holds tasks of priority `i + 1` in FIFO order. Producers only
//! ever lock the lane they push into, so enqueues at different priorities
//! proceed independently. A dequeue locks every lane (always in ascending
//! order) before draining, which makes it linearizable: no task of priority
//! `p` is returned while a task of priority `< p` is queued.
//!
//! The dedup index maps `(alert_id, recipient_id)` to the admission time.
//! Check-then-insert happens under a single lock, so exactly one task per
//! key is admitted per TTL window regardless of how many producers race.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{DEFAULT_DEQUEUE_BATCH, QueueConfig};
use crate::error::{PipelineError, Result};
use crate::model::{DedupKey, NotificationTask, PRIORITY_MAX, PRIORITY_MIN, QueueStats};

/// Number of priority lanes.
pub const LANE_COUNT: usize = PRIORITY_MAX as usize;

/// Shared notification queue. Wrap in an `Arc` to share between producers
/// and the dispatch worker.
pub struct PriorityDeduplicatingQueue {
    lanes: [Mutex<VecDeque<NotificationTask>>; LANE_COUNT],
    dedup: Mutex<HashMap<DedupKey, DateTime<Utc>>>,
    ttl: Duration,
    processed: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
}

impl Default for PriorityDeduplicatingQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl PriorityDeduplicatingQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            lanes: std::array::from_fn(|_| Mutex::new(VecDeque::new())),
            dedup: Mutex::new(HashMap::new()),
            ttl: config.dedup_ttl,
            processed: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Admit a batch of tasks, returning how many were admitted.
    pub fn enqueue_batch(&self, tasks: Vec<NotificationTask>) -> usize {
        self.enqueue_batch_at(tasks, Utc::now())
    }

    /// Admit a batch using `now` as the admission time.
    ///
    /// Duplicates within the TTL are dropped and counted. Malformed tasks are
    /// logged, counted and skipped without aborting the batch.
    pub fn enqueue_batch_at(&self, tasks: Vec<NotificationTask>, now: DateTime<Utc>) -> usize {
        self.admit_batch_at(tasks, now).len()
    }

    /// Same as [`enqueue_batch_at`](Self::enqueue_batch_at), returning the ids
    /// of the admitted tasks.
    pub fn admit_batch_at(&self, tasks: Vec<NotificationTask>, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut admitted = Vec::new();

        for task in tasks {
            let lane = match lane_index(&task) {
                Ok(lane) => lane,
                Err(e) => {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        task_id = %task.task_id,
                        alert_id = %task.alert_id,
                        error = %e,
                        "Skipping malformed task"
                    );
                    continue;
                }
            };

            if !self.try_admit(task.dedup_key(), now) {
                self.duplicates.fetch_add(1, Ordering::Relaxed);
                debug!(
                    alert_id = %task.alert_id,
                    recipient_id = %task.recipient_id,
                    "Duplicate task suppressed"
                );
                continue;
            }

            admitted.push(task.task_id);
            self.lanes[lane].lock().push_back(task);
            self.processed.fetch_add(1, Ordering::Relaxed);
        }

        admitted
    }

    /// Put tasks back after a failed dispatch attempt.
    ///
    /// Their dedup entries already exist, so the dedup check is skipped and
    /// the processed counter is left alone.
    pub fn requeue_batch(&self, tasks: Vec<NotificationTask>) -> usize {
        let mut requeued = 0;
        for task in tasks {
            match lane_index(&task) {
                Ok(lane) => {
                    self.lanes[lane].lock().push_back(task);
                    requeued += 1;
                }
                Err(e) => {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!(task_id = %task.task_id, error = %e, "Dropping malformed task on requeue");
                }
            }
        }
        requeued
    }

    /// Record `key` unless an unexpired entry exists. Returns whether it was recorded.
    fn try_admit(&self, key: DedupKey, now: DateTime<Utc>) -> bool {
        let mut dedup = self.dedup.lock();
        match dedup.get(&key) {
            Some(admitted_at) if now - *admitted_at < self.ttl => false,
            _ => {
                dedup.insert(key, now);
                true
            }
        }
    }

    /// Remove up to `max_count` tasks, most urgent first. Zero means the default of 50.
    pub fn dequeue_batch(&self, max_count: usize) -> Vec<NotificationTask> {
        let budget = if max_count == 0 {
            DEFAULT_DEQUEUE_BATCH
        } else {
            max_count
        };

        let mut lanes: Vec<_> = self.lanes.iter().map(|lane| lane.lock()).collect();
        let mut batch = Vec::with_capacity(budget.min(64));

        for lane in lanes.iter_mut() {
            let remaining = budget - batch.len();
            if remaining == 0 {
                break;
            }
            let take = remaining.min(lane.len());
            batch.extend(lane.drain(..take));
        }

        batch
    }

    pub fn queue_stats(&self) -> QueueStats {
        let per_lane_length: Vec<usize> = self.lanes.iter().map(|lane| lane.lock().len()).collect();
        let total_length = per_lane_length.iter().sum();

        QueueStats {
            per_lane_length,
            total_length,
            processed_count: self.processed.load(Ordering::Relaxed),
            duplicate_count: self.duplicates.load(Ordering::Relaxed),
            rejected_count: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Evict dedup entries older than the TTL. Queued tasks are untouched.
    pub fn clean_expired_dedup_entries(&self) -> usize {
        self.clean_expired_dedup_entries_at(Utc::now())
    }

    pub fn clean_expired_dedup_entries_at(&self, now: DateTime<Utc>) -> usize {
        let mut dedup = self.dedup.lock();
        let before = dedup.len();
        dedup.retain(|_, admitted_at| now - *admitted_at < self.ttl);
        let evicted = before - dedup.len();

        if evicted > 0 {
            debug!(evicted, remaining = dedup.len(), "Expired dedup entries evicted");
        }
        evicted
    }

    /// Number of tasks currently queued.
    pub fn len(&self) -> usize {
        self.lanes.iter().map(|lane| lane.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live dedup entries.
    pub fn dedup_entries(&self) -> usize {
        self.dedup.lock().len()
    }
}

fn lane_index(task: &NotificationTask) -> Result<usize> {
    if !(PRIORITY_MIN..=PRIORITY_MAX).contains(&task.priority) {
        return Err(PipelineError::MalformedTask(format!(
            "priority {} outside {}..={}",
            task.priority, PRIORITY_MIN, PRIORITY_MAX
        )));
    }
    if task.alert_id.trim().is_empty() {
        return Err(PipelineError::MalformedTask("empty alert_id".to_string()));
    }
    if task.recipient_id.trim().is_empty() {
        return Err(PipelineError::MalformedTask(
            "empty recipient_id".to_string(),
        ));
    }
    if task.channels.is_empty() {
        return Err(PipelineError::MalformedTask("no channels".to_string()));
    }
    Ok(usize::from(task.priority - PRIORITY_MIN))
}
