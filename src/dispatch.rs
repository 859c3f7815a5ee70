//! Queue consumer that hands notification batches to a channel dispatcher.
//!
//! The [`DispatchWorker`] runs as its own tokio task. It drains the queue
//! every poll interval (or sooner when woken by a producer), periodically
//! evicts expired dedup entries, and stops when the shutdown signal flips.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{ShutdownPolicy, WorkerConfig};
use crate::distribution::DeliveryTracker;
use crate::error::{PipelineError, Result};
use crate::model::{NotificationTask, TaskStatus};
use crate::queue::PriorityDeduplicatingQueue;

/// Sends notification batches to SMS, IM and email gateways.
///
/// Fire-and-forget: an `Ok` means the batch was handed over, not delivered.
#[async_trait]
pub trait ChannelDispatcher: Send + Sync {
    fn name(&self) -> &str;

    async fn schedule_notifications(&self, tasks: &[NotificationTask]) -> Result<()>;
}

/// Dispatcher that only logs. Used when no gateway is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDispatcher;

#[async_trait]
impl ChannelDispatcher for LogDispatcher {
    fn name(&self) -> &str {
        "log"
    }

    async fn schedule_notifications(&self, tasks: &[NotificationTask]) -> Result<()> {
        // Contact details stay out of the logs.
        for task in tasks {
            info!(
                task_id = %task.task_id,
                alert_id = %task.alert_id,
                recipient_id = %task.recipient_id,
                priority = task.priority,
                channels = ?task.channels,
                "Notification scheduled"
            );
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct DispatchRequest<'a> {
    tasks: &'a [NotificationTask],
}

/// Dispatcher that POSTs each batch as JSON to an HTTP gateway.
#[derive(Clone)]
pub struct HttpDispatcher {
    client: reqwest::Client,
    url: String,
}

impl HttpDispatcher {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl ChannelDispatcher for HttpDispatcher {
    fn name(&self) -> &str {
        "http"
    }

    async fn schedule_notifications(&self, tasks: &[NotificationTask]) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&DispatchRequest { tasks })
            .send()
            .await
            .map_err(|e| PipelineError::Dispatch(e.to_string()))?;

        response
            .error_for_status()
            .map_err(|e| PipelineError::Dispatch(e.to_string()))?;
        Ok(())
    }
}

enum BatchOutcome {
    Empty,
    Sent(usize),
    Failed(usize),
}

/// Counters reported when the worker stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub batches: u64,
    pub dispatched_tasks: u64,
    /// Tasks put back on the queue after a failed attempt.
    pub retried_tasks: u64,
    /// Tasks that exhausted their retries.
    pub failed_tasks: u64,
    pub evicted_dedup_entries: u64,
}

/// Consumer loop draining the shared queue.
pub struct DispatchWorker {
    queue: Arc<PriorityDeduplicatingQueue>,
    dispatcher: Arc<dyn ChannelDispatcher>,
    tracker: Option<Arc<dyn DeliveryTracker>>,
    wake: Arc<Notify>,
    config: WorkerConfig,
    report: WorkerReport,
}

impl DispatchWorker {
    pub fn new(
        queue: Arc<PriorityDeduplicatingQueue>,
        dispatcher: Arc<dyn ChannelDispatcher>,
        wake: Arc<Notify>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            tracker: None,
            wake,
            config,
            report: WorkerReport::default(),
        }
    }

    /// Record task status changes through `tracker` after each dispatch.
    pub fn with_tracker(mut self, tracker: Arc<dyn DeliveryTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Run the worker on its own task.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<WorkerReport> {
        tokio::spawn(self.run(shutdown))
    }

    /// Poll until `shutdown` becomes true (or its sender is dropped).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> WorkerReport {
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup = tokio::time::interval(self.config.cleanup_interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let wake = Arc::clone(&self.wake);

        info!(
            dispatcher = %self.dispatcher.name(),
            poll_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Dispatch worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = poll.tick() => {
                    self.drain().await;
                }
                _ = wake.notified() => {
                    self.drain().await;
                }
                _ = cleanup.tick() => {
                    let evicted = self.queue.clean_expired_dedup_entries();
                    self.report.evicted_dedup_entries += evicted as u64;
                }
            }
        }

        match self.config.shutdown_policy {
            ShutdownPolicy::Drain => {
                self.drain().await;
                let left = self.queue.len();
                if left > 0 {
                    warn!(left, "Dispatch worker stopping with tasks awaiting retry");
                }
            }
            ShutdownPolicy::Abandon => {
                let abandoned = self.queue.len();
                if abandoned > 0 {
                    warn!(abandoned, "Dispatch worker stopping with queued tasks");
                }
            }
        }

        info!(
            batches = self.report.batches,
            dispatched = self.report.dispatched_tasks,
            retried = self.report.retried_tasks,
            failed = self.report.failed_tasks,
            "Dispatch worker stopped"
        );
        self.report
    }

    /// Dispatch batches until the queue is empty or a batch fails.
    ///
    /// Stopping on failure leaves requeued tasks for the next tick instead
    /// of retrying them immediately.
    async fn drain(&mut self) {
        while let BatchOutcome::Sent(_) = self.dispatch_next().await {}
    }

    /// Dequeue and dispatch one batch. Returns the number of tasks dequeued.
    pub async fn run_once(&mut self) -> usize {
        match self.dispatch_next().await {
            BatchOutcome::Empty => 0,
            BatchOutcome::Sent(count) | BatchOutcome::Failed(count) => count,
        }
    }

    async fn dispatch_next(&mut self) -> BatchOutcome {
        let batch = self.queue.dequeue_batch(self.config.batch_size);
        if batch.is_empty() {
            return BatchOutcome::Empty;
        }

        let count = batch.len();
        self.report.batches += 1;

        match self.dispatcher.schedule_notifications(&batch).await {
            Ok(()) => {
                self.report.dispatched_tasks += count as u64;
                debug!(count, dispatcher = %self.dispatcher.name(), "Batch dispatched");
                self.track(&batch, TaskStatus::Dispatched).await;
                BatchOutcome::Sent(count)
            }
            Err(e) => {
                let max_retries = self.config.max_retries;
                let (retry, exhausted): (Vec<_>, Vec<_>) = batch
                    .into_iter()
                    .partition(|task| task.retry_count < max_retries);

                let retry: Vec<NotificationTask> = retry
                    .into_iter()
                    .map(|mut task| {
                        task.retry_count += 1;
                        task
                    })
                    .collect();
                let requeued = self.queue.requeue_batch(retry);

                self.report.retried_tasks += requeued as u64;
                self.report.failed_tasks += exhausted.len() as u64;
                warn!(
                    count,
                    requeued,
                    failed = exhausted.len(),
                    dispatcher = %self.dispatcher.name(),
                    error = %e,
                    "Batch dispatch failed"
                );

                if !exhausted.is_empty() {
                    self.track(&exhausted, TaskStatus::Failed).await;
                }
                BatchOutcome::Failed(count)
            }
        }
    }

    async fn track(&self, tasks: &[NotificationTask], status: TaskStatus) {
        if let Some(tracker) = &self.tracker {
            if let Err(e) = tracker.update_task_status(tasks, status).await {
                warn!(count = tasks.len(), error = %e, "Failed to record task status");
            }
        }
    }

    pub fn report(&self) -> WorkerReport {
        self.report
    }
}
