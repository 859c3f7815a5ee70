//! Distribution planning and notification task generation.
//!
//! A [`DistributionPlan`] groups the org hierarchy by depth and assigns each
//! depth an escalation delay. [`NotificationTaskGenerator`] expands the plan
//! into exactly one [`NotificationTask`] per recipient, and [`Distributor`]
//! admits the batch into the shared queue.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::model::{
    AlertSnapshot, AnalyzedAlert, DistributionPlan, DistributionResult, NotificationTask,
    OrgHierarchyInfo, PriorityInfo, RecipientSnapshot, RecipientType, TaskStatus, clamp_priority,
};
use crate::queue::PriorityDeduplicatingQueue;

/// Seconds budgeted per recipient when estimating delivery time.
const SECONDS_PER_RECIPIENT: u64 = 2;

/// Extra delay added per organizational depth, in minutes.
const DELAY_PER_DEPTH_MINUTES: i64 = 5;

/// Records distributions for later tracking.
#[async_trait]
pub trait DeliveryTracker: Send + Sync {
    async fn record_distribution(
        &self,
        distribution_id: Uuid,
        alert: &AnalyzedAlert,
        tasks: &[NotificationTask],
    ) -> Result<()>;

    /// Update the status of tasks after a dispatch attempt.
    ///
    /// May run before `record_distribution` for the same tasks has finished,
    /// so implementations must not lose the status in that case.
    async fn update_task_status(&self, _tasks: &[NotificationTask], _status: TaskStatus) -> Result<()> {
        Ok(())
    }
}

/// Tracker that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracker;

#[async_trait]
impl DeliveryTracker for NoopTracker {
    async fn record_distribution(
        &self,
        _distribution_id: Uuid,
        _alert: &AnalyzedAlert,
        _tasks: &[NotificationTask],
    ) -> Result<()> {
        Ok(())
    }
}

/// Base escalation delay in minutes for a priority bucket.
pub fn base_delay_minutes(priority: u8) -> i64 {
    match priority {
        1..=2 => 5,
        3..=4 => 15,
        5..=6 => 30,
        _ => 60,
    }
}

/// Groups recipients by depth and computes per-depth delays.
#[derive(Debug, Clone, Copy, Default)]
pub struct DistributionPlanner;

impl DistributionPlanner {
    pub fn create_distribution_plan(
        &self,
        analyzed: &AnalyzedAlert,
        hierarchy: &[OrgHierarchyInfo],
        priority_info: &PriorityInfo,
    ) -> Result<DistributionPlan> {
        if hierarchy.is_empty() {
            return Err(PipelineError::Planning(format!(
                "no recipients in hierarchy for alert {}",
                analyzed.alert_id()
            )));
        }

        let mut ordered: Vec<&OrgHierarchyInfo> = hierarchy.iter().collect();
        ordered.sort_by_key(|member| member.depth);

        // A user listed at several depths is notified once, at the shallowest.
        let mut seen = HashSet::new();
        let mut recipients_by_level: BTreeMap<u32, Vec<OrgHierarchyInfo>> = BTreeMap::new();
        for member in ordered {
            if member.user_id.trim().is_empty() {
                return Err(PipelineError::Planning(format!(
                    "hierarchy member in org {} has no user id",
                    member.org_id
                )));
            }
            if seen.insert(member.user_id.as_str()) {
                recipients_by_level
                    .entry(member.depth)
                    .or_default()
                    .push(member.clone());
            }
        }

        let base_delay = base_delay_minutes(priority_info.priority);
        let escalation_delays = recipients_by_level
            .keys()
            .map(|&depth| (depth, base_delay + i64::from(depth) * DELAY_PER_DEPTH_MINUTES))
            .collect();

        let total: usize = recipients_by_level.values().map(Vec::len).sum();

        Ok(DistributionPlan {
            id: Uuid::new_v4(),
            recipients_by_level,
            escalation_delays,
            estimated_delivery_seconds: total as u64 * SECONDS_PER_RECIPIENT,
        })
    }
}

/// Expands a plan into one task per recipient.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotificationTaskGenerator;

impl NotificationTaskGenerator {
    pub fn generate_tasks(
        &self,
        analyzed: &AnalyzedAlert,
        plan: &DistributionPlan,
    ) -> Result<Vec<NotificationTask>> {
        self.generate_tasks_at(analyzed, plan, Utc::now())
    }

    pub fn generate_tasks_at(
        &self,
        analyzed: &AnalyzedAlert,
        plan: &DistributionPlan,
        now: DateTime<Utc>,
    ) -> Result<Vec<NotificationTask>> {
        let severity = analyzed.severity();
        let channels = severity.channels();
        let alert = AlertSnapshot {
            alert_type: analyzed.intake.alert_type.clone(),
            severity,
            device_sn: analyzed.intake.device_sn.clone(),
            description: analyzed.intake.description.clone(),
            timestamp: analyzed.intake.timestamp,
            recommended_actions: analyzed.recommended_actions.clone(),
        };

        let mut tasks = Vec::with_capacity(plan.total_recipients());
        for (&depth, recipients) in &plan.recipients_by_level {
            let delay = *plan.escalation_delays.get(&depth).ok_or_else(|| {
                PipelineError::Planning(format!("no escalation delay for depth {}", depth))
            })?;
            let deadline = now.checked_add_signed(Duration::minutes(delay)).ok_or_else(|| {
                PipelineError::Planning(format!("delivery deadline out of range at depth {}", depth))
            })?;
            let priority = clamp_priority(severity.rank() - i64::from(depth));

            for recipient in recipients {
                let mut metadata = BTreeMap::new();
                metadata.insert("distribution_id".to_string(), plan.id.to_string());
                metadata.insert(
                    "urgency".to_string(),
                    format!("{:?}", analyzed.urgency_level).to_uppercase(),
                );
                metadata.insert(
                    "confidence".to_string(),
                    format!("{:.2}", analyzed.confidence_score),
                );

                tasks.push(NotificationTask {
                    task_id: Uuid::new_v4(),
                    alert_id: analyzed.alert_id().to_string(),
                    recipient_id: recipient.user_id.clone(),
                    recipient_type: if recipient.principal {
                        RecipientType::Manager
                    } else {
                        RecipientType::Member
                    },
                    priority,
                    channels: channels.clone(),
                    delivery_deadline: deadline,
                    escalation_delay_minutes: delay,
                    alert: alert.clone(),
                    recipient: RecipientSnapshot {
                        user_name: recipient.user_name.clone(),
                        org_id: recipient.org_id.clone(),
                        org_name: recipient.org_name.clone(),
                        depth,
                        phone: recipient.phone.clone(),
                        email: recipient.email.clone(),
                    },
                    created_at: now,
                    status: TaskStatus::Pending,
                    retry_count: 0,
                    metadata,
                });
            }
        }

        Ok(tasks)
    }
}

/// Plans, generates and enqueues notification tasks for an alert.
#[derive(Clone)]
pub struct Distributor {
    planner: DistributionPlanner,
    generator: NotificationTaskGenerator,
    queue: Arc<PriorityDeduplicatingQueue>,
    tracker: Arc<dyn DeliveryTracker>,
    wake: Arc<Notify>,
}

impl Distributor {
    /// `wake` is notified whenever tasks are admitted so the dispatch
    /// worker can drain without waiting for its next poll.
    pub fn new(
        queue: Arc<PriorityDeduplicatingQueue>,
        tracker: Arc<dyn DeliveryTracker>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            planner: DistributionPlanner,
            generator: NotificationTaskGenerator,
            queue,
            tracker,
            wake,
        }
    }

    pub fn queue(&self) -> &Arc<PriorityDeduplicatingQueue> {
        &self.queue
    }

    /// Distribute an alert to its hierarchy.
    ///
    /// Returns once tasks are enqueued. Tracking runs in the background and
    /// its failures are only logged. Planning failures are returned.
    pub async fn distribute(
        &self,
        analyzed: &AnalyzedAlert,
        hierarchy: &[OrgHierarchyInfo],
        priority_info: &PriorityInfo,
    ) -> Result<DistributionResult> {
        let now = Utc::now();
        let plan = self
            .planner
            .create_distribution_plan(analyzed, hierarchy, priority_info)?;
        let tasks = self.generator.generate_tasks_at(analyzed, &plan, now)?;
        let total_recipients = tasks.len();

        let admitted_ids: HashSet<Uuid> = self
            .queue
            .admit_batch_at(tasks.clone(), now)
            .into_iter()
            .collect();
        let admitted = admitted_ids.len();
        if admitted > 0 {
            self.wake.notify_one();
        }

        info!(
            alert_id = %analyzed.alert_id(),
            distribution_id = %plan.id,
            priority = priority_info.priority,
            recipients = total_recipients,
            admitted,
            levels = plan.recipients_by_level.len(),
            "Alert distributed"
        );

        // Only admitted tasks will ever be dispatched.
        let tracked: Vec<NotificationTask> = tasks
            .into_iter()
            .filter(|task| admitted_ids.contains(&task.task_id))
            .collect();
        if tracked.is_empty() {
            debug!(distribution_id = %plan.id, "Nothing admitted, distribution not tracked");
        } else {
            let tracker = Arc::clone(&self.tracker);
            let alert = analyzed.clone();
            let distribution_id = plan.id;
            tokio::spawn(async move {
                if let Err(e) = tracker
                    .record_distribution(distribution_id, &alert, &tracked)
                    .await
                {
                    warn!(
                        distribution_id = %distribution_id,
                        alert_id = %alert.alert_id(),
                        error = %e,
                        "Failed to record distribution"
                    );
                }
            });
        }

        Ok(DistributionResult {
            distribution_id: plan.id,
            total_recipients,
            admitted_tasks: admitted,
            estimated_delivery_time: now
                + Duration::seconds(plan.estimated_delivery_seconds as i64),
            tracking_ref: format!("dist:{}", plan.id),
        })
    }
}
