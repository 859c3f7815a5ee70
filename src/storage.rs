//! SQLite storage for the relay's external collaborators.
//!
//! [`Storage`] backs two collaborator seams:
//!
//! - [`OrgHierarchyProvider`]: members notified for alerts raised in an org
//! - [`DeliveryTracker`]: distributions and the status of each task
//!
//! The notification queue itself is never persisted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::warn;
use uuid::Uuid;

use crate::distribution::DeliveryTracker;
use crate::error::Result;
use crate::model::{AnalyzedAlert, NotificationTask, OrgHierarchyInfo, TaskStatus};
use crate::pipeline::OrgHierarchyProvider;

/// A recorded distribution, as read back from storage.
#[derive(Debug, Clone, PartialEq)]
pub struct DistributionRecord {
    pub distribution_id: Uuid,
    pub alert_id: String,
    pub severity: String,
    pub task_count: i64,
    pub created_at: Option<DateTime<Utc>>,
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:alert-relay.db" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> Result<Self> {
        // In-memory databases are per-connection, so keep a single one.
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            5
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    async fn initialize_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS org_members (
                scope_org_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                org_id TEXT NOT NULL,
                org_name TEXT NOT NULL,
                depth INTEGER NOT NULL,
                principal INTEGER NOT NULL,
                phone TEXT,
                email TEXT,
                user_name TEXT NOT NULL,
                PRIMARY KEY (scope_org_id, user_id, org_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS distributions (
                distribution_id TEXT PRIMARY KEY,
                alert_id TEXT NOT NULL,
                severity TEXT NOT NULL,
                task_count INTEGER NOT NULL,
                created_ts INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS distribution_tasks (
                task_id TEXT PRIMARY KEY,
                distribution_id TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                priority INTEGER NOT NULL,
                status TEXT NOT NULL,
                updated_ts INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_distribution_tasks_distribution
            ON distribution_tasks(distribution_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or replace a member of the hierarchy notified for `scope_org_id`.
    pub async fn upsert_member(&self, scope_org_id: &str, member: &OrgHierarchyInfo) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO org_members
                (scope_org_id, user_id, org_id, org_name, depth, principal, phone, email, user_name)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(scope_org_id)
        .bind(&member.user_id)
        .bind(&member.org_id)
        .bind(&member.org_name)
        .bind(i64::from(member.depth))
        .bind(member.principal)
        .bind(&member.phone)
        .bind(&member.email)
        .bind(&member.user_name)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Members notified for alerts in `scope_org_id`, ordered by depth.
    pub async fn members_for_org(&self, scope_org_id: &str) -> Result<Vec<OrgHierarchyInfo>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, org_id, org_name, depth, principal, phone, email, user_name
            FROM org_members
            WHERE scope_org_id = ?
            ORDER BY depth, user_id
            "#,
        )
        .bind(scope_org_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(|r| {
                let user_id: String = r.get("user_id");
                let raw_depth: i64 = r.get("depth");
                let Ok(depth) = u32::try_from(raw_depth) else {
                    warn!(
                        scope_org_id = %scope_org_id,
                        user_id = %user_id,
                        depth = raw_depth,
                        "Skipping hierarchy member with invalid depth"
                    );
                    return None;
                };
                Some(OrgHierarchyInfo {
                    user_id,
                    org_id: r.get("org_id"),
                    org_name: r.get("org_name"),
                    depth,
                    principal: r.get("principal"),
                    phone: r.get("phone"),
                    email: r.get("email"),
                    user_name: r.get("user_name"),
                })
            })
            .collect())
    }

    /// Look up a recorded distribution.
    pub async fn get_distribution(&self, distribution_id: Uuid) -> Result<Option<DistributionRecord>> {
        let row = sqlx::query(
            r#"
            SELECT distribution_id, alert_id, severity, task_count, created_ts
            FROM distributions
            WHERE distribution_id = ?
            "#,
        )
        .bind(distribution_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| DistributionRecord {
            distribution_id,
            alert_id: r.get("alert_id"),
            severity: r.get("severity"),
            task_count: r.get("task_count"),
            created_at: DateTime::from_timestamp(r.get("created_ts"), 0),
        }))
    }

    /// Status of every task in a distribution, keyed by recipient.
    pub async fn task_statuses(&self, distribution_id: Uuid) -> Result<Vec<(String, TaskStatus)>> {
        let rows = sqlx::query(
            r#"
            SELECT recipient_id, status
            FROM distribution_tasks
            WHERE distribution_id = ?
            ORDER BY priority, recipient_id
            "#,
        )
        .bind(distribution_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(|r| {
                let status: String = r.get("status");
                TaskStatus::from_code(&status).map(|s| (r.get("recipient_id"), s))
            })
            .collect())
    }
}

#[async_trait]
impl OrgHierarchyProvider for Storage {
    async fn hierarchy_for(&self, org_id: &str) -> Result<Vec<OrgHierarchyInfo>> {
        self.members_for_org(org_id).await
    }
}

#[async_trait]
impl DeliveryTracker for Storage {
    async fn record_distribution(
        &self,
        distribution_id: Uuid,
        alert: &AnalyzedAlert,
        tasks: &[NotificationTask],
    ) -> Result<()> {
        let now_ts = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO distributions (distribution_id, alert_id, severity, task_count, created_ts)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(distribution_id.to_string())
        .bind(alert.alert_id())
        .bind(alert.severity().label())
        .bind(tasks.len() as i64)
        .bind(now_ts)
        .execute(&mut *tx)
        .await?;

        for task in tasks {
            sqlx::query(
                r#"
                INSERT INTO distribution_tasks
                    (task_id, distribution_id, recipient_id, priority, status, updated_ts)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(task_id) DO NOTHING
                "#,
            )
            .bind(task.task_id.to_string())
            .bind(distribution_id.to_string())
            .bind(&task.recipient_id)
            .bind(i64::from(task.priority))
            .bind(task.status.code())
            .bind(now_ts)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Upserts by task id: the worker may report a status before the
    /// distribution's own rows have been written.
    async fn update_task_status(&self, tasks: &[NotificationTask], status: TaskStatus) -> Result<()> {
        let now_ts = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        for task in tasks {
            sqlx::query(
                r#"
                INSERT INTO distribution_tasks
                    (task_id, distribution_id, recipient_id, priority, status, updated_ts)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(task_id) DO UPDATE SET
                    status = excluded.status,
                    updated_ts = excluded.updated_ts
                "#,
            )
            .bind(task.task_id.to_string())
            .bind(task.distribution_id().unwrap_or_default())
            .bind(&task.recipient_id)
            .bind(i64::from(task.priority))
            .bind(status.code())
            .bind(now_ts)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::default_enriched;
    use crate::distribution::{DistributionPlanner, NotificationTaskGenerator};
    use crate::model::{AlertIntake, AlertType, PriorityInfo, Severity};
    use std::collections::BTreeMap;

    async fn setup_test_storage() -> Storage {
        Storage::new("sqlite::memory:").await.unwrap()
    }

    fn member(user_id: &str, depth: u32, principal: bool) -> OrgHierarchyInfo {
        OrgHierarchyInfo {
            user_id: user_id.to_string(),
            org_id: format!("org-{}", depth),
            org_name: format!("Level {}", depth),
            depth,
            principal,
            phone: None,
            email: Some(format!("{}@example.org", user_id)),
            user_name: user_id.to_string(),
        }
    }

    fn analyzed() -> AnalyzedAlert {
        default_enriched(&AlertIntake {
            alert_id: "alert-7".to_string(),
            alert_type: AlertType::BloodOxygen,
            device_sn: "DEV-7".to_string(),
            timestamp: Utc::now(),
            description: String::new(),
            severity: Severity::High,
            user_id: None,
            org_id: Some("org-0".to_string()),
            customer_id: None,
            rule_id: None,
            latitude: None,
            longitude: None,
        })
    }

    #[tokio::test]
    async fn test_members_round_trip_ordered_by_depth() {
        let storage = setup_test_storage().await;

        storage
            .upsert_member("org-0", &member("director", 2, true))
            .await
            .unwrap();
        storage
            .upsert_member("org-0", &member("carer", 0, false))
            .await
            .unwrap();
        storage
            .upsert_member("other-org", &member("stranger", 0, true))
            .await
            .unwrap();

        let members = storage.hierarchy_for("org-0").await.unwrap();

        assert_eq!(members.len(), 2);
        assert_eq!(members[0].user_id, "carer");
        assert!(!members[0].principal);
        assert_eq!(members[1], member("director", 2, true));
    }

    #[tokio::test]
    async fn test_unknown_org_has_empty_hierarchy() {
        let storage = setup_test_storage().await;
        assert!(storage.hierarchy_for("nowhere").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_distribution_and_update_status() {
        let storage = setup_test_storage().await;
        let alert = analyzed();
        let hierarchy = vec![member("lead", 0, true), member("nurse", 1, false)];
        let priority = PriorityInfo {
            priority: 3,
            processing_deadline: Utc::now(),
            escalation_chain: Vec::new(),
            calculation_breakdown: BTreeMap::new(),
        };
        let plan = DistributionPlanner
            .create_distribution_plan(&alert, &hierarchy, &priority)
            .unwrap();
        let tasks = NotificationTaskGenerator.generate_tasks(&alert, &plan).unwrap();

        storage
            .record_distribution(plan.id, &alert, &tasks)
            .await
            .unwrap();

        let record = storage.get_distribution(plan.id).await.unwrap().unwrap();
        assert_eq!(record.alert_id, "alert-7");
        assert_eq!(record.severity, "HIGH");
        assert_eq!(record.task_count, 2);
        assert!(record.created_at.is_some());

        let lead_task = tasks.iter().find(|t| t.recipient_id == "lead").unwrap();
        storage
            .update_task_status(std::slice::from_ref(lead_task), TaskStatus::Dispatched)
            .await
            .unwrap();

        let statuses = storage.task_statuses(plan.id).await.unwrap();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.contains(&("lead".to_string(), TaskStatus::Dispatched)));
        assert!(statuses.contains(&("nurse".to_string(), TaskStatus::Pending)));
    }

    #[tokio::test]
    async fn test_status_reported_before_distribution_recorded() {
        let storage = setup_test_storage().await;
        let alert = analyzed();
        let hierarchy = vec![member("lead", 0, true), member("nurse", 1, false)];
        let priority = PriorityInfo {
            priority: 2,
            processing_deadline: Utc::now(),
            escalation_chain: Vec::new(),
            calculation_breakdown: BTreeMap::new(),
        };
        let plan = DistributionPlanner
            .create_distribution_plan(&alert, &hierarchy, &priority)
            .unwrap();
        let tasks = NotificationTaskGenerator.generate_tasks(&alert, &plan).unwrap();

        storage
            .update_task_status(&tasks, TaskStatus::Dispatched)
            .await
            .unwrap();
        storage
            .record_distribution(plan.id, &alert, &tasks)
            .await
            .unwrap();

        let statuses = storage.task_statuses(plan.id).await.unwrap();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|(_, s)| *s == TaskStatus::Dispatched));
    }

    #[tokio::test]
    async fn test_member_with_negative_depth_is_skipped() {
        let storage = setup_test_storage().await;
        storage
            .upsert_member("org-0", &member("carer", 0, false))
            .await
            .unwrap();
        sqlx::query(
            r#"
            INSERT INTO org_members
                (scope_org_id, user_id, org_id, org_name, depth, principal, phone, email, user_name)
            VALUES ('org-0', 'ghost', 'org-x', 'Broken', -1, 1, NULL, NULL, 'ghost')
            "#,
        )
        .execute(&storage.pool)
        .await
        .unwrap();

        let members = storage.hierarchy_for("org-0").await.unwrap();

        assert_eq!(members.len(), 1);
        assert_eq!(members[0].user_id, "carer");
    }

    #[tokio::test]
    async fn test_missing_distribution() {
        let storage = setup_test_storage().await;
        let record = storage.get_distribution(Uuid::new_v4()).await.unwrap();
        assert!(record.is_none());
    }
}
