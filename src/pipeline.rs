//! End-to-end alert processing: analyze, score, distribute.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::analyzer::AlertAnalyzer;
use crate::distribution::Distributor;
use crate::error::{PipelineError, Result};
use crate::model::{AlertIntake, AnalyzedAlert, DistributionResult, OrgHierarchyInfo, PriorityInfo};
use crate::priority::PriorityCalculator;
use crate::queue::PriorityDeduplicatingQueue;

/// Resolves the people to notify for an alert raised in an organization.
#[async_trait]
pub trait OrgHierarchyProvider: Send + Sync {
    /// Members of `org_id` and its ancestors. Depth 0 is the org itself.
    async fn hierarchy_for(&self, org_id: &str) -> Result<Vec<OrgHierarchyInfo>>;
}

/// Everything produced while handling one alert.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedAlert {
    pub analyzed: AnalyzedAlert,
    pub priority: PriorityInfo,
    pub distribution: DistributionResult,
}

#[derive(Clone)]
pub struct AlertPipeline {
    analyzer: AlertAnalyzer,
    calculator: PriorityCalculator,
    distributor: Distributor,
    hierarchy: Arc<dyn OrgHierarchyProvider>,
    hierarchy_timeout: Duration,
}

impl AlertPipeline {
    pub fn new(
        analyzer: AlertAnalyzer,
        calculator: PriorityCalculator,
        distributor: Distributor,
        hierarchy: Arc<dyn OrgHierarchyProvider>,
        hierarchy_timeout: Duration,
    ) -> Self {
        Self {
            analyzer,
            calculator,
            distributor,
            hierarchy,
            hierarchy_timeout,
        }
    }

    pub fn queue(&self) -> &Arc<PriorityDeduplicatingQueue> {
        self.distributor.queue()
    }

    /// Process one alert through to the notification queue.
    ///
    /// Only planning failures (no one to notify) are returned as errors.
    #[instrument(skip(self, intake), fields(alert_id = %intake.alert_id, alert_type = %intake.alert_type))]
    pub async fn process(&self, intake: &AlertIntake) -> Result<ProcessedAlert> {
        let analyzed = self.analyzer.analyze(intake).await;
        let hierarchy = self.load_hierarchy(intake).await;
        let priority = self.calculator.calculate_priority(&analyzed, &hierarchy);
        let distribution = self
            .distributor
            .distribute(&analyzed, &hierarchy, &priority)
            .await?;

        info!(
            priority = priority.priority,
            recipients = distribution.total_recipients,
            admitted = distribution.admitted_tasks,
            "Alert processed"
        );

        Ok(ProcessedAlert {
            analyzed,
            priority,
            distribution,
        })
    }

    async fn load_hierarchy(&self, intake: &AlertIntake) -> Vec<OrgHierarchyInfo> {
        let Some(org_id) = intake.org_id.as_deref().filter(|id| !id.is_empty()) else {
            warn!(alert_id = %intake.alert_id, "Alert has no org id");
            return Vec::new();
        };

        let lookup = tokio::time::timeout(self.hierarchy_timeout, self.hierarchy.hierarchy_for(org_id))
            .await
            .unwrap_or(Err(PipelineError::CollaboratorTimeout {
                source_name: "hierarchy",
            }));

        match lookup {
            Ok(hierarchy) => hierarchy,
            Err(e) => {
                warn!(
                    alert_id = %intake.alert_id,
                    org_id = %org_id,
                    error = %e,
                    "Hierarchy lookup failed"
                );
                Vec::new()
            }
        }
    }
}
