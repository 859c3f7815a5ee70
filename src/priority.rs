//! Multi-factor priority scoring and escalation chains.
//!
//! Six weighted factors (summing to 1.0) produce a score in `[0, 1]` where
//! higher means more urgent. The score maps onto priority levels 1..=10 with
//! 1 being the most urgent:
//!
//! | factor          | weight |
//! |-----------------|--------|
//! | base severity   | 0.30   |
//! | org complexity  | 0.20   |
//! | time of day     | 0.15   |
//! | risk by type    | 0.15   |
//! | device history  | 0.10   |
//! | location risk   | 0.10   |
//!
//! `priority = clamp(ceil((1 - score) * 9) + 1, 1, 10)`

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use serde_json::Value;
use tracing::{debug, warn};

use crate::analyzer::{CONTEXT_ALERT_FREQUENCY, CONTEXT_DEVICE_HEALTH};
use crate::config::PriorityConfig;
use crate::error::{PipelineError, Result};
use crate::model::{
    AlertCategory, AnalyzedAlert, EscalationStep, OrgHierarchyInfo, PriorityInfo, clamp_priority,
};

const WEIGHT_BASE_SEVERITY: f64 = 0.30;
const WEIGHT_ORG_COMPLEXITY: f64 = 0.20;
const WEIGHT_TIME_OF_DAY: f64 = 0.15;
const WEIGHT_RISK_BY_TYPE: f64 = 0.15;
const WEIGHT_DEVICE_HISTORY: f64 = 0.10;
const WEIGHT_LOCATION_RISK: f64 = 0.10;

/// Depth at which org complexity saturates.
const MAX_SCORED_DEPTH: f64 = 5.0;

/// Priority used when scoring itself fails.
const FALLBACK_PRIORITY: u8 = 5;

/// Answers location questions for the location risk factor.
///
/// Implementations must be deterministic for a given coordinate.
pub trait GeoRiskProvider: Send + Sync {
    fn near_medical_facility(&self, latitude: f64, longitude: f64) -> bool;
    fn in_remote_area(&self, latitude: f64, longitude: f64) -> bool;
}

/// Geo provider that reports no special risk anywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGeoRisk;

impl GeoRiskProvider for NoGeoRisk {
    fn near_medical_facility(&self, _latitude: f64, _longitude: f64) -> bool {
        false
    }

    fn in_remote_area(&self, _latitude: f64, _longitude: f64) -> bool {
        false
    }
}

/// Converts analyzed alerts into priorities, deadlines and escalation chains.
#[derive(Clone)]
pub struct PriorityCalculator {
    geo: Arc<dyn GeoRiskProvider>,
    config: PriorityConfig,
}

impl PriorityCalculator {
    pub fn new(geo: Arc<dyn GeoRiskProvider>, config: PriorityConfig) -> Self {
        Self { geo, config }
    }

    /// Score an alert. Never fails; internal errors yield a safe default.
    pub fn calculate_priority(
        &self,
        analyzed: &AnalyzedAlert,
        hierarchy: &[OrgHierarchyInfo],
    ) -> PriorityInfo {
        self.calculate_priority_at(analyzed, hierarchy, Utc::now())
    }

    /// Same as [`calculate_priority`](Self::calculate_priority) with an explicit clock.
    pub fn calculate_priority_at(
        &self,
        analyzed: &AnalyzedAlert,
        hierarchy: &[OrgHierarchyInfo],
        now: DateTime<Utc>,
    ) -> PriorityInfo {
        match self.try_calculate(analyzed, hierarchy) {
            Ok(info) => {
                debug!(
                    alert_id = %analyzed.alert_id(),
                    priority = info.priority,
                    escalation_levels = info.escalation_chain.len(),
                    "Priority calculated"
                );
                info
            }
            Err(e) => {
                warn!(
                    alert_id = %analyzed.alert_id(),
                    error = %e,
                    "Priority calculation failed, using default"
                );
                fallback_priority(now)
            }
        }
    }

    fn try_calculate(
        &self,
        analyzed: &AnalyzedAlert,
        hierarchy: &[OrgHierarchyInfo],
    ) -> Result<PriorityInfo> {
        let factors = [
            (
                "baseSeverity",
                analyzed.severity().base_score(),
                WEIGHT_BASE_SEVERITY,
            ),
            (
                "orgComplexity",
                org_complexity(hierarchy),
                WEIGHT_ORG_COMPLEXITY,
            ),
            (
                "timeOfDay",
                self.time_of_day(analyzed.intake.timestamp),
                WEIGHT_TIME_OF_DAY,
            ),
            ("riskByType", risk_by_type(analyzed), WEIGHT_RISK_BY_TYPE),
            (
                "deviceHistory",
                device_history(analyzed),
                WEIGHT_DEVICE_HISTORY,
            ),
            (
                "locationRisk",
                self.location_risk(analyzed),
                WEIGHT_LOCATION_RISK,
            ),
        ];

        let mut breakdown = BTreeMap::new();
        let mut score = 0.0;
        for (name, value, weight) in factors {
            breakdown.insert(name.to_string(), value);
            score += value * weight;
        }

        if !score.is_finite() {
            return Err(PipelineError::Scoring(format!(
                "weighted score is not finite: {}",
                score
            )));
        }
        breakdown.insert("weightedScore".to_string(), score);

        let priority = priority_from_score(score);
        breakdown.insert("priority".to_string(), f64::from(priority));

        let processing_deadline = analyzed
            .intake
            .timestamp
            .checked_add_signed(deadline_window(priority))
            .ok_or_else(|| {
                PipelineError::Scoring("processing deadline out of range".to_string())
            })?;

        Ok(PriorityInfo {
            priority,
            processing_deadline,
            escalation_chain: build_escalation_chain(hierarchy),
            calculation_breakdown: breakdown,
        })
    }

    fn time_of_day(&self, timestamp: DateTime<Utc>) -> f64 {
        let local = timestamp.with_timezone(&self.config.local_offset);
        let hour = local.hour();
        let weekend = matches!(local.weekday(), Weekday::Sat | Weekday::Sun);

        let mut score: f64 = 0.5;
        if !weekend && (9..=17).contains(&hour) {
            score += 0.2;
        }
        if hour >= 22 || hour <= 6 {
            score += 0.3;
        }
        if weekend {
            score += 0.1;
        }
        score.min(1.0)
    }

    fn location_risk(&self, analyzed: &AnalyzedAlert) -> f64 {
        let Some((lat, lon)) = analyzed.intake.coordinates() else {
            return 0.5;
        };

        let mut score: f64 = 0.5;
        if self.geo.near_medical_facility(lat, lon) {
            score += 0.2;
        }
        if self.geo.in_remote_area(lat, lon) {
            score += 0.3;
        }
        score.min(1.0)
    }
}

/// Map a weighted score onto a priority level.
pub fn priority_from_score(score: f64) -> u8 {
    let steps = ((1.0 - score) * 9.0).ceil() as i64;
    clamp_priority(steps + 1)
}

/// Processing window granted to each priority level.
pub fn deadline_window(priority: u8) -> Duration {
    let minutes = match priority {
        1..=2 => 5,
        3..=4 => 15,
        5..=6 => 60,
        7..=8 => 240,
        _ => 480,
    };
    Duration::minutes(minutes)
}

/// Priority returned when scoring fails.
pub fn fallback_priority(now: DateTime<Utc>) -> PriorityInfo {
    PriorityInfo {
        priority: FALLBACK_PRIORITY,
        processing_deadline: now + Duration::hours(1),
        escalation_chain: Vec::new(),
        calculation_breakdown: BTreeMap::new(),
    }
}

fn org_complexity(hierarchy: &[OrgHierarchyInfo]) -> f64 {
    if hierarchy.is_empty() {
        return 0.5;
    }

    let max_depth = hierarchy.iter().map(|m| m.depth).max().unwrap_or(0);
    let managers = hierarchy.iter().filter(|m| m.principal).count();
    let manager_ratio = managers as f64 / hierarchy.len() as f64;

    let depth_score = (f64::from(max_depth) / MAX_SCORED_DEPTH).min(1.0);
    let manager_score = (manager_ratio * 2.0).min(1.0);
    (depth_score + manager_score) / 2.0
}

fn risk_by_type(analyzed: &AnalyzedAlert) -> f64 {
    let increment = match analyzed.intake.alert_type.category() {
        AlertCategory::Vitals => 0.3,
        AlertCategory::Emergency => 0.4,
        AlertCategory::Connectivity => 0.1,
        AlertCategory::Other => 0.2,
    };
    (0.5 + increment + analyzed.confidence_score * 0.2).clamp(0.0, 1.0)
}

fn device_history(analyzed: &AnalyzedAlert) -> f64 {
    let context = &analyzed.context_data;
    let mut score = 0.5;

    if let Some(health) = context.get(CONTEXT_DEVICE_HEALTH).and_then(Value::as_f64) {
        score += (1.0 - health.clamp(0.0, 1.0)) * 0.3;
    }

    if let Some(frequency) = context.get(CONTEXT_ALERT_FREQUENCY).and_then(Value::as_u64) {
        if frequency > 10 {
            score -= 0.1;
        } else if frequency < 2 {
            score += 0.2;
        }
    }

    score.clamp(0.0, 1.0)
}

/// Group managers by depth into an ascending escalation chain.
///
/// Depths without a principal are omitted.
pub fn build_escalation_chain(hierarchy: &[OrgHierarchyInfo]) -> Vec<EscalationStep> {
    let mut by_depth: BTreeMap<u32, Vec<&OrgHierarchyInfo>> = BTreeMap::new();
    for member in hierarchy.iter().filter(|m| m.principal) {
        by_depth.entry(member.depth).or_default().push(member);
    }

    by_depth
        .into_iter()
        .map(|(depth, managers)| {
            let mut manager_ids: Vec<String> = Vec::with_capacity(managers.len());
            for manager in &managers {
                if !manager_ids.contains(&manager.user_id) {
                    manager_ids.push(manager.user_id.clone());
                }
            }

            // by_depth only holds non-empty groups
            let first = managers[0];
            EscalationStep {
                level: depth,
                org_id: first.org_id.clone(),
                org_name: first.org_name.clone(),
                manager_ids,
                delay_minutes: 30 + i64::from(depth) * 15,
            }
        })
        .collect()
}
