//! Alert enrichment.
//!
//! [`AlertAnalyzer`] turns an [`AlertIntake`] into an [`AnalyzedAlert`] by
//! fusing results from three external scorers: context, pattern and anomaly.
//! The scorers are black boxes behind async traits. Any of them failing or
//! timing out yields the default-enriched view instead of an error, because a
//! mis-scored alert is better than a dropped one.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::AnalyzerConfig;
use crate::error::{PipelineError, Result};
use crate::model::{AlertCategory, AlertIntake, AnalyzedAlert, Severity, UrgencyLevel};

const DEFAULT_CONFIDENCE: f64 = 0.5;
const DEFAULT_FALSE_POSITIVE: f64 = 0.2;
const FALLBACK_FALSE_POSITIVE: f64 = 0.15;
const PATTERN_CONFIDENCE_WEIGHT: f64 = 0.2;
const AUTO_PROCESS_MIN_CONFIDENCE: f64 = 0.8;
const AUTO_PROCESS_MAX_FALSE_POSITIVE: f64 = 0.1;

/// Context key carrying device health in `[0, 1]`.
pub const CONTEXT_DEVICE_HEALTH: &str = "deviceHealth";

/// Context key carrying recent alert count for the device.
pub const CONTEXT_ALERT_FREQUENCY: &str = "alertFrequency";

/// Result of pattern recognition over an alert's history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternAnalysis {
    /// Confidence that the alert matches a known pattern, in `[0, 1]`.
    pub confidence: f64,
    /// Number of historically similar alerts.
    pub similar_alert_count: u32,
    #[serde(default)]
    pub details: Map<String, Value>,
}

/// Result of ML anomaly detection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnomalyAssessment {
    pub confidence_score: Option<f64>,
    pub false_positive_prob: Option<f64>,
    pub anomaly_score: Option<f64>,
}

/// Supplies device and user context for an alert.
#[async_trait]
pub trait ContextAnalyzer: Send + Sync {
    async fn analyze_context(
        &self,
        device_sn: &str,
        user_id: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> Result<Map<String, Value>>;
}

/// Matches an alert against historical patterns.
#[async_trait]
pub trait PatternRecognizer: Send + Sync {
    async fn analyze_patterns(
        &self,
        alert: &AnalyzedAlert,
        context: &Map<String, Value>,
    ) -> Result<PatternAnalysis>;
}

/// Scores how anomalous an alert is.
#[async_trait]
pub trait AnomalyAnalyzer: Send + Sync {
    async fn detect_anomaly(
        &self,
        alert: &AnalyzedAlert,
        context: &Map<String, Value>,
        patterns: &PatternAnalysis,
    ) -> Result<AnomalyAssessment>;
}

/// Scorer that knows nothing. Used when no scoring services are deployed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeutralScorers;

#[async_trait]
impl ContextAnalyzer for NeutralScorers {
    async fn analyze_context(
        &self,
        _device_sn: &str,
        _user_id: Option<&str>,
        _timestamp: DateTime<Utc>,
    ) -> Result<Map<String, Value>> {
        Ok(Map::new())
    }
}

#[async_trait]
impl PatternRecognizer for NeutralScorers {
    async fn analyze_patterns(
        &self,
        _alert: &AnalyzedAlert,
        _context: &Map<String, Value>,
    ) -> Result<PatternAnalysis> {
        Ok(PatternAnalysis::default())
    }
}

#[async_trait]
impl AnomalyAnalyzer for NeutralScorers {
    async fn detect_anomaly(
        &self,
        _alert: &AnalyzedAlert,
        _context: &Map<String, Value>,
        _patterns: &PatternAnalysis,
    ) -> Result<AnomalyAssessment> {
        Ok(AnomalyAssessment::default())
    }
}

/// Enriches raw alerts. Never fails.
#[derive(Clone)]
pub struct AlertAnalyzer {
    context: Arc<dyn ContextAnalyzer>,
    patterns: Arc<dyn PatternRecognizer>,
    anomaly: Arc<dyn AnomalyAnalyzer>,
    config: AnalyzerConfig,
}

impl AlertAnalyzer {
    pub fn new(
        context: Arc<dyn ContextAnalyzer>,
        patterns: Arc<dyn PatternRecognizer>,
        anomaly: Arc<dyn AnomalyAnalyzer>,
        config: AnalyzerConfig,
    ) -> Self {
        Self {
            context,
            patterns,
            anomaly,
            config,
        }
    }

    /// Analyzer backed by [`NeutralScorers`].
    pub fn neutral(config: AnalyzerConfig) -> Self {
        let scorers = Arc::new(NeutralScorers);
        Self::new(scorers.clone(), scorers.clone(), scorers, config)
    }

    /// Enrich an intake. Collaborator failures return the default-enriched view.
    pub async fn analyze(&self, intake: &AlertIntake) -> AnalyzedAlert {
        let base = default_enriched(intake);

        match self.enrich(&base).await {
            Ok(analyzed) => {
                debug!(
                    alert_id = %analyzed.alert_id(),
                    confidence = analyzed.confidence_score,
                    urgency = ?analyzed.urgency_level,
                    auto_processable = analyzed.auto_processable,
                    "Alert analyzed"
                );
                analyzed
            }
            Err(e) => {
                warn!(
                    alert_id = %intake.alert_id,
                    error = %e,
                    "Alert analysis degraded to defaults"
                );
                base
            }
        }
    }

    async fn enrich(&self, base: &AnalyzedAlert) -> Result<AnalyzedAlert> {
        let intake = &base.intake;

        let context = self
            .bounded(
                "context",
                self.context.analyze_context(
                    &intake.device_sn,
                    intake.user_id.as_deref(),
                    intake.timestamp,
                ),
            )
            .await?;

        let patterns = self
            .bounded("pattern", self.patterns.analyze_patterns(base, &context))
            .await?;

        let anomaly = self
            .bounded(
                "anomaly",
                self.anomaly.detect_anomaly(base, &context, &patterns),
            )
            .await?;

        Ok(fuse(base, context, &patterns, &anomaly))
    }

    async fn bounded<T, F>(&self, source_name: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        bounded_call(self.config.collaborator_timeout, source_name, call).await
    }
}

async fn bounded_call<T, F>(limit: Duration, source_name: &'static str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::CollaboratorTimeout { source_name }),
    }
}

/// The view returned when nothing else is known about an alert.
pub fn default_enriched(intake: &AlertIntake) -> AnalyzedAlert {
    AnalyzedAlert {
        intake: intake.clone(),
        confidence_score: DEFAULT_CONFIDENCE,
        urgency_level: UrgencyLevel::Medium,
        false_positive_probability: DEFAULT_FALSE_POSITIVE,
        auto_processable: false,
        recommended_actions: vec!["manual confirm".to_string(), "contact responsible".to_string()],
        context_data: Map::new(),
        calculation_breakdown: BTreeMap::new(),
    }
}

fn fuse(
    base: &AnalyzedAlert,
    mut context: Map<String, Value>,
    patterns: &PatternAnalysis,
    anomaly: &AnomalyAssessment,
) -> AnalyzedAlert {
    let pattern_confidence = sanitize(patterns.confidence).unwrap_or(0.0);
    let mut confidence =
        clamp01(DEFAULT_CONFIDENCE + pattern_confidence * PATTERN_CONFIDENCE_WEIGHT);
    let ml_confidence = anomaly.confidence_score.and_then(sanitize).map(clamp01);
    if let Some(ml) = ml_confidence {
        confidence = (confidence + ml) / 2.0;
    }

    let false_positive = anomaly
        .false_positive_prob
        .and_then(sanitize)
        .map(clamp01)
        .unwrap_or(FALLBACK_FALSE_POSITIVE);

    let severity = base.severity();
    let urgency = urgency_for(severity, patterns.similar_alert_count > 0);
    let auto_processable =
        confidence > AUTO_PROCESS_MIN_CONFIDENCE && false_positive < AUTO_PROCESS_MAX_FALSE_POSITIVE;

    let mut breakdown = BTreeMap::new();
    breakdown.insert("patternConfidence".to_string(), pattern_confidence);
    if let Some(ml) = ml_confidence {
        breakdown.insert("mlConfidence".to_string(), ml);
    }
    if let Some(score) = anomaly.anomaly_score.and_then(sanitize) {
        breakdown.insert("anomalyScore".to_string(), score);
    }
    breakdown.insert(
        "similarAlertCount".to_string(),
        f64::from(patterns.similar_alert_count),
    );
    breakdown.insert("confidence".to_string(), confidence);
    breakdown.insert("falsePositiveProbability".to_string(), false_positive);

    if !patterns.details.is_empty() {
        context.insert(
            "patterns".to_string(),
            Value::Object(patterns.details.clone()),
        );
    }

    AnalyzedAlert {
        confidence_score: confidence,
        urgency_level: urgency,
        false_positive_probability: false_positive,
        auto_processable,
        recommended_actions: recommended_actions(base.intake.alert_type.category(), severity),
        context_data: context,
        calculation_breakdown: breakdown,
        ..base.clone()
    }
}

/// Urgency from severity and whether similar alerts have been seen before.
pub fn urgency_for(severity: Severity, has_similar_history: bool) -> UrgencyLevel {
    match severity {
        Severity::Critical => UrgencyLevel::High,
        Severity::High if has_similar_history => UrgencyLevel::High,
        Severity::High => UrgencyLevel::Medium,
        Severity::Medium | Severity::Low | Severity::Unspecified => UrgencyLevel::Low,
    }
}

/// Lookup table of recommended actions by alert category and severity.
pub fn recommended_actions(category: AlertCategory, severity: Severity) -> Vec<String> {
    let actions: &[&str] = match (category, severity) {
        (AlertCategory::Vitals, Severity::Critical) => &[
            "contact user immediately",
            "notify emergency contact",
            "dispatch medical assistance",
        ],
        (AlertCategory::Vitals, _) => &["review vital sign trend", "contact user to confirm"],
        (AlertCategory::Emergency, _) => &[
            "contact user immediately",
            "dispatch on-site assistance",
            "notify emergency contact",
        ],
        (AlertCategory::Connectivity, _) => &[
            "check device connectivity",
            "check device battery",
            "contact user if device stays offline",
        ],
        (AlertCategory::Other, _) => &["manual review", "contact responsible"],
    };
    actions.iter().map(|a| a.to_string()).collect()
}

fn sanitize(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}
