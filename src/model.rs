//! Data models for the alert relay.
//!
//! Every stage of the pipeline produces a fresh value rather than mutating
//! the previous one: an [`AlertIntake`] becomes an [`AnalyzedAlert`], which
//! is scored into a [`PriorityInfo`] and expanded into [`NotificationTask`]s.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Most urgent priority level.
pub const PRIORITY_MIN: u8 = 1;

/// Least urgent priority level.
pub const PRIORITY_MAX: u8 = 10;

/// Clamp an arbitrary integer into the `[1, 10]` priority range.
pub fn clamp_priority(value: i64) -> u8 {
    value.clamp(i64::from(PRIORITY_MIN), i64::from(PRIORITY_MAX)) as u8
}

/// Severity reported by the upstream detector.
///
/// Unknown wire values deserialize to `Unspecified`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    #[serde(other)]
    Unspecified,
}

impl Severity {
    /// Base severity score used by the priority calculator.
    pub fn base_score(&self) -> f64 {
        match self {
            Severity::Critical => 1.0,
            Severity::High => 0.8,
            Severity::Medium => 0.6,
            Severity::Low => 0.4,
            Severity::Unspecified => 0.5,
        }
    }

    /// Rank from 1 (critical) to 5 (unspecified), used for per-task priority.
    pub fn rank(&self) -> i64 {
        match self {
            Severity::Critical => 1,
            Severity::High => 2,
            Severity::Medium => 3,
            Severity::Low => 4,
            Severity::Unspecified => 5,
        }
    }

    /// Notification channels used for this severity.
    pub fn channels(&self) -> Vec<Channel> {
        match self {
            Severity::Critical => vec![Channel::Sms, Channel::Im, Channel::Email],
            Severity::High => vec![Channel::Im, Channel::Email],
            Severity::Medium | Severity::Low | Severity::Unspecified => vec![Channel::Email],
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Severity::Critical => "CRITICAL",
            Severity::High => "HIGH",
            Severity::Medium => "MEDIUM",
            Severity::Low => "LOW",
            Severity::Unspecified => "UNSPECIFIED",
        }
    }
}

/// Broad grouping of alert types that drives the lookup tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertCategory {
    /// Heart rate, blood pressure, oxygen, temperature.
    Vitals,
    /// Falls and SOS button presses.
    Emergency,
    /// Device went offline.
    Connectivity,
    Other,
}

/// Kind of detected alert. Serialized as its upstream string code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AlertType {
    HeartRate,
    BloodPressure,
    BloodOxygen,
    BodyTemperature,
    FallDetection,
    Sos,
    DeviceOffline,
    LowBattery,
    Geofence,
    Other(String),
}

impl AlertType {
    pub fn code(&self) -> &str {
        match self {
            AlertType::HeartRate => "HEART_RATE",
            AlertType::BloodPressure => "BLOOD_PRESSURE",
            AlertType::BloodOxygen => "BLOOD_OXYGEN",
            AlertType::BodyTemperature => "BODY_TEMPERATURE",
            AlertType::FallDetection => "FALL_DETECTION",
            AlertType::Sos => "SOS",
            AlertType::DeviceOffline => "DEVICE_OFFLINE",
            AlertType::LowBattery => "LOW_BATTERY",
            AlertType::Geofence => "GEOFENCE",
            AlertType::Other(code) => code,
        }
    }

    pub fn category(&self) -> AlertCategory {
        match self {
            AlertType::HeartRate
            | AlertType::BloodPressure
            | AlertType::BloodOxygen
            | AlertType::BodyTemperature => AlertCategory::Vitals,
            AlertType::FallDetection | AlertType::Sos => AlertCategory::Emergency,
            AlertType::DeviceOffline => AlertCategory::Connectivity,
            AlertType::LowBattery | AlertType::Geofence | AlertType::Other(_) => {
                AlertCategory::Other
            }
        }
    }
}

impl From<String> for AlertType {
    fn from(code: String) -> Self {
        match code.to_ascii_uppercase().as_str() {
            "HEART_RATE" => AlertType::HeartRate,
            "BLOOD_PRESSURE" => AlertType::BloodPressure,
            "BLOOD_OXYGEN" => AlertType::BloodOxygen,
            "BODY_TEMPERATURE" => AlertType::BodyTemperature,
            "FALL_DETECTION" => AlertType::FallDetection,
            "SOS" => AlertType::Sos,
            "DEVICE_OFFLINE" => AlertType::DeviceOffline,
            "LOW_BATTERY" => AlertType::LowBattery,
            "GEOFENCE" => AlertType::Geofence,
            _ => AlertType::Other(code),
        }
    }
}

impl From<AlertType> for String {
    fn from(alert_type: AlertType) -> Self {
        alert_type.code().to_string()
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

fn generate_alert_id() -> String {
    Uuid::new_v4().to_string()
}

/// A raw, validated alert from the upstream ingestion service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertIntake {
    /// Upstream alert identifier. Generated as a UUID v4 when absent.
    #[serde(default = "generate_alert_id")]
    pub alert_id: String,

    pub alert_type: AlertType,

    /// Serial number of the reporting device.
    pub device_sn: String,

    /// Detection time.
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub description: String,

    pub severity: Severity,

    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub rule_id: Option<String>,

    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

impl AlertIntake {
    /// Coordinates, when both are present.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }
}

/// How quickly someone should act on an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UrgencyLevel {
    Low,
    Medium,
    High,
}

/// An intake enriched with confidence, urgency and recommendations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzedAlert {
    #[serde(flatten)]
    pub intake: AlertIntake,

    /// Confidence that the alert is real, in `[0, 1]`.
    pub confidence_score: f64,

    pub urgency_level: UrgencyLevel,

    /// Estimated false positive probability, in `[0, 1]`.
    pub false_positive_probability: f64,

    /// Whether the alert can be handled without human confirmation.
    pub auto_processable: bool,

    pub recommended_actions: Vec<String>,

    /// Context returned by collaborators (device health, alert frequency, patterns).
    #[serde(default)]
    pub context_data: Map<String, Value>,

    #[serde(default)]
    pub calculation_breakdown: BTreeMap<String, f64>,
}

impl AnalyzedAlert {
    pub fn alert_id(&self) -> &str {
        &self.intake.alert_id
    }

    pub fn severity(&self) -> Severity {
        self.intake.severity
    }
}

/// One organizational level in an escalation chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationStep {
    /// Organizational depth.
    pub level: u32,
    pub org_id: String,
    pub org_name: String,
    /// Distinct manager user ids at this depth.
    pub manager_ids: Vec<String>,
    pub delay_minutes: i64,
}

/// Output of the priority calculator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityInfo {
    /// 1 (most urgent) to 10 (least urgent).
    pub priority: u8,
    pub processing_deadline: DateTime<Utc>,
    /// Sorted by ascending depth.
    pub escalation_chain: Vec<EscalationStep>,
    #[serde(default)]
    pub calculation_breakdown: BTreeMap<String, f64>,
}

/// A member of the organization hierarchy relevant to an alert.
///
/// Supplied by an external provider and never modified here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgHierarchyInfo {
    pub user_id: String,
    pub org_id: String,
    pub org_name: String,
    pub depth: u32,
    /// Whether this member is a principal (manager) of the org.
    pub principal: bool,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub user_name: String,
}

/// Recipients grouped by depth, with per-depth escalation delays.
#[derive(Debug, Clone, Serialize)]
pub struct DistributionPlan {
    pub id: Uuid,
    pub recipients_by_level: BTreeMap<u32, Vec<OrgHierarchyInfo>>,
    /// Minutes to wait before notifying each depth.
    pub escalation_delays: BTreeMap<u32, i64>,
    pub estimated_delivery_seconds: u64,
}

impl DistributionPlan {
    pub fn total_recipients(&self) -> usize {
        self.recipients_by_level.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecipientType {
    Manager,
    Member,
}

/// Delivery channel for a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Sms,
    Im,
    Email,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Dispatched,
    Failed,
}

impl TaskStatus {
    pub fn code(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Dispatched => "DISPATCHED",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "PENDING" => Some(TaskStatus::Pending),
            "DISPATCHED" => Some(TaskStatus::Dispatched),
            "FAILED" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

/// Alert fields copied onto each task so the dispatcher needs no lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSnapshot {
    pub alert_type: AlertType,
    pub severity: Severity,
    pub device_sn: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub recommended_actions: Vec<String>,
}

/// Recipient fields copied onto each task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientSnapshot {
    pub user_name: String,
    pub org_id: String,
    pub org_name: String,
    pub depth: u32,
    pub phone: Option<String>,
    pub email: Option<String>,
}

/// One notification to one recipient for one alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationTask {
    pub task_id: Uuid,
    pub alert_id: String,
    pub recipient_id: String,
    pub recipient_type: RecipientType,
    /// 1 (most urgent) to 10.
    pub priority: u8,
    pub channels: Vec<Channel>,
    pub delivery_deadline: DateTime<Utc>,
    pub escalation_delay_minutes: i64,
    pub alert: AlertSnapshot,
    pub recipient: RecipientSnapshot,
    pub created_at: DateTime<Utc>,
    pub status: TaskStatus,
    /// Failed dispatch attempts so far. The worker requeues a failed task
    /// until this reaches its retry limit.
    pub retry_count: u32,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl NotificationTask {
    /// Identity used to suppress redundant notifications.
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            alert_id: self.alert_id.clone(),
            recipient_id: self.recipient_id.clone(),
        }
    }

    /// Distribution this task was generated for, if recorded in its metadata.
    pub fn distribution_id(&self) -> Option<&str> {
        self.metadata.get("distribution_id").map(String::as_str)
    }
}

/// Composite identity `(alert_id, recipient_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub alert_id: String,
    pub recipient_id: String,
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.alert_id, self.recipient_id)
    }
}

/// Returned by `distribute` once tasks are enqueued.
#[derive(Debug, Clone, Serialize)]
pub struct DistributionResult {
    pub distribution_id: Uuid,
    pub total_recipients: usize,
    /// Tasks admitted by the queue (duplicates excluded).
    pub admitted_tasks: usize,
    pub estimated_delivery_time: DateTime<Utc>,
    pub tracking_ref: String,
}

/// Snapshot of queue occupancy and counters.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    /// Lane lengths, index 0 is priority 1.
    pub per_lane_length: Vec<usize>,
    pub total_length: usize,
    pub processed_count: u64,
    pub duplicate_count: u64,
    pub rejected_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_priority() {
        assert_eq!(clamp_priority(-3), 1);
        assert_eq!(clamp_priority(0), 1);
        assert_eq!(clamp_priority(7), 7);
        assert_eq!(clamp_priority(42), 10);
    }

    #[test]
    fn test_severity_unknown_deserializes_to_unspecified() {
        let severity: Severity = serde_json::from_str("\"INFO\"").unwrap();
        assert_eq!(severity, Severity::Unspecified);
        assert_eq!(severity.base_score(), 0.5);
        assert_eq!(severity.rank(), 5);
    }

    #[test]
    fn test_severity_channels() {
        assert_eq!(Severity::Critical.channels().len(), 3);
        assert_eq!(
            Severity::High.channels(),
            vec![Channel::Im, Channel::Email]
        );
        assert_eq!(Severity::Low.channels(), vec![Channel::Email]);
    }

    #[test]
    fn test_alert_type_codes() {
        let parsed: AlertType = serde_json::from_str("\"heart_rate\"").unwrap();
        assert_eq!(parsed, AlertType::HeartRate);
        assert_eq!(parsed.category(), AlertCategory::Vitals);

        let other: AlertType = serde_json::from_str("\"DOOR_OPEN\"").unwrap();
        assert_eq!(other, AlertType::Other("DOOR_OPEN".to_string()));
        assert_eq!(serde_json::to_string(&other).unwrap(), "\"DOOR_OPEN\"");
        assert_eq!(AlertType::Sos.category(), AlertCategory::Emergency);
    }

    #[test]
    fn test_intake_generates_alert_id() {
        let intake: AlertIntake = serde_json::from_value(serde_json::json!({
            "alert_type": "SOS",
            "device_sn": "DEV-1",
            "timestamp": "2024-03-05T10:00:00Z",
            "severity": "HIGH"
        }))
        .unwrap();

        assert!(Uuid::parse_str(&intake.alert_id).is_ok());
        assert!(intake.coordinates().is_none());
        assert!(intake.description.is_empty());
    }
}
