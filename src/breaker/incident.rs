use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;

use crate::error::RecoveryError;

/// Incident severity, stored as text in `costsim_cb_incidents`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = RecoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(RecoveryError::configuration(
                "severity",
                format!("Unknown severity: {other}"),
            )),
        }
    }
}

/// Append-mostly audit record for a breaker trip. The causal fields (name,
/// reason, timestamp) are immutable once written; only resolution and alert
/// fields are ever updated afterward.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Incident {
    pub id: i64,
    pub circuit_breaker_name: String,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub severity: String,
    pub drift_score: Option<f64>,
    pub sample_count: Option<i32>,
    pub details: serde_json::Value,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,
    pub alert_sent: bool,
    pub alert_sent_at: Option<DateTime<Utc>>,
    pub alert_response: Option<String>,
}

/// Payload for a new incident, captured at trip time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewIncident {
    pub reason: String,
    pub severity: Severity,
    pub drift_score: Option<f64>,
    pub sample_count: Option<i32>,
    pub details: serde_json::Value,
}

impl NewIncident {
    pub fn new(reason: impl Into<String>, severity: Severity) -> Self {
        Self {
            reason: reason.into(),
            severity,
            drift_score: None,
            sample_count: None,
            details: serde_json::json!({}),
        }
    }

    pub fn with_drift(mut self, drift_score: f64, sample_count: i32) -> Self {
        self.drift_score = Some(drift_score);
        self.sample_count = Some(sample_count);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}
