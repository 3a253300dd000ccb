//! Alerting seam. Trips must be explained to operators, but how the alert is
//! delivered (pager, chat, email) belongs to the embedding service.

use crate::breaker::Incident;
use crate::error::Result;
use async_trait::async_trait;

/// External notification sink invoked after a breaker trips. The returned
/// string is stored as `alert_response` on the incident row.
///
/// Notification failure never fails the trip itself; the gate state and the
/// incident row have already committed by the time the sink runs.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, incident: &Incident) -> Result<String>;
}

/// Default sink that records nothing. Useful for tests and for deployments
/// that poll the incident table instead of pushing alerts.
#[derive(Debug, Default)]
pub struct NoopAlertSink;

#[async_trait]
impl AlertSink for NoopAlertSink {
    async fn notify(&self, _incident: &Incident) -> Result<String> {
        Ok("noop".to_string())
    }
}
