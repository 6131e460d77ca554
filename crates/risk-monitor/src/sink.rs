//! Alert delivery.

use anyhow::Result;
use async_trait::async_trait;
use guard_core::types::Alert;
use tracing::warn;

/// Destination for alerts that survived deduplication.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver one alert. Failures are logged by the caller and never stop
    /// the scan loop.
    async fn deliver(&self, alert: &Alert) -> Result<()>;
}

/// Writes alerts to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn deliver(&self, alert: &Alert) -> Result<()> {
        warn!(
            instrument = %alert.instrument,
            kind = %alert.kind,
            confidence = alert.confidence,
            first_seen = %alert.first_seen,
            payload = %alert.payload,
            "ALERT {}",
            alert.summary()
        );
        Ok(())
    }
}
