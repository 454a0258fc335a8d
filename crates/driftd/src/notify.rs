//! Notification sink - alerts on severity-crossing transitions.
//!
//! The engine does not know or care how alerts are delivered; it talks to
//! one `Notifier` object constructed at startup. `SeverityGate` applies the
//! configured threshold so callers can always notify unconditionally.

use async_trait::async_trait;
use drift_common::types::Severity;
use std::sync::Arc;
use tracing::{error, info, warn};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event_type: &str, message: &str, severity: Severity, source: &str);
}

/// Default sink: structured log lines, picked up by the host's log shipper.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event_type: &str, message: &str, severity: Severity, source: &str) {
        match severity {
            Severity::Critical => error!("[{}] {} ({}): {}", severity, event_type, source, message),
            Severity::High => warn!("[{}] {} ({}): {}", severity, event_type, source, message),
            _ => info!("[{}] {} ({}): {}", severity, event_type, source, message),
        }
    }
}

/// Forwards only notifications at or above the configured threshold.
pub struct SeverityGate {
    inner: Arc<dyn Notifier>,
    threshold: Severity,
}

impl SeverityGate {
    pub fn new(inner: Arc<dyn Notifier>, threshold: Severity) -> Self {
        Self { inner, threshold }
    }
}

#[async_trait]
impl Notifier for SeverityGate {
    async fn notify(&self, event_type: &str, message: &str, severity: Severity, source: &str) {
        if severity >= self.threshold {
            self.inner.notify(event_type, message, severity, source).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording {
        calls: Mutex<Vec<(String, Severity)>>,
    }

    #[async_trait]
    impl Notifier for Recording {
        async fn notify(&self, event_type: &str, _message: &str, severity: Severity, _source: &str) {
            self.calls
                .lock()
                .unwrap()
                .push((event_type.to_string(), severity));
        }
    }

    #[tokio::test]
    async fn test_gate_filters_below_threshold() {
        let recording = Arc::new(Recording {
            calls: Mutex::new(vec![]),
        });
        let gate = SeverityGate::new(recording.clone(), Severity::High);

        gate.notify("drift_detected", "low noise", Severity::Low, "driftd").await;
        gate.notify("drift_detected", "medium noise", Severity::Medium, "driftd").await;
        gate.notify("drift_detected", "web down", Severity::Critical, "driftd").await;

        let calls = recording.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, Severity::Critical);
    }

    #[tokio::test]
    async fn test_gate_passes_at_threshold() {
        let recording = Arc::new(Recording {
            calls: Mutex::new(vec![]),
        });
        let gate = SeverityGate::new(recording.clone(), Severity::High);
        gate.notify("drift_detected", "config drift", Severity::High, "driftd").await;
        assert_eq!(recording.calls.lock().unwrap().len(), 1);
    }
}
