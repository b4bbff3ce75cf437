use crate::domain::events::AlertCategory;
use async_trait::async_trait;

/// Delivery of user-facing alerts. Display itself (notification center,
/// menu bar badge) lives outside the core; this is only the hand-off.
#[async_trait]
pub trait AlertSink: Send + Sync + 'static {
    async fn send(&self, title: &str, body: &str, category: AlertCategory);
}

/// Default sink that surfaces alerts through the log stream.
#[derive(Debug, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, title: &str, body: &str, category: AlertCategory) {
        tracing::warn!(title, body, category = ?category, "User alert");
    }
}

/// Sink used when the user has disabled notifications.
#[derive(Debug, Default)]
pub struct NoopAlertSink;

#[async_trait]
impl AlertSink for NoopAlertSink {
    async fn send(&self, _title: &str, _body: &str, _category: AlertCategory) {}
}
