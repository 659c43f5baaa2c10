use std::sync::Arc;

use chrono::SecondsFormat;
use isoblue::{BusKind, Message, MessageSink};
use tracing::trace;

use crate::app_metrics::AppMetrics;

/// Bridge time of a message for log lines, `-` when it has none
pub fn format_time(message: &Message) -> String {
    message
        .time()
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true))
        .unwrap_or_else(|| "-".to_string())
}

/// Sink counting and tracing every live message the device decodes
pub struct MessageLogger {
    metrics: Arc<AppMetrics>,
}

impl MessageLogger {
    pub fn new(metrics: Arc<AppMetrics>) -> Self {
        Self { metrics }
    }
}

impl MessageSink for MessageLogger {
    fn on_message(&self, bus: BusKind, message: &Message) {
        self.metrics.live_message();
        trace!("[{}] {} at {}", bus, message, format_time(message));
    }
}
