use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

use isoblue::MetricsSnapshot;

/// Host-side counters, next to the device's own protocol counters
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Live messages seen by the sink
    live_messages: AtomicU64,
    /// Messages read from the configured sockets
    socket_messages: AtomicU64,
    /// Socket messages skipped by the source filter
    filtered_messages: AtomicU64,
    /// Messages read from the replay sockets
    replayed_messages: AtomicU64,
}

/// Host counters for one interval
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppCounts {
    pub live_messages: u64,
    pub socket_messages: u64,
    pub filtered_messages: u64,
    pub replayed_messages: u64,
}

impl AppMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_message(&self) {
        self.live_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn socket_message(&self) {
        self.socket_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn filtered_message(&self) {
        self.filtered_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn replayed_message(&self) {
        self.replayed_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Read and reset all counters
    pub fn take(&self) -> AppCounts {
        AppCounts {
            live_messages: self.live_messages.swap(0, Ordering::Relaxed),
            socket_messages: self.socket_messages.swap(0, Ordering::Relaxed),
            filtered_messages: self.filtered_messages.swap(0, Ordering::Relaxed),
            replayed_messages: self.replayed_messages.swap(0, Ordering::Relaxed),
        }
    }
}

/// Manages periodic logging of application and device metrics
pub struct MetricsLogger {
    last_log: Instant,
    log_interval: Duration,
    last_device: MetricsSnapshot,
}

impl MetricsLogger {
    pub fn new(log_interval: Duration) -> Self {
        Self {
            last_log: Instant::now(),
            log_interval,
            last_device: MetricsSnapshot::default(),
        }
    }

    /// Log the counts since the previous call if the interval has passed.
    /// Returns true if metrics were logged
    pub fn check_and_log(&mut self, app: &AppMetrics, device: MetricsSnapshot) -> bool {
        if self.last_log.elapsed() < self.log_interval {
            return false;
        }
        let counts = app.take();
        let delta = device - self.last_device;
        info!(
            "[Metrics] Frames: {} ({} discarded), Delivered: {}, Dropped: {}, Out of window: {}, Commands: {}, Reconnects: {}, Live: {}, Socket: {} ({} filtered), Replayed: {}",
            delta.frames_received,
            delta.frames_discarded,
            delta.messages_delivered,
            delta.messages_dropped,
            delta.replays_out_of_window,
            delta.commands_sent,
            delta.reconnects,
            counts.live_messages,
            counts.socket_messages,
            counts.filtered_messages,
            counts.replayed_messages
        );
        self.last_device = device;
        self.last_log = Instant::now();
        true
    }
}
