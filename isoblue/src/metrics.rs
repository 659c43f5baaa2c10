use std::ops::Sub;
use std::sync::atomic::{AtomicU64, Ordering};

/// Protocol-level counters for one device
/// (frames and messages, not anything decoded from the payloads)
#[derive(Debug, Default)]
pub struct DeviceMetrics {
    frames_received: AtomicU64,
    frames_discarded: AtomicU64,
    messages_delivered: AtomicU64,
    messages_dropped: AtomicU64,
    replays_out_of_window: AtomicU64,
    commands_sent: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time copy of [`DeviceMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Lines read from the bridge
    pub frames_received: u64,
    /// Lines that failed to decode and were dropped
    pub frames_discarded: u64,
    /// Messages queued on a socket
    pub messages_delivered: u64,
    /// Messages lost because a socket queue was full
    pub messages_dropped: u64,
    /// Replayed messages outside a buffered socket's window
    pub replays_out_of_window: u64,
    pub commands_sent: u64,
    pub reconnects: u64,
}

impl DeviceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_discarded(&self) {
        self.frames_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn message_delivered(&self) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn replay_out_of_window(&self) {
        self.replays_out_of_window.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn command_sent(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reconnected(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            replays_out_of_window: self.replays_out_of_window.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

impl Sub for MetricsSnapshot {
    type Output = MetricsSnapshot;

    /// Counters only grow, so this is the activity between two snapshots.
    fn sub(self, earlier: MetricsSnapshot) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_received: self.frames_received.saturating_sub(earlier.frames_received),
            frames_discarded: self.frames_discarded.saturating_sub(earlier.frames_discarded),
            messages_delivered: self.messages_delivered.saturating_sub(earlier.messages_delivered),
            messages_dropped: self.messages_dropped.saturating_sub(earlier.messages_dropped),
            replays_out_of_window: self
                .replays_out_of_window
                .saturating_sub(earlier.replays_out_of_window),
            commands_sent: self.commands_sent.saturating_sub(earlier.commands_sent),
            reconnects: self.reconnects.saturating_sub(earlier.reconnects),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_metrics_are_zero() {
        let metrics = DeviceMetrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_counters_accumulate() {
        let metrics = DeviceMetrics::new();
        metrics.frame_received();
        metrics.frame_received();
        metrics.frame_discarded();
        metrics.message_delivered();
        metrics.message_dropped();
        metrics.replay_out_of_window();
        metrics.command_sent();
        metrics.reconnected();

        let snap = metrics.snapshot();
        assert_eq!(snap.frames_received, 2);
        assert_eq!(snap.frames_discarded, 1);
        assert_eq!(snap.messages_delivered, 1);
        assert_eq!(snap.messages_dropped, 1);
        assert_eq!(snap.replays_out_of_window, 1);
        assert_eq!(snap.commands_sent, 1);
        assert_eq!(snap.reconnects, 1);
    }

    #[test]
    fn test_snapshot_delta() {
        let metrics = DeviceMetrics::new();
        metrics.frame_received();
        let before = metrics.snapshot();
        metrics.frame_received();
        metrics.frame_received();
        metrics.command_sent();

        let delta = metrics.snapshot() - before;
        assert_eq!(delta.frames_received, 2);
        assert_eq!(delta.commands_sent, 1);
        assert_eq!(delta.reconnects, 0);
    }
}
