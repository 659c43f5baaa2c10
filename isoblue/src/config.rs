use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What a bus does when a socket's inbound queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the new message and count it. The reader task never stalls.
    #[default]
    DropNewest,
    /// Wait for the consumer. A slow socket stalls every socket on the device.
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Delay between reconnect attempts
    pub reconnect_backoff_ms: u64,
    /// Commands that may wait for the writer before senders block
    pub outbound_queue_capacity: usize,
    /// Messages each socket buffers before the overflow policy applies
    pub socket_queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// Pairing credential set on the bridge during the handshake
    pub credential: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff_ms: 100,
            outbound_queue_capacity: 256,
            socket_queue_capacity: 1024,
            overflow_policy: OverflowPolicy::DropNewest,
            credential: Some("0000".to_string()),
        }
    }
}

impl DeviceConfig {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_config_default() {
        let config = DeviceConfig::default();
        assert_eq!(config.reconnect_backoff(), Duration::from_millis(100));
        assert_eq!(config.outbound_queue_capacity, 256);
        assert_eq!(config.socket_queue_capacity, 1024);
        assert_eq!(config.overflow_policy, OverflowPolicy::DropNewest);
        assert_eq!(config.credential.as_deref(), Some("0000"));
    }

    #[test]
    fn test_device_config_partial_deserialization() {
        let json = r#"{ "reconnect_backoff_ms": 250, "overflow_policy": "block" }"#;
        let config: DeviceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.reconnect_backoff_ms, 250);
        assert_eq!(config.overflow_policy, OverflowPolicy::Block);
        assert_eq!(config.socket_queue_capacity, 1024);
    }

    #[test]
    fn test_device_config_without_credential() {
        let json = r#"{ "credential": null }"#;
        let config: DeviceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.credential, None);
    }
}
