use isoblue::{BusKind, DeviceConfig, InvalidPgn, Pgn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// host:port of the serial-to-TCP gateway in front of the bridge
    pub bridge_address: String,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub replay: Option<ReplayConfig>,
    #[serde(default)]
    pub source_filter: SourceFilterConfig,
    #[serde(default)]
    pub logging: LogConfig,
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_seconds: u64,
}

fn default_metrics_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Directory where log files will be stored
    pub directory: String,
    /// Log file name prefix (date will be appended)
    pub file_prefix: String,
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: "./logs".to_string(),
            file_prefix: "isoblue_router".to_string(),
            level: "info".to_string(),
        }
    }
}

/// PGNs to open a socket for, per bus. A bus with no entry gets no socket;
/// an empty list opens an unfiltered one.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FilterConfig {
    #[serde(default)]
    pub engine: Option<Vec<u32>>,
    #[serde(default)]
    pub implement: Option<Vec<u32>>,
}

impl FilterConfig {
    pub fn raw(&self, bus: BusKind) -> Option<&[u32]> {
        match bus {
            BusKind::Engine => self.engine.as_deref(),
            BusKind::Implement => self.implement.as_deref(),
        }
    }

    /// Validated PGNs for `bus`, `None` when no socket is wanted there
    pub fn pgns(&self, bus: BusKind) -> Result<Option<Vec<Pgn>>, InvalidPgn> {
        self.raw(bus)
            .map(|values| values.iter().map(|&v| Pgn::new(v)).collect::<Result<Vec<_>, _>>())
            .transpose()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// First stored message id to replay
    pub from_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SourceFilterConfig {
    /// Map of PGN to allowed source address
    /// If a PGN is present in this map, only messages from the specified source will be accepted
    /// If a PGN is not in the map, all sources are accepted
    #[serde(default)]
    pub pgn_source_map: std::collections::HashMap<u32, u8>,
}

impl SourceFilterConfig {
    /// Check if a message should be accepted based on its PGN and source
    pub fn should_accept(&self, pgn: u32, source: u8) -> bool {
        match self.pgn_source_map.get(&pgn) {
            Some(&allowed_source) => source == allowed_source,
            None => true,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.bridge_address.trim().is_empty() {
            return Err("bridge_address must not be empty".into());
        }
        for bus in BusKind::ALL {
            self.filters
                .pgns(bus)
                .map_err(|e| format!("{} filter: {}", bus, e))?;
        }
        if self.metrics_interval_seconds == 0 {
            return Err("metrics_interval_seconds must be at least 1".into());
        }
        Ok(())
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_seconds)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bridge_address: "127.0.0.1:7000".to_string(),
            device: DeviceConfig::default(),
            filters: FilterConfig {
                engine: Some(Vec::new()),
                implement: Some(Vec::new()),
            },
            replay: None,
            source_filter: SourceFilterConfig::default(),
            logging: LogConfig::default(),
            metrics_interval_seconds: default_metrics_interval(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isoblue::OverflowPolicy;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.bridge_address, "127.0.0.1:7000");
        assert_eq!(config.metrics_interval(), Duration::from_secs(60));
        assert!(config.replay.is_none());
        assert_eq!(config.filters.pgns(BusKind::Engine).unwrap(), Some(Vec::new()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_source_filter_no_filter() {
        let filter = SourceFilterConfig::default();
        assert!(filter.should_accept(61444, 10));
        assert!(filter.should_accept(65096, 22));
    }

    #[test]
    fn test_source_filter_with_filter() {
        let mut filter = SourceFilterConfig::default();
        filter.pgn_source_map.insert(61444, 0);
        filter.pgn_source_map.insert(65096, 0x26);

        assert!(filter.should_accept(61444, 0));
        assert!(!filter.should_accept(61444, 0x26));
        assert!(filter.should_accept(65096, 0x26));
        assert!(!filter.should_accept(65096, 0));

        // No filter for this PGN
        assert!(filter.should_accept(65267, 10));
    }

    #[test]
    fn test_config_deserialization() {
        let json = r#"{
            "bridge_address": "192.168.4.1:7000",
            "device": {
                "reconnect_backoff_ms": 250,
                "overflow_policy": "block"
            },
            "filters": {
                "engine": [61444, 65262]
            },
            "replay": { "from_id": 1 },
            "source_filter": {
                "pgn_source_map": { "61444": 0 }
            },
            "metrics_interval_seconds": 30
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.bridge_address, "192.168.4.1:7000");
        assert_eq!(config.device.reconnect_backoff_ms, 250);
        assert_eq!(config.device.overflow_policy, OverflowPolicy::Block);
        assert_eq!(config.device.socket_queue_capacity, 1024);
        assert_eq!(
            config.filters.pgns(BusKind::Engine).unwrap(),
            Some(vec![Pgn::new(61444).unwrap(), Pgn::new(65262).unwrap()])
        );
        assert_eq!(config.filters.pgns(BusKind::Implement).unwrap(), None);
        assert_eq!(config.replay.as_ref().map(|r| r.from_id), Some(1));
        assert!(!config.source_filter.should_accept(61444, 3));
        assert_eq!(config.metrics_interval(), Duration::from_secs(30));
        assert_eq!(config.logging.file_prefix, "isoblue_router");
    }

    #[test]
    fn test_invalid_filter_pgn_rejected() {
        let json = r#"{
            "bridge_address": "bridge:7000",
            "filters": { "implement": [61444, 59905] }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("implement"));
    }

    #[test]
    fn test_empty_bridge_address_rejected() {
        let config = Config {
            bridge_address: " ".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_config_serialization() {
        let log_config = LogConfig {
            directory: "/var/log/isoblue".to_string(),
            file_prefix: "router".to_string(),
            level: "debug".to_string(),
        };

        let json = serde_json::to_string(&log_config).unwrap();
        let deserialized: LogConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.directory, "/var/log/isoblue");
        assert_eq!(deserialized.file_prefix, "router");
        assert_eq!(deserialized.level, "debug");
    }
}
