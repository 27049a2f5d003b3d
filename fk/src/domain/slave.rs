//! Slave identity, capabilities, and live status

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Role of a slave in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SlaveType {
    #[default]
    Worker,
    Gateway,
    Aggregator,
}

/// Live state of a slave as seen by the master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SlaveState {
    #[default]
    Online,
    Offline,
    Busy,
    /// Finishing in-flight tasks, refusing new assignments
    Draining,
}

impl std::fmt::Display for SlaveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
            Self::Busy => write!(f, "busy"),
            Self::Draining => write!(f, "draining"),
        }
    }
}

/// Resource caps advertised at registration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResourceCaps {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub max_vus: u32,
}

impl Default for ResourceCaps {
    fn default() -> Self {
        Self {
            cpu_cores: 1,
            memory_mb: 512,
            max_vus: 10,
        }
    }
}

/// Identity and capabilities of a slave
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SlaveInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub slave_type: SlaveType,
    pub address: String,
    /// Step types this slave can execute
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub caps: ResourceCaps,
}

impl SlaveInfo {
    /// Whether every required capability is advertised
    pub fn covers(&self, required: &[String]) -> bool {
        required.iter().all(|r| self.capabilities.contains(r))
    }

    /// Whether every selector `key=value` matches a label
    pub fn matches_labels(&self, selectors: &HashMap<String, String>) -> bool {
        selectors.iter().all(|(k, v)| self.labels.get(k) == Some(v))
    }
}

/// Live status carried on heartbeats
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SlaveStatus {
    pub state: SlaveState,
    /// Active VUs over max VUs, in `[0, 1]`
    pub load: f64,
    pub active_tasks: u32,
    /// Unix milliseconds; set by the master on receipt
    pub last_seen_ms: i64,
}

impl Default for SlaveStatus {
    fn default() -> Self {
        Self {
            state: SlaveState::Online,
            load: 0.0,
            active_tasks: 0,
            last_seen_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(caps: &[&str]) -> SlaveInfo {
        SlaveInfo {
            id: "slave-1".to_string(),
            slave_type: SlaveType::Worker,
            address: "127.0.0.1:0".to_string(),
            capabilities: caps.iter().map(|s| s.to_string()).collect(),
            labels: HashMap::from([("zone".to_string(), "eu".to_string())]),
            caps: ResourceCaps::default(),
        }
    }

    #[test]
    fn test_covers() {
        let s = info(&["http", "wait", "script"]);
        assert!(s.covers(&["http".to_string(), "wait".to_string()]));
        assert!(!s.covers(&["db_query".to_string()]));
        assert!(s.covers(&[]));
    }

    #[test]
    fn test_matches_labels() {
        let s = info(&["http"]);
        let mut sel = HashMap::new();
        assert!(s.matches_labels(&sel));
        sel.insert("zone".to_string(), "eu".to_string());
        assert!(s.matches_labels(&sel));
        sel.insert("zone".to_string(), "us".to_string());
        assert!(!s.matches_labels(&sel));
    }

    #[test]
    fn test_slave_info_wire_round_trip() {
        let s = info(&["http"]);
        let json = serde_json::to_string(&s).unwrap();
        let back: SlaveInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, s.id);
        assert_eq!(back.slave_type, s.slave_type);
        assert_eq!(back.capabilities, s.capabilities);
        assert_eq!(back.caps.max_vus, s.caps.max_vus);
        assert_eq!(back.labels, s.labels);
    }
}
