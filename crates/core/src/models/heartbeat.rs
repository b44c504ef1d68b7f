use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Liveness record broadcast by every service. `dependencies` holds the
/// reachability of the service's own mandatory dependencies at the time
/// of the beat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub service: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystems: Option<HashMap<String, bool>>,
    pub dependencies: HashMap<String, bool>,
}

impl HeartbeatRecord {
    pub fn new(
        service: impl Into<String>,
        version: impl Into<String>,
        dependencies: HashMap<String, bool>,
    ) -> Self {
        Self {
            service: service.into(),
            version: version.into(),
            timestamp: Utc::now(),
            filesystems: None,
            dependencies,
        }
    }

    /// A record is stale once it is older than the expected publish
    /// interval times the staleness factor (2x by default).
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        now - self.timestamp > stale_after
    }

    /// Names of mandatory dependencies that did not answer their ping.
    pub fn unreachable_dependencies(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .dependencies
            .iter()
            .filter(|(_, reachable)| !**reachable)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staleness_threshold() {
        let mut record = HeartbeatRecord::new("mail", "2.4.0", HashMap::new());
        let stale_after = chrono::Duration::seconds(30);
        let now = Utc::now();

        record.timestamp = now - chrono::Duration::seconds(29);
        assert!(!record.is_stale(now, stale_after));

        record.timestamp = now - chrono::Duration::seconds(31);
        assert!(record.is_stale(now, stale_after));
    }

    #[test]
    fn test_unreachable_dependencies_sorted() {
        let mut deps = HashMap::new();
        deps.insert("database".to_string(), false);
        deps.insert("broker".to_string(), true);
        deps.insert("filestore".to_string(), false);
        let record = HeartbeatRecord::new("api", "1.0.0", deps);
        assert_eq!(
            record.unreachable_dependencies(),
            vec!["database".to_string(), "filestore".to_string()]
        );
    }

    #[test]
    fn test_serde_skips_absent_filesystems() {
        let record = HeartbeatRecord::new("api", "1.0.0", HashMap::new());
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("filesystems"));
    }
}
