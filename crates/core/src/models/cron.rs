use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CronTimerState {
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "STOPPED")]
    Stopped,
}

/// Snapshot of one named scheduler timer, as returned by the cron
/// control procedures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronTimerInfo {
    pub name: String,
    pub state: CronTimerState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serde_names() {
        assert_eq!(
            serde_json::to_string(&CronTimerState::Running).unwrap(),
            "\"RUNNING\""
        );
        let state: CronTimerState = serde_json::from_str("\"STOPPED\"").unwrap();
        assert_eq!(state, CronTimerState::Stopped);
    }
}
