use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{ReporterError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum GenerationStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "PROCESSING")]
    Processing,
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "ABORTED")]
    Aborted,
}

impl GenerationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GenerationStatus::Success | GenerationStatus::Error | GenerationStatus::Aborted
        )
    }
}

/// Message body placed on the generation queue by producers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub id: String,
    pub task_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub targets: Vec<String>,
    pub origin: String,
    pub write_activity: bool,
}

impl GenerationRequest {
    pub fn new(
        task_id: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        targets: Vec<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            start,
            end,
            targets,
            origin: origin.into(),
            write_activity: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(ReporterError::internal("generation request without id"));
        }
        if self.targets.is_empty() || self.targets.iter().any(|t| t.is_empty()) {
            return Err(ReporterError::internal(format!(
                "generation {} has empty target list or blank target",
                self.id
            )));
        }
        if self.end < self.start {
            return Err(ReporterError::internal(format!(
                "generation {} has end before start",
                self.id
            )));
        }
        Ok(())
    }
}

/// Lifecycle record of one report generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub id: String,
    pub task_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub targets: Vec<String>,
    pub status: GenerationStatus,
    /// 0-100 while running / terminal, None while PENDING.
    pub progress: Option<u8>,
    /// Wall time of the generation in milliseconds, None until a
    /// terminal state is reached.
    pub took_ms: Option<u64>,
    pub cause: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Generation {
    pub fn pending(request: &GenerationRequest) -> Self {
        let now = Utc::now();
        Self {
            id: request.id.clone(),
            task_id: request.task_id.clone(),
            start: request.start,
            end: request.end,
            targets: request.targets.clone(),
            status: GenerationStatus::Pending,
            progress: None,
            took_ms: None,
            cause: None,
            created_at: now,
            started_at: None,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = GenerationStatus::Processing;
        self.progress = Some(0);
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.updated_at = now;
    }

    pub fn mark_success(&mut self, took_ms: u64, now: DateTime<Utc>) {
        self.status = GenerationStatus::Success;
        self.progress = Some(100);
        self.took_ms = Some(took_ms);
        self.updated_at = now;
    }

    pub fn mark_error(&mut self, cause: impl Into<String>, took_ms: u64, now: DateTime<Utc>) {
        self.status = GenerationStatus::Error;
        self.took_ms = Some(took_ms);
        self.cause = Some(cause.into());
        self.updated_at = now;
    }

    pub fn mark_aborted(&mut self, now: DateTime<Utc>) {
        self.status = GenerationStatus::Aborted;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> GenerationRequest {
        GenerationRequest::new(
            "task-7",
            Utc::now() - chrono::Duration::days(1),
            Utc::now(),
            vec!["ops@example.org".to_string()],
            "cron",
        )
    }

    #[test]
    fn test_pending_has_null_progress_and_took() {
        let generation = Generation::pending(&request());
        assert_eq!(generation.status, GenerationStatus::Pending);
        assert!(generation.progress.is_none());
        assert!(generation.took_ms.is_none());
        assert!(generation.started_at.is_none());
    }

    #[test]
    fn test_lifecycle_to_success() {
        let mut generation = Generation::pending(&request());
        let now = Utc::now();
        generation.mark_processing(now);
        assert_eq!(generation.status, GenerationStatus::Processing);
        assert_eq!(generation.progress, Some(0));
        assert_eq!(generation.started_at, Some(now));

        generation.mark_success(1200, Utc::now());
        assert!(generation.is_terminal());
        assert_eq!(generation.progress, Some(100));
        assert_eq!(generation.took_ms, Some(1200));
    }

    #[test]
    fn test_error_records_cause() {
        let mut generation = Generation::pending(&request());
        generation.mark_processing(Utc::now());
        generation.mark_error("renderer crashed", 300, Utc::now());
        assert_eq!(generation.status, GenerationStatus::Error);
        assert_eq!(generation.cause.as_deref(), Some("renderer crashed"));
    }

    #[test]
    fn test_status_serde_uses_screaming_names() {
        let json = serde_json::to_string(&GenerationStatus::Processing).unwrap();
        assert_eq!(json, "\"PROCESSING\"");
        let status: GenerationStatus = serde_json::from_str("\"ABORTED\"").unwrap();
        assert_eq!(status, GenerationStatus::Aborted);
    }

    #[test]
    fn test_request_validation() {
        let mut req = request();
        assert!(req.validate().is_ok());

        req.targets.clear();
        assert!(req.validate().is_err());

        let mut req = request();
        req.targets.push(String::new());
        assert!(req.validate().is_err());
    }
}
