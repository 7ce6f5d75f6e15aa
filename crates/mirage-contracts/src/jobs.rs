use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::artifacts::GenerationMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    /// Wire statuses vary by backend generation; unknown strings are a
    /// contract violation and map to `None` rather than a guessed state.
    pub fn parse_wire(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" | "starting" => Some(Self::Pending),
            "processing" | "running" | "in_progress" => Some(Self::Processing),
            "completed" | "succeeded" | "success" => Some(Self::Completed),
            "failed" | "error" | "canceled" | "cancelled" => Some(Self::Failed),
            "timeout" | "timed_out" => Some(Self::TimedOut),
            _ => None,
        }
    }
}

/// One status snapshot from the backend for an in-flight task.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub progress: u8,
    pub result_artifact_id: Option<String>,
    pub message: Option<String>,
}

impl JobUpdate {
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let obj = value
            .as_object()
            .ok_or_else(|| "job status payload is not an object".to_string())?;
        let raw_status = obj
            .get("status")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| "job status payload missing 'status'".to_string())?;
        let status = JobStatus::parse_wire(raw_status)
            .ok_or_else(|| format!("unknown job status '{raw_status}'"))?;
        let progress = obj
            .get("progress")
            .and_then(Value::as_u64)
            .unwrap_or(match status {
                JobStatus::Completed => 100,
                _ => 0,
            })
            .min(100) as u8;
        Ok(Self {
            status,
            progress,
            result_artifact_id: obj
                .get("result_artifact_id")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string),
            message: obj
                .get("message")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub task_id: String,
    pub mode: GenerationMode,
    pub submitted_at: String,
    pub status: JobStatus,
    pub progress: u8,
    pub result_artifact_id: Option<String>,
}

impl GenerationJob {
    pub fn new(task_id: impl Into<String>, mode: GenerationMode, submitted_at: String) -> Self {
        Self {
            task_id: task_id.into(),
            mode,
            submitted_at,
            status: JobStatus::Pending,
            progress: 0,
            result_artifact_id: None,
        }
    }

    pub fn apply(&mut self, update: &JobUpdate) {
        self.status = update.status;
        self.progress = update.progress;
        if update.result_artifact_id.is_some() {
            self.result_artifact_id = update.result_artifact_id.clone();
        }
    }

    pub fn in_flight(&self) -> bool {
        !self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn wire_status_normalizes_aliases() {
        assert_eq!(JobStatus::parse_wire("Succeeded"), Some(JobStatus::Completed));
        assert_eq!(JobStatus::parse_wire("queued"), Some(JobStatus::Pending));
        assert_eq!(JobStatus::parse_wire("running"), Some(JobStatus::Processing));
        assert_eq!(JobStatus::parse_wire("exploded"), None);
    }

    #[test]
    fn terminal_statuses_are_exactly_three() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::TimedOut.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn update_from_value_defaults_progress_by_status() -> Result<(), String> {
        let update = JobUpdate::from_value(&json!({"status": "completed"}))?;
        assert_eq!(update.progress, 100);
        let update = JobUpdate::from_value(&json!({"status": "processing"}))?;
        assert_eq!(update.progress, 0);
        Ok(())
    }

    #[test]
    fn update_from_value_clamps_progress() -> Result<(), String> {
        let update = JobUpdate::from_value(&json!({"status": "processing", "progress": 250}))?;
        assert_eq!(update.progress, 100);
        Ok(())
    }

    #[test]
    fn update_from_value_rejects_unknown_status() {
        let err = JobUpdate::from_value(&json!({"status": "warming_up"}))
            .err()
            .unwrap_or_default();
        assert_eq!(err, "unknown job status 'warming_up'");
    }

    #[test]
    fn job_apply_keeps_result_id_once_set() {
        let mut job = GenerationJob::new("task_1", GenerationMode::Text, String::new());
        job.apply(&JobUpdate {
            status: JobStatus::Processing,
            progress: 40,
            result_artifact_id: Some("art_1".to_string()),
            message: None,
        });
        job.apply(&JobUpdate {
            status: JobStatus::Completed,
            progress: 100,
            result_artifact_id: None,
            message: None,
        });
        assert_eq!(job.result_artifact_id.as_deref(), Some("art_1"));
        assert!(!job.in_flight());
    }
}
