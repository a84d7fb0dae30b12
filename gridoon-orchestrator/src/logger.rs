use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    InProgress,
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::InProgress => "in_progress",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub id: Uuid,
    pub action_type: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip)]
    started: Instant,
}

/// Action log of one deployment run.
#[derive(Debug)]
pub struct SessionLogger {
    run_id: Uuid,
    records: Mutex<Vec<StepRecord>>,
}

impl Default for SessionLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLogger {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn records_mut(&self) -> MutexGuard<'_, Vec<StepRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open a step. Returns its log id for [`SessionLogger::log_event_complete`].
    pub fn log_event(&self, action_type: &str, metadata: Option<serde_json::Value>) -> Uuid {
        let log_id = Uuid::new_v4();
        self.records_mut().push(StepRecord {
            id: log_id,
            action_type: action_type.to_string(),
            status: StepStatus::InProgress,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            error_message: None,
            metadata,
            started: Instant::now(),
        });
        tracing::info!("📝 [deploy] Step {} started ({})", action_type, log_id);
        log_id
    }

    /// Close a step with its final status; metadata is merged over what was logged at start.
    pub fn log_event_complete(
        &self,
        log_id: Uuid,
        status: StepStatus,
        error_message: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) {
        let mut records = self.records_mut();
        let Some(record) = records.iter_mut().find(|r| r.id == log_id) else {
            tracing::warn!("⚠️ [deploy] Unknown step log id {}", log_id);
            return;
        };
        let duration_ms = record.started.elapsed().as_millis() as u64;
        record.status = status;
        record.completed_at = Some(Utc::now());
        record.duration_ms = Some(duration_ms);
        record.error_message = error_message.map(str::to_string);
        if let Some(extra) = metadata {
            record.metadata = Some(match record.metadata.take() {
                Some(serde_json::Value::Object(mut base)) => {
                    if let serde_json::Value::Object(extra) = extra {
                        base.extend(extra);
                        serde_json::Value::Object(base)
                    } else {
                        extra
                    }
                }
                _ => extra,
            });
        }
        match status {
            StepStatus::Failed => tracing::error!(
                "❌ [deploy] Step {} failed after {}ms: {}",
                record.action_type,
                duration_ms,
                error_message.unwrap_or("unknown error")
            ),
            _ => tracing::info!(
                "✅ [deploy] Step {} {} ({}ms)",
                record.action_type,
                status.as_str(),
                duration_ms
            ),
        }
    }

    /// One-off event such as a state transition.
    pub fn log_quick(&self, action_type: &str, details: Option<&str>) {
        let metadata = details.map(|d| serde_json::json!({ "details": d }));
        let id = self.log_event(action_type, metadata);
        self.log_event_complete(id, StepStatus::Success, None, None);
    }

    /// Record a step that does not apply to this run.
    pub fn log_skipped(&self, action_type: &str, reason: &str) {
        let id = self.log_event(action_type, Some(serde_json::json!({ "reason": reason })));
        self.log_event_complete(id, StepStatus::Skipped, None, None);
    }

    pub fn records(&self) -> Vec<StepRecord> {
        self.records_mut().clone()
    }
}
