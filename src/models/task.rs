use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Source;
use crate::error::AppError;

/// A unit of work placed on the queue by a trigger or the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskSpec {
    /// Refresh one source for one owner.
    Refresh { source: Source, owner_id: i64 },
    /// Refresh one source for every owner with an applicable category.
    RefreshAll { source: Source },
    /// Age-based retention purge.
    Purge { max_age_hours: u64 },
}

impl TaskSpec {
    pub fn name(&self) -> String {
        match self {
            TaskSpec::Refresh { source, .. } => format!("refresh:{}", source),
            TaskSpec::RefreshAll { source } => format!("refresh_all:{}", source),
            TaskSpec::Purge { .. } => "purge".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(AppError::Validation(format!("unknown task status '{}'", other))),
        }
    }
}

/// What `taskStatus` returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub spec: TaskSpec,
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_serializes_with_type_tag() {
        let spec = TaskSpec::Refresh {
            source: Source::Reddit,
            owner_id: 7,
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["type"], "refresh");
        assert_eq!(json["source"], "reddit");
        assert_eq!(json["owner_id"], 7);
        let back: TaskSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }
}
