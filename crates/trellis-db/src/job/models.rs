use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Running,
    Finished,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Running => "running",
            JobState::Finished => "finished",
        }
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(JobState::Created),
            "running" => Ok(JobState::Running),
            "finished" => Ok(JobState::Finished),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobResult {
    Success,
    Error,
    Canceled,
}

impl JobResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobResult::Success => "success",
            JobResult::Error => "error",
            JobResult::Canceled => "canceled",
        }
    }
}

impl FromStr for JobResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(JobResult::Success),
            "error" => Ok(JobResult::Error),
            "canceled" => Ok(JobResult::Canceled),
            other => Err(format!("unknown job result: {other}")),
        }
    }
}

/// One scheduled, persisted execution of a connector's load pass.
/// Never leaves `Finished` once it gets there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub connector_id: String,
    pub job_type: String,
    pub state: JobState,
    pub result: Option<JobResult>,
    /// Checkpoint specific to this job run.
    pub sync_context: Option<JsonValue>,
    /// Count of records upserted so far.
    pub progress: i64,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_finished(&self) -> bool {
        self.state == JobState::Finished
    }
}
