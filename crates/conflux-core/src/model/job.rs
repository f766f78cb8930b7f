use crate::model::activity::Failure;
use crate::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Value object: background job ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Background job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Job body is executing
    Running,
    /// Job finished normally
    Completed,
    /// Job body returned an error
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
        };
        write!(f, "{}", name)
    }
}

/// Audit record of one background job run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier
    pub id: JobId,

    /// Job type tag, e.g. `compaction`
    pub job_type: String,

    /// Input parameters
    pub input: HashMap<String, Value>,

    /// Output produced on completion
    pub output: HashMap<String, Value>,

    /// Current state
    pub state: JobState,

    /// Failure details when the body errored
    pub failure: Option<Failure>,

    /// When the job started
    pub created_at: DateTime<Utc>,

    /// When the job reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Start a new job record
    pub fn new(job_type: impl Into<String>, input: HashMap<String, Value>) -> Self {
        Self {
            id: JobId(Uuid::new_v4().to_string()),
            job_type: job_type.into(),
            input,
            output: HashMap::new(),
            state: JobState::Running,
            failure: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Record a successful run
    pub fn complete(&mut self, output: HashMap<String, Value>) -> Result<(), EngineError> {
        if self.state != JobState::Running {
            return Err(EngineError::transition(
                self.id.0.clone(),
                self.state,
                JobState::Completed,
            ));
        }
        self.state = JobState::Completed;
        self.output = output;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Record a failed run
    pub fn fail(&mut self, failure: Failure) -> Result<(), EngineError> {
        if self.state != JobState::Running {
            return Err(EngineError::transition(
                self.id.0.clone(),
                self.state,
                JobState::Failed,
            ));
        }
        self.state = JobState::Failed;
        self.failure = Some(failure);
        self.completed_at = Some(Utc::now());
        Ok(())
    }
}
