use crate::model::definition::{ActivityDefinition, ActivityDefinitionId, ActivityType};
use crate::model::process::Process;
use crate::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Value object: activity instance ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivityId(pub String);

impl std::fmt::Display for ActivityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ActivityId {
    fn from(id: &str) -> Self {
        ActivityId(id.to_string())
    }
}

/// Activity instance state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityState {
    /// Waiting to be started or polled
    Scheduled,
    /// Currently executing or locked by a worker
    Active,
    /// Finished normally
    Completed,
    /// Forced into a terminal state
    Terminated,
    /// Exhausted its retry budget
    Failed,
}

impl std::fmt::Display for ActivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ActivityState::Scheduled => "SCHEDULED",
            ActivityState::Active => "ACTIVE",
            ActivityState::Completed => "COMPLETED",
            ActivityState::Terminated => "TERMINATED",
            ActivityState::Failed => "FAILED",
        };
        write!(f, "{}", name)
    }
}

/// Failure details attached to an activity or job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    /// Short failure reason
    pub reason: String,
    /// Optional stack trace or diagnostic detail
    pub trace: Option<String>,
}

impl Failure {
    /// Build a failure from a reason only
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            trace: None,
        }
    }

    /// Build a failure carrying a trace
    pub fn with_trace(reason: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            trace: Some(trace.into()),
        }
    }
}

/// Aggregate: one runtime instance of an activity definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityExecution {
    /// Unique identifier
    pub id: ActivityId,

    /// Definition node this instance executes
    pub definition_id: ActivityDefinitionId,

    /// Owning process snapshot
    pub process: Process,

    /// Current state
    pub state: ActivityState,

    /// How many times this instance was re-scheduled after failure
    pub retries: u32,

    /// Lock timeout for polled tasks
    pub timeout: Option<DateTime<Utc>>,

    /// Last failure attached to this instance
    pub failure: Option<Failure>,

    /// Payload variables handed over at completion or trigger time
    pub variables: HashMap<String, Value>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// When execution began
    pub started_at: Option<DateTime<Utc>>,

    /// When a terminal state was reached
    pub completed_at: Option<DateTime<Utc>>,
}

impl ActivityExecution {
    /// Create a new scheduled instance of a definition node
    pub fn new(process: Process, definition_id: ActivityDefinitionId) -> Self {
        Self {
            id: ActivityId(Uuid::new_v4().to_string()),
            definition_id,
            process,
            state: ActivityState::Scheduled,
            retries: 0,
            timeout: None,
            failure: None,
            variables: HashMap::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// The definition node of this instance
    pub fn definition(&self) -> Result<&ActivityDefinition, EngineError> {
        self.process
            .definition
            .activity_by_id(&self.definition_id)
            .ok_or_else(|| EngineError::ActivityDefinitionNotFound(self.definition_id.0.clone()))
    }

    /// Activity type of this instance
    pub fn activity_type(&self) -> Result<ActivityType, EngineError> {
        Ok(self.definition()?.activity_type())
    }

    /// Definitions this instance's outgoing edges point to
    pub fn next_definitions(&self) -> Result<Vec<&ActivityDefinition>, EngineError> {
        let definition = self.definition()?;
        definition
            .outgoing
            .iter()
            .map(|id| {
                self.process
                    .definition
                    .activity_by_id(id)
                    .ok_or_else(|| EngineError::ActivityDefinitionNotFound(id.0.clone()))
            })
            .collect()
    }

    /// Definitions with an edge into this instance's node
    pub fn previous_definitions(&self) -> Result<Vec<&ActivityDefinition>, EngineError> {
        let definition = self.definition()?;
        definition
            .incoming
            .iter()
            .map(|id| {
                self.process
                    .definition
                    .activity_by_id(id)
                    .ok_or_else(|| EngineError::ActivityDefinitionNotFound(id.0.clone()))
            })
            .collect()
    }

    /// Direct children of this instance's node
    pub fn child_definitions(&self) -> Vec<&ActivityDefinition> {
        self.process.definition.children_of(&self.definition_id)
    }

    /// Ancestor chain from this node to the process definition
    pub fn scope(&self) -> Vec<String> {
        self.process.definition.scope(&self.definition_id)
    }

    /// Whether this instance runs outside the sequential flow
    ///
    /// True when the node or any of its ancestors is an event subprocess;
    /// such instances never drive parent or process completion.
    pub fn is_async(&self) -> bool {
        let mut current = self.process.definition.activity_by_id(&self.definition_id);
        while let Some(definition) = current {
            if definition.activity_type() == ActivityType::EventSubprocess {
                return true;
            }
            current = definition
                .parent_id
                .as_ref()
                .and_then(|parent| self.process.definition.activity_by_id(parent));
        }
        false
    }

    /// Whether the instance is in a state no transition leaves
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            ActivityState::Completed | ActivityState::Terminated
        )
    }

    /// Start executing
    pub fn activate(&mut self) -> Result<(), EngineError> {
        if !matches!(self.state, ActivityState::Scheduled | ActivityState::Failed) {
            return Err(EngineError::transition(
                self.id.0.clone(),
                self.state,
                ActivityState::Active,
            ));
        }
        self.state = ActivityState::Active;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Finish normally
    pub fn complete(&mut self) -> Result<(), EngineError> {
        if self.state != ActivityState::Active {
            return Err(EngineError::transition(
                self.id.0.clone(),
                self.state,
                ActivityState::Completed,
            ));
        }
        self.state = ActivityState::Completed;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Record a failure that exhausted the retry budget
    pub fn fail(&mut self, failure: Failure) -> Result<(), EngineError> {
        if self.state != ActivityState::Active {
            return Err(EngineError::transition(
                self.id.0.clone(),
                self.state,
                ActivityState::Failed,
            ));
        }
        self.state = ActivityState::Failed;
        self.failure = Some(failure);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Force a terminal state without completion side effects
    pub fn terminate(&mut self) -> Result<(), EngineError> {
        if !matches!(self.state, ActivityState::Scheduled | ActivityState::Active) {
            return Err(EngineError::transition(
                self.id.0.clone(),
                self.state,
                ActivityState::Terminated,
            ));
        }
        self.state = ActivityState::Terminated;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Put the instance back in the worker queue, consuming one retry
    pub fn reschedule(&mut self, timeout: Option<DateTime<Utc>>) -> Result<(), EngineError> {
        if self.state != ActivityState::Active {
            return Err(EngineError::transition(
                self.id.0.clone(),
                self.state,
                ActivityState::Scheduled,
            ));
        }
        self.state = ActivityState::Scheduled;
        self.retries += 1;
        self.timeout = timeout;
        self.started_at = None;
        self.completed_at = None;
        Ok(())
    }

    /// Re-enter the queue after an explicit retry, with a fresh budget
    pub fn requeue(&mut self, timeout: Option<DateTime<Utc>>) -> Result<(), EngineError> {
        if self.state != ActivityState::Failed {
            return Err(EngineError::transition(
                self.id.0.clone(),
                self.state,
                ActivityState::Scheduled,
            ));
        }
        self.state = ActivityState::Scheduled;
        self.retries = 0;
        self.failure = None;
        self.timeout = timeout;
        self.started_at = None;
        self.completed_at = None;
        Ok(())
    }
}
