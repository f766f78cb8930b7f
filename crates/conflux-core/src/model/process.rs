use crate::model::definition::{ProcessDefinition, ProcessDefinitionId};
use crate::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Value object: process instance ID
///
/// A process spawned by a call activity reuses the call activity's
/// execution id as its own, so the parent can be addressed from the child.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId(pub String);

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProcessId {
    fn from(id: &str) -> Self {
        ProcessId(id.to_string())
    }
}

/// Process instance state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    /// Process is running
    Active,
    /// Process finished normally
    Completed,
    /// Process was terminated
    Terminated,
    /// A contained activity exhausted its failure handling
    Incident,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProcessState::Active => "ACTIVE",
            ProcessState::Completed => "COMPLETED",
            ProcessState::Terminated => "TERMINATED",
            ProcessState::Incident => "INCIDENT",
        };
        write!(f, "{}", name)
    }
}

/// Aggregate: one running instance of a process definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    /// Unique identifier
    pub id: ProcessId,

    /// Parent process when spawned by a call activity
    pub parent_process_id: Option<ProcessId>,

    /// Topmost process of a call activity chain
    pub root_process_id: Option<ProcessId>,

    /// Caller-supplied correlation key
    pub business_key: Option<String>,

    /// Current state
    pub state: ProcessState,

    /// Whether execution is paused
    pub suspended: bool,

    /// Initial variables the instance was started with
    pub variables: HashMap<String, Value>,

    /// Definition this instance executes
    pub definition: ProcessDefinition,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// When the initial activity was started
    pub started_at: Option<DateTime<Utc>>,

    /// When the instance reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
}

impl Process {
    /// Create a new top-level process instance
    pub fn new(
        definition: ProcessDefinition,
        business_key: Option<String>,
        variables: HashMap<String, Value>,
    ) -> Self {
        Self {
            id: ProcessId(Uuid::new_v4().to_string()),
            parent_process_id: None,
            root_process_id: None,
            business_key,
            state: ProcessState::Active,
            suspended: false,
            variables,
            definition,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Create a process spawned by a call activity of `parent`
    ///
    /// The new instance takes the call activity's execution id as its own id.
    pub fn spawned(
        definition: ProcessDefinition,
        parent: &Process,
        call_activity_execution_id: String,
        variables: HashMap<String, Value>,
    ) -> Self {
        let root = parent
            .root_process_id
            .clone()
            .unwrap_or_else(|| parent.id.clone());
        Self {
            id: ProcessId(call_activity_execution_id),
            parent_process_id: Some(parent.id.clone()),
            root_process_id: Some(root),
            business_key: parent.business_key.clone(),
            state: ProcessState::Active,
            suspended: false,
            variables,
            definition,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Whether the instance is in a state no transition leaves
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            ProcessState::Completed | ProcessState::Terminated
        )
    }

    /// Whether the instance is running
    pub fn is_active(&self) -> bool {
        self.state == ProcessState::Active
    }

    /// Whether this process was spawned by a call activity
    pub fn is_call_activity(&self) -> bool {
        self.parent_process_id.is_some()
    }

    /// Definition id of this instance's template
    pub fn definition_id(&self) -> &ProcessDefinitionId {
        &self.definition.id
    }

    /// Mark the initial activity as started
    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
    }

    /// Finish the process normally
    pub fn complete(&mut self) -> Result<(), EngineError> {
        if self.state != ProcessState::Active {
            return Err(EngineError::transition(
                self.id.0.clone(),
                self.state,
                ProcessState::Completed,
            ));
        }
        self.state = ProcessState::Completed;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Force the process into a terminal state
    pub fn terminate(&mut self) -> Result<(), EngineError> {
        if self.is_terminal() {
            return Err(EngineError::transition(
                self.id.0.clone(),
                self.state,
                ProcessState::Terminated,
            ));
        }
        self.state = ProcessState::Terminated;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Flag the process as needing operator attention
    pub fn incident(&mut self) -> Result<(), EngineError> {
        if self.state != ProcessState::Active {
            return Err(EngineError::transition(
                self.id.0.clone(),
                self.state,
                ProcessState::Incident,
            ));
        }
        self.state = ProcessState::Incident;
        Ok(())
    }

    /// Return an incident process to normal execution
    pub fn resolve_incident(&mut self) -> Result<(), EngineError> {
        if self.state != ProcessState::Incident {
            return Err(EngineError::transition(
                self.id.0.clone(),
                self.state,
                ProcessState::Active,
            ));
        }
        self.state = ProcessState::Active;
        Ok(())
    }

    /// Pause execution
    pub fn suspend(&mut self) -> Result<(), EngineError> {
        if self.is_terminal() {
            return Err(EngineError::transition(
                self.id.0.clone(),
                self.state,
                "SUSPENDED",
            ));
        }
        self.suspended = true;
        Ok(())
    }

    /// Resume paused execution
    pub fn resume(&mut self) -> Result<(), EngineError> {
        if self.is_terminal() {
            return Err(EngineError::transition(
                self.id.0.clone(),
                self.state,
                "RESUMED",
            ));
        }
        self.suspended = false;
        Ok(())
    }
}

/// Query filter for process lookups
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessFilter {
    /// Match on instance id
    pub id: Option<ProcessId>,
    /// Match on business key
    pub business_key: Option<String>,
    /// Match on definition id
    pub definition_id: Option<ProcessDefinitionId>,
    /// Match on definition key, any version
    pub definition_key: Option<String>,
    /// Match on state
    pub state: Option<ProcessState>,
}

impl ProcessFilter {
    /// Whether a process matches every set criterion
    pub fn matches(&self, process: &Process) -> bool {
        if let Some(id) = &self.id {
            if &process.id != id {
                return false;
            }
        }
        if let Some(business_key) = &self.business_key {
            if process.business_key.as_ref() != Some(business_key) {
                return false;
            }
        }
        if let Some(definition_id) = &self.definition_id {
            if process.definition_id() != definition_id {
                return false;
            }
        }
        if let Some(definition_key) = &self.definition_key {
            if &process.definition.key != definition_key {
                return false;
            }
        }
        if let Some(state) = &self.state {
            if &process.state != state {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::definition::{ActivityDefinition, ActivityDefinitionId, ActivityPayload};

    fn create_definition() -> ProcessDefinition {
        ProcessDefinition {
            id: ProcessDefinitionId("order_process:1".to_string()),
            key: "order_process".to_string(),
            version: 1,
            activities: vec![ActivityDefinition {
                id: ActivityDefinitionId("start".to_string()),
                name: "start".to_string(),
                parent_id: None,
                incoming: Vec::new(),
                outgoing: Vec::new(),
                payload: ActivityPayload::StartEvent,
            }],
            messages: Vec::new(),
            errors: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    fn create_active_process() -> Process {
        Process::new(create_definition(), Some("bk-42".to_string()), HashMap::new())
    }

    #[test]
    fn test_new_process_is_active() {
        let process = create_active_process();

        assert_eq!(process.state, ProcessState::Active);
        assert!(!process.suspended);
        assert!(!process.is_terminal());
        assert!(!process.is_call_activity());
        assert!(process.started_at.is_none());
        assert!(!process.id.0.is_empty());
    }

    #[test]
    fn test_complete_transition() {
        let mut process = create_active_process();

        assert!(process.complete().is_ok());
        assert_eq!(process.state, ProcessState::Completed);
        assert!(process.completed_at.is_some());

        match process.complete() {
            Err(EngineError::Transition { from, to, .. }) => {
                assert_eq!(from, "COMPLETED");
                assert_eq!(to, "COMPLETED");
            }
            other => panic!("Expected transition error, got {:?}", other),
        }
    }

    #[test]
    fn test_terminate_from_incident() {
        let mut process = create_active_process();
        process.incident().unwrap();

        assert!(process.terminate().is_ok());
        assert_eq!(process.state, ProcessState::Terminated);
        assert!(process.terminate().is_err());
    }

    #[test]
    fn test_incident_round_trip() {
        let mut process = create_active_process();

        process.incident().unwrap();
        assert_eq!(process.state, ProcessState::Incident);
        assert!(!process.is_terminal());

        process.resolve_incident().unwrap();
        assert_eq!(process.state, ProcessState::Active);

        // Resolving twice is illegal
        assert!(process.resolve_incident().is_err());
    }

    #[test]
    fn test_suspend_resume() {
        let mut process = create_active_process();

        process.suspend().unwrap();
        assert!(process.suspended);
        process.resume().unwrap();
        assert!(!process.suspended);

        process.complete().unwrap();
        assert!(process.suspend().is_err());
    }

    #[test]
    fn test_spawned_process_links_to_parent() {
        let parent = create_active_process();
        let child = Process::spawned(
            create_definition(),
            &parent,
            "call-activity-execution".to_string(),
            HashMap::new(),
        );

        assert_eq!(child.id, ProcessId("call-activity-execution".to_string()));
        assert_eq!(child.parent_process_id, Some(parent.id.clone()));
        assert_eq!(child.root_process_id, Some(parent.id.clone()));
        assert_eq!(child.business_key, parent.business_key);
        assert!(child.is_call_activity());

        let grandchild = Process::spawned(
            create_definition(),
            &child,
            "nested-execution".to_string(),
            HashMap::new(),
        );
        assert_eq!(grandchild.root_process_id, Some(parent.id));
    }

    #[test]
    fn test_filter_matches() {
        let process = create_active_process();

        let mut filter = ProcessFilter::default();
        assert!(filter.matches(&process));

        filter.business_key = Some("bk-42".to_string());
        filter.definition_key = Some("order_process".to_string());
        filter.state = Some(ProcessState::Active);
        assert!(filter.matches(&process));

        filter.state = Some(ProcessState::Completed);
        assert!(!filter.matches(&process));

        let mut other = ProcessFilter::default();
        other.business_key = Some("someone-else".to_string());
        assert!(!other.matches(&process));
    }

    #[test]
    fn test_state_serialization() {
        let serialized = serde_json::to_string(&ProcessState::Incident).unwrap();
        assert_eq!(serialized, "\"INCIDENT\"");
        let deserialized: ProcessState = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, ProcessState::Incident);
    }
}
