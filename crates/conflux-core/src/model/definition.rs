use crate::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Value object: activity definition ID, unique within a process definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivityDefinitionId(pub String);

impl std::fmt::Display for ActivityDefinitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ActivityDefinitionId {
    fn from(id: &str) -> Self {
        ActivityDefinitionId(id.to_string())
    }
}

/// Value object: process definition ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessDefinitionId(pub String);

impl std::fmt::Display for ProcessDefinitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProcessDefinitionId {
    fn from(id: &str) -> Self {
        ProcessDefinitionId(id.to_string())
    }
}

/// Closed set of activity types understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityType {
    /// Task completed by a polling worker
    ExternalTask,
    /// Task waiting for a message
    ReceiveTask,
    /// Task delegated to a worker via a topic, like an external task
    SendTask,
    /// Gateway routing to exactly one outgoing path
    ExclusiveGateway,
    /// Gateway routing to every outgoing path whose condition holds
    InclusiveGateway,
    /// Gateway fanning out to all paths and joining incoming tokens
    ParallelGateway,
    /// Gateway whose outgoing events race each other
    EventBasedGateway,
    /// Plain start event
    StartEvent,
    /// Start event triggered by a message
    MessageStartEvent,
    /// Start event triggered by an error
    ErrorStartEvent,
    /// Start event triggered by an escalation
    EscalationStartEvent,
    /// Start event triggered by a variable condition
    ConditionalStartEvent,
    /// Plain end event
    EndEvent,
    /// End event raising an error
    ErrorEndEvent,
    /// End event raising an escalation
    EscalationEndEvent,
    /// End event terminating its scope
    TerminateEndEvent,
    /// Intermediate event waiting for a message
    MessageCatchEvent,
    /// Intermediate event waiting for a variable condition
    ConditionalCatchEvent,
    /// Intermediate event raising an escalation
    EscalationThrowEvent,
    /// Boundary event fired by a message
    MessageBoundaryEvent,
    /// Boundary event fired by an error
    ErrorBoundaryEvent,
    /// Boundary event fired by an escalation
    EscalationBoundaryEvent,
    /// Embedded subprocess
    Subprocess,
    /// Subprocess activated only by a triggering event
    EventSubprocess,
    /// Activity spawning another process
    CallActivity,
}

impl std::fmt::Display for ActivityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One outgoing path of a gateway, in author order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionedPath {
    /// Condition expression; `None` marks the default path
    pub condition: Option<String>,
    /// Target activity definition
    pub target: ActivityDefinitionId,
}

/// Input/output mapping of a call activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IoMapping {
    /// Copy a variable under a new name
    Copy {
        /// Variable to read
        source: String,
        /// Variable to write
        target: String,
    },
    /// Evaluate an expression and write the result
    Expression {
        /// Expression evaluated against the source scope
        expression: String,
        /// Variable to write
        target: String,
    },
    /// Pass every variable through unchanged
    All,
}

/// Type-specific attributes of an activity definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityPayload {
    /// Task completed by a polling worker
    ExternalTask {
        /// Topic workers poll on
        topic: String,
        /// Retry budget; engine default applies when absent
        retries: Option<u32>,
        /// Lock timeout in seconds; engine default applies when absent
        timeout: Option<i64>,
    },
    /// Task waiting for a message
    ReceiveTask {
        /// Message name this task subscribes to
        message: String,
    },
    /// Topic-delegated send task
    SendTask {
        /// Topic workers poll on
        topic: String,
        /// Retry budget; engine default applies when absent
        retries: Option<u32>,
        /// Lock timeout in seconds; engine default applies when absent
        timeout: Option<i64>,
    },
    /// Exclusive gateway
    ExclusiveGateway {
        /// Conditioned paths in author order
        paths: Vec<ConditionedPath>,
    },
    /// Inclusive gateway
    InclusiveGateway {
        /// Conditioned paths in author order
        paths: Vec<ConditionedPath>,
    },
    /// Parallel gateway
    ParallelGateway,
    /// Event-based gateway
    EventBasedGateway,
    /// Plain start event
    StartEvent,
    /// Message start event
    MessageStartEvent {
        /// Message name
        message: String,
        /// Whether triggering interrupts the host scope
        interrupting: bool,
    },
    /// Error start event
    ErrorStartEvent {
        /// Error code; `None` catches any error
        error_code: Option<String>,
        /// Whether triggering interrupts the host scope
        interrupting: bool,
    },
    /// Escalation start event
    EscalationStartEvent {
        /// Escalation code; `None` catches any escalation
        escalation_code: Option<String>,
        /// Whether triggering interrupts the host scope
        interrupting: bool,
    },
    /// Conditional start event
    ConditionalStartEvent {
        /// Condition evaluated against scope variables
        condition: String,
        /// Whether triggering interrupts the host scope
        interrupting: bool,
    },
    /// Plain end event
    EndEvent,
    /// Error end event
    ErrorEndEvent {
        /// Error code raised on completion
        error_code: String,
    },
    /// Escalation end event
    EscalationEndEvent {
        /// Escalation code raised on completion
        escalation_code: String,
    },
    /// Terminate end event
    TerminateEndEvent,
    /// Intermediate message catch event
    MessageCatchEvent {
        /// Message name
        message: String,
    },
    /// Intermediate conditional catch event
    ConditionalCatchEvent {
        /// Condition evaluated against scope variables
        condition: String,
    },
    /// Intermediate escalation throw event
    EscalationThrowEvent {
        /// Escalation code raised on completion
        escalation_code: String,
    },
    /// Message boundary event
    MessageBoundaryEvent {
        /// Message name
        message: String,
        /// Host activity the event is attached to
        attached_to: ActivityDefinitionId,
        /// Whether firing terminates the host
        cancel_activity: bool,
    },
    /// Error boundary event
    ErrorBoundaryEvent {
        /// Error code; `None` catches any error
        error_code: Option<String>,
        /// Host activity the event is attached to
        attached_to: ActivityDefinitionId,
        /// Whether firing terminates the host
        cancel_activity: bool,
    },
    /// Escalation boundary event
    EscalationBoundaryEvent {
        /// Escalation code; `None` catches any escalation
        escalation_code: Option<String>,
        /// Host activity the event is attached to
        attached_to: ActivityDefinitionId,
        /// Whether firing terminates the host
        cancel_activity: bool,
    },
    /// Embedded subprocess
    Subprocess,
    /// Event subprocess
    EventSubprocess,
    /// Call activity
    CallActivity {
        /// Key of the called process definition
        called_element: String,
        /// Pinned definition version; latest when absent
        version: Option<i32>,
        /// Input mappings seeding the spawned process
        inputs: Vec<IoMapping>,
        /// Output mappings applied on completion
        outputs: Vec<IoMapping>,
    },
}

/// One node of a process definition graph
///
/// `incoming` and `outgoing` are adjacency lists of activity definition ids;
/// there are no separate edge objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityDefinition {
    /// Unique identifier within the process definition
    pub id: ActivityDefinitionId,
    /// Human-readable name
    pub name: String,
    /// Enclosing subprocess; `None` for top-level activities
    pub parent_id: Option<ActivityDefinitionId>,
    /// Activities with an edge into this one
    pub incoming: Vec<ActivityDefinitionId>,
    /// Activities this one has an edge to
    pub outgoing: Vec<ActivityDefinitionId>,
    /// Type-specific attributes
    #[serde(flatten)]
    pub payload: ActivityPayload,
}

impl ActivityDefinition {
    /// Activity type tag of the payload
    pub fn activity_type(&self) -> ActivityType {
        match self.payload {
            ActivityPayload::ExternalTask { .. } => ActivityType::ExternalTask,
            ActivityPayload::ReceiveTask { .. } => ActivityType::ReceiveTask,
            ActivityPayload::SendTask { .. } => ActivityType::SendTask,
            ActivityPayload::ExclusiveGateway { .. } => ActivityType::ExclusiveGateway,
            ActivityPayload::InclusiveGateway { .. } => ActivityType::InclusiveGateway,
            ActivityPayload::ParallelGateway => ActivityType::ParallelGateway,
            ActivityPayload::EventBasedGateway => ActivityType::EventBasedGateway,
            ActivityPayload::StartEvent => ActivityType::StartEvent,
            ActivityPayload::MessageStartEvent { .. } => ActivityType::MessageStartEvent,
            ActivityPayload::ErrorStartEvent { .. } => ActivityType::ErrorStartEvent,
            ActivityPayload::EscalationStartEvent { .. } => ActivityType::EscalationStartEvent,
            ActivityPayload::ConditionalStartEvent { .. } => ActivityType::ConditionalStartEvent,
            ActivityPayload::EndEvent => ActivityType::EndEvent,
            ActivityPayload::ErrorEndEvent { .. } => ActivityType::ErrorEndEvent,
            ActivityPayload::EscalationEndEvent { .. } => ActivityType::EscalationEndEvent,
            ActivityPayload::TerminateEndEvent => ActivityType::TerminateEndEvent,
            ActivityPayload::MessageCatchEvent { .. } => ActivityType::MessageCatchEvent,
            ActivityPayload::ConditionalCatchEvent { .. } => ActivityType::ConditionalCatchEvent,
            ActivityPayload::EscalationThrowEvent { .. } => ActivityType::EscalationThrowEvent,
            ActivityPayload::MessageBoundaryEvent { .. } => ActivityType::MessageBoundaryEvent,
            ActivityPayload::ErrorBoundaryEvent { .. } => ActivityType::ErrorBoundaryEvent,
            ActivityPayload::EscalationBoundaryEvent { .. } => {
                ActivityType::EscalationBoundaryEvent
            }
            ActivityPayload::Subprocess => ActivityType::Subprocess,
            ActivityPayload::EventSubprocess => ActivityType::EventSubprocess,
            ActivityPayload::CallActivity { .. } => ActivityType::CallActivity,
        }
    }

    /// Whether this is any start event type
    pub fn is_start_event(&self) -> bool {
        matches!(
            self.activity_type(),
            ActivityType::StartEvent
                | ActivityType::MessageStartEvent
                | ActivityType::ErrorStartEvent
                | ActivityType::EscalationStartEvent
                | ActivityType::ConditionalStartEvent
        )
    }

    /// Whether this is any boundary event type
    pub fn is_boundary_event(&self) -> bool {
        matches!(
            self.activity_type(),
            ActivityType::MessageBoundaryEvent
                | ActivityType::ErrorBoundaryEvent
                | ActivityType::EscalationBoundaryEvent
        )
    }

    /// Whether this is a topic-delegated task picked up by polling workers
    pub fn is_polled_task(&self) -> bool {
        matches!(
            self.activity_type(),
            ActivityType::ExternalTask | ActivityType::SendTask
        )
    }

    /// Host activity this boundary event is attached to
    pub fn attached_to(&self) -> Option<&ActivityDefinitionId> {
        match &self.payload {
            ActivityPayload::MessageBoundaryEvent { attached_to, .. }
            | ActivityPayload::ErrorBoundaryEvent { attached_to, .. }
            | ActivityPayload::EscalationBoundaryEvent { attached_to, .. } => Some(attached_to),
            _ => None,
        }
    }

    /// Whether firing this boundary event terminates its host
    pub fn cancel_activity(&self) -> bool {
        match self.payload {
            ActivityPayload::MessageBoundaryEvent {
                cancel_activity, ..
            }
            | ActivityPayload::ErrorBoundaryEvent {
                cancel_activity, ..
            }
            | ActivityPayload::EscalationBoundaryEvent {
                cancel_activity, ..
            } => cancel_activity,
            _ => false,
        }
    }

    /// Whether this start event interrupts its host scope when triggered
    pub fn interrupting(&self) -> bool {
        match self.payload {
            ActivityPayload::MessageStartEvent { interrupting, .. }
            | ActivityPayload::ErrorStartEvent { interrupting, .. }
            | ActivityPayload::EscalationStartEvent { interrupting, .. }
            | ActivityPayload::ConditionalStartEvent { interrupting, .. } => interrupting,
            _ => false,
        }
    }

    /// Error code of an error start/boundary/end event
    pub fn error_code(&self) -> Option<&str> {
        match &self.payload {
            ActivityPayload::ErrorStartEvent { error_code, .. }
            | ActivityPayload::ErrorBoundaryEvent { error_code, .. } => error_code.as_deref(),
            ActivityPayload::ErrorEndEvent { error_code } => Some(error_code),
            _ => None,
        }
    }

    /// Escalation code of an escalation start/boundary/throw/end event
    pub fn escalation_code(&self) -> Option<&str> {
        match &self.payload {
            ActivityPayload::EscalationStartEvent {
                escalation_code, ..
            }
            | ActivityPayload::EscalationBoundaryEvent {
                escalation_code, ..
            } => escalation_code.as_deref(),
            ActivityPayload::EscalationEndEvent { escalation_code }
            | ActivityPayload::EscalationThrowEvent { escalation_code } => Some(escalation_code),
            _ => None,
        }
    }

    /// Message name this activity subscribes to
    pub fn message_name(&self) -> Option<&str> {
        match &self.payload {
            ActivityPayload::ReceiveTask { message }
            | ActivityPayload::MessageCatchEvent { message }
            | ActivityPayload::MessageStartEvent { message, .. }
            | ActivityPayload::MessageBoundaryEvent { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Condition expression of a conditional start/catch event
    pub fn condition(&self) -> Option<&str> {
        match &self.payload {
            ActivityPayload::ConditionalStartEvent { condition, .. }
            | ActivityPayload::ConditionalCatchEvent { condition } => Some(condition),
            _ => None,
        }
    }

    /// Worker topic of an external or send task
    pub fn topic(&self) -> Option<&str> {
        match &self.payload {
            ActivityPayload::ExternalTask { topic, .. }
            | ActivityPayload::SendTask { topic, .. } => Some(topic),
            _ => None,
        }
    }

    /// Declared retry budget of an external or send task
    pub fn retries(&self) -> Option<u32> {
        match self.payload {
            ActivityPayload::ExternalTask { retries, .. }
            | ActivityPayload::SendTask { retries, .. } => retries,
            _ => None,
        }
    }

    /// Declared lock timeout in seconds of an external or send task
    pub fn timeout_secs(&self) -> Option<i64> {
        match self.payload {
            ActivityPayload::ExternalTask { timeout, .. }
            | ActivityPayload::SendTask { timeout, .. } => timeout,
            _ => None,
        }
    }
}

/// Immutable, versioned process template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// Unique identifier of this definition version
    pub id: ProcessDefinitionId,
    /// Stable key shared by all versions
    pub key: String,
    /// Version number, ascending per key
    pub version: i32,
    /// Activity graph
    pub activities: Vec<ActivityDefinition>,
    /// Message names this definition subscribes to
    pub messages: Vec<String>,
    /// Error codes this definition declares
    pub errors: Vec<String>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ProcessDefinition {
    /// Look up an activity definition by id
    pub fn activity_by_id(&self, id: &ActivityDefinitionId) -> Option<&ActivityDefinition> {
        self.activities.iter().find(|a| &a.id == id)
    }

    /// The top-level plain start event driving sequential execution
    pub fn start_activity(&self) -> Result<&ActivityDefinition, EngineError> {
        self.activities
            .iter()
            .find(|a| a.activity_type() == ActivityType::StartEvent && a.parent_id.is_none())
            .ok_or_else(|| {
                EngineError::Validation(format!("no start activity in definition {}", self.id))
            })
    }

    /// The start event nested directly under the given subprocess
    pub fn start_activity_of(
        &self,
        subprocess_id: &ActivityDefinitionId,
    ) -> Option<&ActivityDefinition> {
        self.activities
            .iter()
            .find(|a| a.is_start_event() && a.parent_id.as_ref() == Some(subprocess_id))
    }

    /// Direct children of the given subprocess
    pub fn children_of(&self, parent_id: &ActivityDefinitionId) -> Vec<&ActivityDefinition> {
        self.activities
            .iter()
            .filter(|a| a.parent_id.as_ref() == Some(parent_id))
            .collect()
    }

    /// Boundary events attached to the given host activity
    pub fn boundary_events_of(&self, host_id: &ActivityDefinitionId) -> Vec<&ActivityDefinition> {
        self.activities
            .iter()
            .filter(|a| a.attached_to() == Some(host_id))
            .collect()
    }

    /// Ancestor chain of an activity: the activity id, its enclosing
    /// subprocess ids from inner to outer, then the process definition id
    pub fn scope(&self, activity_id: &ActivityDefinitionId) -> Vec<String> {
        let mut chain = vec![activity_id.0.clone()];
        let mut seen: HashSet<&str> = HashSet::new();
        seen.insert(&activity_id.0);

        let mut current = self
            .activity_by_id(activity_id)
            .and_then(|a| a.parent_id.as_ref());
        while let Some(parent) = current {
            if !seen.insert(&parent.0) {
                break;
            }
            chain.push(parent.0.clone());
            current = self
                .activity_by_id(parent)
                .and_then(|a| a.parent_id.as_ref());
        }

        chain.push(self.id.0.clone());
        chain
    }

    /// Validate graph consistency
    ///
    /// Rejects duplicate ids, dangling edge/parent/attachment references,
    /// a missing top-level start event, and `parent_id` cycles.
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut ids: HashSet<&str> = HashSet::new();
        for activity in &self.activities {
            if !ids.insert(&activity.id.0) {
                return Err(EngineError::Validation(format!(
                    "duplicate activity id: {}",
                    activity.id
                )));
            }
        }

        for activity in &self.activities {
            for referenced in activity.incoming.iter().chain(activity.outgoing.iter()) {
                if !ids.contains(referenced.0.as_str()) {
                    return Err(EngineError::Validation(format!(
                        "activity {} references unknown activity {}",
                        activity.id, referenced
                    )));
                }
            }
            if let Some(parent) = &activity.parent_id {
                if !ids.contains(parent.0.as_str()) {
                    return Err(EngineError::Validation(format!(
                        "activity {} references unknown parent {}",
                        activity.id, parent
                    )));
                }
            }
            if let Some(host) = activity.attached_to() {
                if !ids.contains(host.0.as_str()) {
                    return Err(EngineError::Validation(format!(
                        "boundary event {} attached to unknown activity {}",
                        activity.id, host
                    )));
                }
            }
        }

        self.start_activity()?;

        for activity in &self.activities {
            let mut seen: HashSet<&str> = HashSet::new();
            seen.insert(&activity.id.0);
            let mut current = activity.parent_id.as_ref();
            while let Some(parent) = current {
                if !seen.insert(&parent.0) {
                    return Err(EngineError::Validation(format!(
                        "parent cycle involving activity {}",
                        activity.id
                    )));
                }
                current = self
                    .activity_by_id(parent)
                    .and_then(|a| a.parent_id.as_ref());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn create_activity(
        id: &str,
        parent: Option<&str>,
        payload: ActivityPayload,
    ) -> ActivityDefinition {
        ActivityDefinition {
            id: ActivityDefinitionId(id.to_string()),
            name: id.to_string(),
            parent_id: parent.map(|p| ActivityDefinitionId(p.to_string())),
            incoming: Vec::new(),
            outgoing: Vec::new(),
            payload,
        }
    }

    fn create_definition(activities: Vec<ActivityDefinition>) -> ProcessDefinition {
        ProcessDefinition {
            id: ProcessDefinitionId("order_process:1".to_string()),
            key: "order_process".to_string(),
            version: 1,
            activities,
            messages: vec!["order_placed".to_string()],
            errors: vec!["E_PAYMENT".to_string()],
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_start_activity_is_top_level_plain_start() {
        let definition = create_definition(vec![
            create_activity("start", None, ActivityPayload::StartEvent),
            create_activity("sub", None, ActivityPayload::Subprocess),
            create_activity("sub_start", Some("sub"), ActivityPayload::StartEvent),
        ]);

        let start = definition.start_activity().unwrap();
        assert_eq!(start.id, ActivityDefinitionId("start".to_string()));

        let sub_start = definition
            .start_activity_of(&ActivityDefinitionId("sub".to_string()))
            .unwrap();
        assert_eq!(sub_start.id, ActivityDefinitionId("sub_start".to_string()));
    }

    #[test]
    fn test_scope_two_levels_deep() {
        let definition = create_definition(vec![
            create_activity("start", None, ActivityPayload::StartEvent),
            create_activity("outer", None, ActivityPayload::Subprocess),
            create_activity("inner", Some("outer"), ActivityPayload::Subprocess),
            create_activity(
                "task",
                Some("inner"),
                ActivityPayload::ExternalTask {
                    topic: "work".to_string(),
                    retries: None,
                    timeout: None,
                },
            ),
        ]);

        let scope = definition.scope(&ActivityDefinitionId("task".to_string()));
        assert_eq!(scope, vec!["task", "inner", "outer", "order_process:1"]);
    }

    #[test]
    fn test_scope_of_top_level_activity() {
        let definition = create_definition(vec![create_activity(
            "start",
            None,
            ActivityPayload::StartEvent,
        )]);

        let scope = definition.scope(&ActivityDefinitionId("start".to_string()));
        assert_eq!(scope, vec!["start", "order_process:1"]);
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let definition = create_definition(vec![
            create_activity("start", None, ActivityPayload::StartEvent),
            create_activity("start", None, ActivityPayload::EndEvent),
        ]);

        match definition.validate() {
            Err(EngineError::Validation(msg)) => assert!(msg.contains("duplicate activity id")),
            other => panic!("Expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_dangling_edges() {
        let mut start = create_activity("start", None, ActivityPayload::StartEvent);
        start.outgoing.push(ActivityDefinitionId("ghost".to_string()));
        let definition = create_definition(vec![start]);

        match definition.validate() {
            Err(EngineError::Validation(msg)) => assert!(msg.contains("unknown activity")),
            other => panic!("Expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_missing_start() {
        let definition = create_definition(vec![create_activity(
            "end",
            None,
            ActivityPayload::EndEvent,
        )]);

        match definition.validate() {
            Err(EngineError::Validation(msg)) => assert!(msg.contains("no start activity")),
            other => panic!("Expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_parent_cycles() {
        let definition = create_definition(vec![
            create_activity("start", None, ActivityPayload::StartEvent),
            create_activity("a", Some("b"), ActivityPayload::Subprocess),
            create_activity("b", Some("a"), ActivityPayload::Subprocess),
        ]);

        match definition.validate() {
            Err(EngineError::Validation(msg)) => assert!(msg.contains("parent cycle")),
            other => panic!("Expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_accepts_well_formed_graph() {
        let mut start = create_activity("start", None, ActivityPayload::StartEvent);
        start.outgoing.push(ActivityDefinitionId("task".to_string()));
        let mut task = create_activity(
            "task",
            None,
            ActivityPayload::ExternalTask {
                topic: "work".to_string(),
                retries: Some(2),
                timeout: Some(600),
            },
        );
        task.incoming.push(ActivityDefinitionId("start".to_string()));
        task.outgoing.push(ActivityDefinitionId("end".to_string()));
        let mut end = create_activity("end", None, ActivityPayload::EndEvent);
        end.incoming.push(ActivityDefinitionId("task".to_string()));

        let definition = create_definition(vec![start, task, end]);
        assert!(definition.validate().is_ok());
    }

    #[test]
    fn test_boundary_event_accessors() {
        let boundary = create_activity(
            "on_error",
            None,
            ActivityPayload::ErrorBoundaryEvent {
                error_code: Some("E_PAYMENT".to_string()),
                attached_to: ActivityDefinitionId("task".to_string()),
                cancel_activity: true,
            },
        );

        assert!(boundary.is_boundary_event());
        assert_eq!(
            boundary.attached_to(),
            Some(&ActivityDefinitionId("task".to_string()))
        );
        assert!(boundary.cancel_activity());
        assert_eq!(boundary.error_code(), Some("E_PAYMENT"));
        assert_eq!(boundary.escalation_code(), None);
    }

    #[test]
    fn test_catch_all_boundary_has_no_code() {
        let boundary = create_activity(
            "on_any_error",
            None,
            ActivityPayload::ErrorBoundaryEvent {
                error_code: None,
                attached_to: ActivityDefinitionId("task".to_string()),
                cancel_activity: false,
            },
        );

        assert_eq!(boundary.error_code(), None);
        assert!(!boundary.cancel_activity());
    }

    #[test]
    fn test_definition_serialization_round_trip() {
        let definition = create_definition(vec![
            create_activity("start", None, ActivityPayload::StartEvent),
            create_activity(
                "call",
                None,
                ActivityPayload::CallActivity {
                    called_element: "child_process".to_string(),
                    version: Some(3),
                    inputs: vec![IoMapping::Copy {
                        source: "order_id".to_string(),
                        target: "id".to_string(),
                    }],
                    outputs: vec![IoMapping::All],
                },
            ),
        ]);

        let serialized = serde_json::to_string(&definition).unwrap();
        let deserialized: ProcessDefinition = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, definition);
    }

    #[test]
    fn test_polled_task_accessors() {
        let task = create_activity(
            "task",
            None,
            ActivityPayload::ExternalTask {
                topic: "billing".to_string(),
                retries: Some(3),
                timeout: Some(120),
            },
        );

        assert!(task.is_polled_task());
        assert_eq!(task.topic(), Some("billing"));
        assert_eq!(task.retries(), Some(3));
        assert_eq!(task.timeout_secs(), Some(120));
        assert_eq!(task.activity_type(), ActivityType::ExternalTask);
    }
}
