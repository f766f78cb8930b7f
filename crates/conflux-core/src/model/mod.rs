//! Definition and runtime data model

/// Runtime activity instances
pub mod activity;
/// Process definition graph value objects
pub mod definition;
/// Background job records
pub mod job;
/// Process instances and query filters
pub mod process;
/// Persisted variable records
pub mod variable;

pub use activity::{ActivityExecution, ActivityId, ActivityState, Failure};
pub use definition::{
    ActivityDefinition, ActivityDefinitionId, ActivityPayload, ActivityType, ConditionedPath,
    IoMapping, ProcessDefinition, ProcessDefinitionId,
};
pub use job::{Job, JobId, JobState};
pub use process::{Process, ProcessFilter, ProcessId, ProcessState};
pub use variable::{Variable, VariableId, VariableType};
