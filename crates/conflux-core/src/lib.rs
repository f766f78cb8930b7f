//!
//! Conflux Core - Domain model and ports for the Conflux engine
//!
//! This crate defines the process definition graph, the runtime
//! aggregates, the persistence and expression ports, and the error
//! taxonomy. It is the foundation for all other crates in the engine.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Error types
pub mod error;

/// Expression evaluation port and default evaluator
pub mod expression;

/// Definition and runtime data model
pub mod model;

/// Persistence ports and the in-memory store
pub mod persistence;

pub use error::EngineError;
pub use expression::{ExpressionEvaluator, JmespathEvaluator};

// Re-export main API types for easy use
pub use model::{
    ActivityDefinition, ActivityDefinitionId, ActivityExecution, ActivityId, ActivityPayload,
    ActivityState, ActivityType, Failure, Job, JobId, JobState, Process, ProcessDefinition,
    ProcessDefinitionId, ProcessFilter, ProcessId, ProcessState, Variable, VariableId,
    VariableType,
};
pub use persistence::{
    ActivityStore, DefinitionStore, JobStore, LeaseStore, ProcessStore, VariableStore,
};

#[cfg(feature = "testing")]
pub use persistence::memory::MemoryEngineStore;
