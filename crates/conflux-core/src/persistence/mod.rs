//! Persistence ports consumed by the engine
//!
//! All stores are async traits injected as `Arc<dyn Trait>`. Reads reflect
//! writes of the same synchronous dispatch. Transition methods load the
//! authoritative copy, validate the state change through the aggregate, and
//! return the updated snapshot; racing callers get a transition error.

use crate::model::{
    ActivityDefinitionId, ActivityExecution, ActivityId, Failure, Job, JobId, Process,
    ProcessDefinition, ProcessDefinitionId, ProcessFilter, ProcessId, Variable,
};
use crate::EngineError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

#[cfg(feature = "testing")]
pub mod memory;

/// Store for process instances
#[async_trait]
pub trait ProcessStore: Send + Sync {
    /// Persist a new instance and stamp its start time
    async fn run(&self, process: Process) -> Result<Process, EngineError>;

    /// Finish an instance normally
    async fn complete(&self, id: &ProcessId) -> Result<Process, EngineError>;

    /// Force an instance into a terminal state
    async fn terminate(&self, id: &ProcessId) -> Result<Process, EngineError>;

    /// Flag an instance as needing operator attention
    async fn incident(&self, id: &ProcessId) -> Result<Process, EngineError>;

    /// Return an incident instance to normal execution
    async fn resolve_incident(&self, id: &ProcessId) -> Result<Process, EngineError>;

    /// Pause an instance
    async fn suspend(&self, id: &ProcessId) -> Result<Process, EngineError>;

    /// Resume a paused instance
    async fn resume(&self, id: &ProcessId) -> Result<Process, EngineError>;

    /// Look up an instance by id
    async fn find_by_id(&self, id: &ProcessId) -> Result<Option<Process>, EngineError>;

    /// Find instances matching a filter
    async fn find_by_filter(&self, filter: &ProcessFilter) -> Result<Vec<Process>, EngineError>;

    /// Active instances whose definition declares the message, optionally
    /// narrowed by business key
    async fn find_candidates(
        &self,
        message: &str,
        business_key: Option<&str>,
    ) -> Result<Vec<Process>, EngineError>;

    /// Remove up to `batch_size` finished instances with their activities
    /// and variables; returns how many were removed
    async fn compact(&self, batch_size: usize) -> Result<usize, EngineError>;
}

/// Store for activity instances
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Persist an execution in ACTIVE state
    async fn run(&self, activity: &ActivityExecution) -> Result<ActivityExecution, EngineError>;

    /// Persist an execution as SCHEDULED for polling workers
    async fn schedule(&self, activity: &ActivityExecution)
        -> Result<ActivityExecution, EngineError>;

    /// Finish an execution normally
    async fn complete(
        &self,
        activity: &ActivityExecution,
    ) -> Result<ActivityExecution, EngineError>;

    /// Record a failure that exhausted the retry budget
    async fn fail(
        &self,
        activity: &ActivityExecution,
        failure: Failure,
    ) -> Result<ActivityExecution, EngineError>;

    /// Force a terminal state without completion side effects
    async fn terminate(
        &self,
        activity: &ActivityExecution,
    ) -> Result<ActivityExecution, EngineError>;

    /// Put an execution back in the worker queue
    ///
    /// An active execution consumes one retry; a failed execution re-enters
    /// the queue with a fresh budget.
    async fn retry(
        &self,
        activity: &ActivityExecution,
        timeout: Option<DateTime<Utc>>,
    ) -> Result<ActivityExecution, EngineError>;

    /// Look up an execution by id
    async fn find_by_id(&self, id: &ActivityId) -> Result<Option<ActivityExecution>, EngineError>;

    /// All executions of one definition node within a process
    async fn find_by_definition_id(
        &self,
        process_id: &ProcessId,
        definition_id: &ActivityDefinitionId,
    ) -> Result<Vec<ActivityExecution>, EngineError>;

    /// In-flight (scheduled or active) executions of the given definition
    /// nodes within a process
    async fn find_active(
        &self,
        process_id: &ProcessId,
        definition_ids: &[ActivityDefinitionId],
    ) -> Result<Vec<ActivityExecution>, EngineError>;

    /// Failed executions of a process
    async fn find_failed(&self, process_id: &ProcessId)
        -> Result<Vec<ActivityExecution>, EngineError>;

    /// How many executions of one definition node exist within a process
    async fn count_by_definition_id(
        &self,
        process_id: &ProcessId,
        definition_id: &ActivityDefinitionId,
    ) -> Result<usize, EngineError>;

    /// Whether no execution of the process is still in flight or failed
    async fn is_all_completed(&self, process_id: &ProcessId) -> Result<bool, EngineError>;

    /// Whether any execution of the process is failed
    async fn is_any_failed(&self, process_id: &ProcessId) -> Result<bool, EngineError>;

    /// Hand out up to `limit` scheduled tasks of a topic to a worker,
    /// locking each one
    async fn poll(
        &self,
        topic: &str,
        definition_key: &str,
        limit: usize,
    ) -> Result<Vec<ActivityExecution>, EngineError>;

    /// Locked polled tasks whose timeout elapsed
    async fn find_timed_out(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ActivityExecution>, EngineError>;
}

/// Store for process definitions
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Persist a definition version
    async fn save(&self, definition: ProcessDefinition) -> Result<ProcessDefinition, EngineError>;

    /// Look up a definition by id
    async fn find_by_id(
        &self,
        id: &ProcessDefinitionId,
    ) -> Result<Option<ProcessDefinition>, EngineError>;

    /// Latest version of a definition key
    async fn find_latest_by_key(
        &self,
        key: &str,
    ) -> Result<Option<ProcessDefinition>, EngineError>;

    /// Specific version of a definition key
    async fn find_by_key_and_version(
        &self,
        key: &str,
        version: i32,
    ) -> Result<Option<ProcessDefinition>, EngineError>;
}

/// Store for variable records
#[async_trait]
pub trait VariableStore: Send + Sync {
    /// Variables of a process whose scope level is in the given chain
    async fn find_in_scope(
        &self,
        process_id: &ProcessId,
        scope: &[String],
    ) -> Result<Vec<Variable>, EngineError>;

    /// All variables of a process
    async fn find_by_process(&self, process_id: &ProcessId) -> Result<Vec<Variable>, EngineError>;

    /// Insert or update a batch of records, keyed by record id
    async fn upsert(&self, batch: Vec<Variable>) -> Result<(), EngineError>;
}

/// Store for background job records
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a freshly started job
    async fn run(&self, job: Job) -> Result<Job, EngineError>;

    /// Record a successful run
    async fn complete(&self, id: &JobId, output: HashMap<String, Value>)
        -> Result<Job, EngineError>;

    /// Record a failed run
    async fn fail(
        &self,
        id: &JobId,
        reason: String,
        trace: Option<String>,
    ) -> Result<Job, EngineError>;
}

/// Distributed lease coordinating exclusive background work
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Take the named lease until the given instant
    ///
    /// Succeeds when the lease is free or its previous holder's term
    /// expired; returns whether the caller now holds it.
    async fn try_acquire(
        &self,
        name: &str,
        until: DateTime<Utc>,
        owner: &str,
    ) -> Result<bool, EngineError>;

    /// Give the named lease back early
    async fn release(&self, name: &str) -> Result<(), EngineError>;
}
