//! In-memory store implementations for tests and embedding
//!
//! One concurrent-map-backed store implements every persistence port, so
//! compaction can remove a process together with its activities and
//! variables.

use super::{
    ActivityStore, DefinitionStore, JobStore, LeaseStore, ProcessStore, VariableStore,
};
use crate::model::{
    ActivityDefinitionId, ActivityExecution, ActivityId, ActivityState, Failure, Job, JobId,
    Process, ProcessDefinition, ProcessDefinitionId, ProcessFilter, ProcessId, Variable,
};
use crate::EngineError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct LeaseRow {
    until: DateTime<Utc>,
    owner: String,
}

/// Concurrent in-memory store implementing every persistence port
pub struct MemoryEngineStore {
    processes: DashMap<String, Process>,
    activities: DashMap<String, ActivityExecution>,
    variables: DashMap<String, Variable>,
    definitions: DashMap<String, ProcessDefinition>,
    jobs: DashMap<String, Job>,
    leases: DashMap<String, LeaseRow>,
}

impl MemoryEngineStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            processes: DashMap::with_capacity(64),
            activities: DashMap::with_capacity(256),
            variables: DashMap::with_capacity(256),
            definitions: DashMap::with_capacity(16),
            jobs: DashMap::with_capacity(16),
            leases: DashMap::with_capacity(4),
        }
    }

    fn update_process<F>(&self, id: &ProcessId, apply: F) -> Result<Process, EngineError>
    where
        F: FnOnce(&mut Process) -> Result<(), EngineError>,
    {
        let mut entry = self
            .processes
            .get_mut(&id.0)
            .ok_or_else(|| EngineError::ProcessNotFound(id.0.clone()))?;
        apply(entry.value_mut())?;
        Ok(entry.clone())
    }

    fn load_activity_or(&self, activity: &ActivityExecution) -> ActivityExecution {
        self.activities
            .get(&activity.id.0)
            .map(|stored| stored.clone())
            .unwrap_or_else(|| activity.clone())
    }

    fn save_activity(&self, activity: ActivityExecution) -> ActivityExecution {
        self.activities
            .insert(activity.id.0.clone(), activity.clone());
        activity
    }
}

impl Default for MemoryEngineStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessStore for MemoryEngineStore {
    async fn run(&self, mut process: Process) -> Result<Process, EngineError> {
        process.start();
        self.processes.insert(process.id.0.clone(), process.clone());
        Ok(process)
    }

    async fn complete(&self, id: &ProcessId) -> Result<Process, EngineError> {
        self.update_process(id, |p| p.complete())
    }

    async fn terminate(&self, id: &ProcessId) -> Result<Process, EngineError> {
        self.update_process(id, |p| p.terminate())
    }

    async fn incident(&self, id: &ProcessId) -> Result<Process, EngineError> {
        self.update_process(id, |p| p.incident())
    }

    async fn resolve_incident(&self, id: &ProcessId) -> Result<Process, EngineError> {
        self.update_process(id, |p| p.resolve_incident())
    }

    async fn suspend(&self, id: &ProcessId) -> Result<Process, EngineError> {
        self.update_process(id, |p| p.suspend())
    }

    async fn resume(&self, id: &ProcessId) -> Result<Process, EngineError> {
        self.update_process(id, |p| p.resume())
    }

    async fn find_by_id(&self, id: &ProcessId) -> Result<Option<Process>, EngineError> {
        Ok(self.processes.get(&id.0).map(|p| p.clone()))
    }

    async fn find_by_filter(&self, filter: &ProcessFilter) -> Result<Vec<Process>, EngineError> {
        Ok(self
            .processes
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.clone())
            .collect())
    }

    async fn find_candidates(
        &self,
        message: &str,
        business_key: Option<&str>,
    ) -> Result<Vec<Process>, EngineError> {
        Ok(self
            .processes
            .iter()
            .filter(|entry| {
                let process = entry.value();
                process.is_active()
                    && !process.suspended
                    && process.definition.messages.iter().any(|m| m == message)
                    && business_key
                        .map(|key| process.business_key.as_deref() == Some(key))
                        .unwrap_or(true)
            })
            .map(|entry| entry.clone())
            .collect())
    }

    async fn compact(&self, batch_size: usize) -> Result<usize, EngineError> {
        let batch: Vec<String> = self
            .processes
            .iter()
            .filter(|entry| entry.value().is_terminal())
            .map(|entry| entry.key().clone())
            .take(batch_size)
            .collect();

        for process_id in &batch {
            self.processes.remove(process_id);
            self.activities
                .retain(|_, activity| &activity.process.id.0 != process_id);
            self.variables
                .retain(|_, variable| &variable.process_id.0 != process_id);
        }
        Ok(batch.len())
    }
}

#[async_trait]
impl ActivityStore for MemoryEngineStore {
    async fn run(&self, activity: &ActivityExecution) -> Result<ActivityExecution, EngineError> {
        let mut current = self.load_activity_or(activity);
        current.activate()?;
        Ok(self.save_activity(current))
    }

    async fn schedule(
        &self,
        activity: &ActivityExecution,
    ) -> Result<ActivityExecution, EngineError> {
        let mut current = self.load_activity_or(activity);
        if current.state != ActivityState::Scheduled {
            return Err(EngineError::transition(
                current.id.0.clone(),
                current.state,
                ActivityState::Scheduled,
            ));
        }
        current.timeout = activity.timeout;
        Ok(self.save_activity(current))
    }

    async fn complete(
        &self,
        activity: &ActivityExecution,
    ) -> Result<ActivityExecution, EngineError> {
        let mut current = self.load_activity_or(activity);
        current.complete()?;
        current.variables = activity.variables.clone();
        Ok(self.save_activity(current))
    }

    async fn fail(
        &self,
        activity: &ActivityExecution,
        failure: Failure,
    ) -> Result<ActivityExecution, EngineError> {
        let mut current = self.load_activity_or(activity);
        current.fail(failure)?;
        Ok(self.save_activity(current))
    }

    async fn terminate(
        &self,
        activity: &ActivityExecution,
    ) -> Result<ActivityExecution, EngineError> {
        let mut current = self.load_activity_or(activity);
        current.terminate()?;
        Ok(self.save_activity(current))
    }

    async fn retry(
        &self,
        activity: &ActivityExecution,
        timeout: Option<DateTime<Utc>>,
    ) -> Result<ActivityExecution, EngineError> {
        let mut current = self.load_activity_or(activity);
        match current.state {
            ActivityState::Active => current.reschedule(timeout)?,
            ActivityState::Failed => current.requeue(timeout)?,
            other => {
                return Err(EngineError::transition(
                    current.id.0.clone(),
                    other,
                    ActivityState::Scheduled,
                ))
            }
        }
        Ok(self.save_activity(current))
    }

    async fn find_by_id(&self, id: &ActivityId) -> Result<Option<ActivityExecution>, EngineError> {
        Ok(self.activities.get(&id.0).map(|a| a.clone()))
    }

    async fn find_by_definition_id(
        &self,
        process_id: &ProcessId,
        definition_id: &ActivityDefinitionId,
    ) -> Result<Vec<ActivityExecution>, EngineError> {
        Ok(self
            .activities
            .iter()
            .filter(|entry| {
                let activity = entry.value();
                activity.process.id == *process_id && activity.definition_id == *definition_id
            })
            .map(|entry| entry.clone())
            .collect())
    }

    async fn find_active(
        &self,
        process_id: &ProcessId,
        definition_ids: &[ActivityDefinitionId],
    ) -> Result<Vec<ActivityExecution>, EngineError> {
        Ok(self
            .activities
            .iter()
            .filter(|entry| {
                let activity = entry.value();
                activity.process.id == *process_id
                    && matches!(
                        activity.state,
                        ActivityState::Scheduled | ActivityState::Active
                    )
                    && definition_ids.contains(&activity.definition_id)
            })
            .map(|entry| entry.clone())
            .collect())
    }

    async fn find_failed(
        &self,
        process_id: &ProcessId,
    ) -> Result<Vec<ActivityExecution>, EngineError> {
        Ok(self
            .activities
            .iter()
            .filter(|entry| {
                let activity = entry.value();
                activity.process.id == *process_id && activity.state == ActivityState::Failed
            })
            .map(|entry| entry.clone())
            .collect())
    }

    async fn count_by_definition_id(
        &self,
        process_id: &ProcessId,
        definition_id: &ActivityDefinitionId,
    ) -> Result<usize, EngineError> {
        Ok(self
            .activities
            .iter()
            .filter(|entry| {
                let activity = entry.value();
                activity.process.id == *process_id && activity.definition_id == *definition_id
            })
            .count())
    }

    async fn is_all_completed(&self, process_id: &ProcessId) -> Result<bool, EngineError> {
        Ok(!self.activities.iter().any(|entry| {
            let activity = entry.value();
            activity.process.id == *process_id
                && matches!(
                    activity.state,
                    ActivityState::Scheduled | ActivityState::Active | ActivityState::Failed
                )
        }))
    }

    async fn is_any_failed(&self, process_id: &ProcessId) -> Result<bool, EngineError> {
        Ok(self.activities.iter().any(|entry| {
            let activity = entry.value();
            activity.process.id == *process_id && activity.state == ActivityState::Failed
        }))
    }

    async fn poll(
        &self,
        topic: &str,
        definition_key: &str,
        limit: usize,
    ) -> Result<Vec<ActivityExecution>, EngineError> {
        let mut candidates: Vec<(DateTime<Utc>, String)> = self
            .activities
            .iter()
            .filter(|entry| {
                let activity = entry.value();
                // The embedded snapshot can predate a suspend or terminal
                // transition; the process table is authoritative
                let pollable = self
                    .processes
                    .get(&activity.process.id.0)
                    .map(|p| !p.is_terminal() && !p.suspended)
                    .unwrap_or(false);
                activity.state == ActivityState::Scheduled
                    && pollable
                    && activity.process.definition.key == definition_key
                    && activity
                        .definition()
                        .ok()
                        .and_then(|d| d.topic())
                        .map(|t| t == topic)
                        .unwrap_or(false)
            })
            .map(|entry| (entry.value().created_at, entry.key().clone()))
            .collect();
        candidates.sort();

        let mut polled = Vec::new();
        for (_, id) in candidates.into_iter().take(limit) {
            if let Some(mut entry) = self.activities.get_mut(&id) {
                if entry.value_mut().activate().is_ok() {
                    polled.push(entry.clone());
                }
            }
        }
        Ok(polled)
    }

    async fn find_timed_out(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ActivityExecution>, EngineError> {
        Ok(self
            .activities
            .iter()
            .filter(|entry| {
                let activity = entry.value();
                activity.state == ActivityState::Active
                    && activity
                        .definition()
                        .map(|d| d.is_polled_task())
                        .unwrap_or(false)
                    && activity.timeout.map(|t| t < now).unwrap_or(false)
            })
            .map(|entry| entry.clone())
            .collect())
    }
}

#[async_trait]
impl DefinitionStore for MemoryEngineStore {
    async fn save(&self, definition: ProcessDefinition) -> Result<ProcessDefinition, EngineError> {
        definition.validate()?;
        self.definitions
            .insert(definition.id.0.clone(), definition.clone());
        Ok(definition)
    }

    async fn find_by_id(
        &self,
        id: &ProcessDefinitionId,
    ) -> Result<Option<ProcessDefinition>, EngineError> {
        Ok(self.definitions.get(&id.0).map(|d| d.clone()))
    }

    async fn find_latest_by_key(
        &self,
        key: &str,
    ) -> Result<Option<ProcessDefinition>, EngineError> {
        Ok(self
            .definitions
            .iter()
            .filter(|entry| entry.value().key == key)
            .max_by_key(|entry| entry.value().version)
            .map(|entry| entry.clone()))
    }

    async fn find_by_key_and_version(
        &self,
        key: &str,
        version: i32,
    ) -> Result<Option<ProcessDefinition>, EngineError> {
        Ok(self
            .definitions
            .iter()
            .find(|entry| entry.value().key == key && entry.value().version == version)
            .map(|entry| entry.clone()))
    }
}

#[async_trait]
impl VariableStore for MemoryEngineStore {
    async fn find_in_scope(
        &self,
        process_id: &ProcessId,
        scope: &[String],
    ) -> Result<Vec<Variable>, EngineError> {
        Ok(self
            .variables
            .iter()
            .filter(|entry| {
                let variable = entry.value();
                variable.process_id == *process_id
                    && scope.contains(&variable.execution_definition_id)
            })
            .map(|entry| entry.clone())
            .collect())
    }

    async fn find_by_process(&self, process_id: &ProcessId) -> Result<Vec<Variable>, EngineError> {
        Ok(self
            .variables
            .iter()
            .filter(|entry| entry.value().process_id == *process_id)
            .map(|entry| entry.clone())
            .collect())
    }

    async fn upsert(&self, batch: Vec<Variable>) -> Result<(), EngineError> {
        for variable in batch {
            self.variables.insert(variable.id.0.clone(), variable);
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryEngineStore {
    async fn run(&self, job: Job) -> Result<Job, EngineError> {
        self.jobs.insert(job.id.0.clone(), job.clone());
        Ok(job)
    }

    async fn complete(
        &self,
        id: &JobId,
        output: HashMap<String, Value>,
    ) -> Result<Job, EngineError> {
        let mut entry = self
            .jobs
            .get_mut(&id.0)
            .ok_or_else(|| EngineError::Store(format!("job not found: {}", id)))?;
        entry.value_mut().complete(output)?;
        Ok(entry.clone())
    }

    async fn fail(
        &self,
        id: &JobId,
        reason: String,
        trace: Option<String>,
    ) -> Result<Job, EngineError> {
        let mut entry = self
            .jobs
            .get_mut(&id.0)
            .ok_or_else(|| EngineError::Store(format!("job not found: {}", id)))?;
        let failure = match trace {
            Some(trace) => Failure::with_trace(reason, trace),
            None => Failure::new(reason),
        };
        entry.value_mut().fail(failure)?;
        Ok(entry.clone())
    }
}

#[async_trait]
impl LeaseStore for MemoryEngineStore {
    async fn try_acquire(
        &self,
        name: &str,
        until: DateTime<Utc>,
        owner: &str,
    ) -> Result<bool, EngineError> {
        let row = LeaseRow {
            until,
            owner: owner.to_string(),
        };
        match self.leases.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().until > Utc::now() {
                    Ok(false)
                } else {
                    entry.insert(row);
                    Ok(true)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(row);
                Ok(true)
            }
        }
    }

    async fn release(&self, name: &str) -> Result<(), EngineError> {
        if let Some(mut entry) = self.leases.get_mut(name) {
            entry.value_mut().until = Utc::now();
        }
        Ok(())
    }
}
