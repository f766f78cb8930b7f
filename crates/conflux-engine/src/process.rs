//! Process lifecycle command handlers
//!
//! Starting an instance persists it, seeds its initial variables and runs
//! the start activity. Completion and termination ripple back into the
//! caller when the instance was spawned by a call activity.

use crate::dispatch::{Command, CommandHandler, CommandOutput, Dispatcher};
use crate::variables::VariableService;
use conflux_core::model::{ActivityId, ProcessState};
use conflux_core::persistence::{ActivityStore, ProcessStore};
use conflux_core::EngineError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Handler for [`Command::RunProcess`]
pub struct RunProcessHandler {
    process_store: Arc<dyn ProcessStore>,
    variables: Arc<VariableService>,
}

impl RunProcessHandler {
    /// Create the handler over the process store and variable service
    pub fn new(process_store: Arc<dyn ProcessStore>, variables: Arc<VariableService>) -> Self {
        Self {
            process_store,
            variables,
        }
    }
}

#[async_trait]
impl CommandHandler for RunProcessHandler {
    async fn handle(
        &self,
        command: Command,
        dispatcher: &Arc<Dispatcher>,
    ) -> Result<CommandOutput, EngineError> {
        let Command::RunProcess { process } = command else {
            return Err(EngineError::Other(
                "process start received a foreign command".to_string(),
            ));
        };

        let start_id = process.definition.start_activity()?.id.clone();
        let process = self.process_store.run(process).await?;
        tracing::info!(
            process_id = %process.id,
            definition = %process.definition.id,
            "process started"
        );

        if !process.variables.is_empty() {
            self.variables
                .set_process_variables(&process, process.variables.clone())
                .await?;
        }

        dispatcher
            .dispatch(Command::RunActivity {
                process: process.clone(),
                definition_id: start_id,
            })
            .await?;
        Ok(CommandOutput::Process(process))
    }
}

/// Handler for [`Command::CompleteProcess`]
pub struct CompleteProcessHandler {
    process_store: Arc<dyn ProcessStore>,
}

impl CompleteProcessHandler {
    /// Create the handler over the process store
    pub fn new(process_store: Arc<dyn ProcessStore>) -> Self {
        Self { process_store }
    }
}

#[async_trait]
impl CommandHandler for CompleteProcessHandler {
    async fn handle(
        &self,
        command: Command,
        dispatcher: &Arc<Dispatcher>,
    ) -> Result<CommandOutput, EngineError> {
        let Command::CompleteProcess { process_id } = command else {
            return Err(EngineError::Other(
                "process completion received a foreign command".to_string(),
            ));
        };

        let process = self.process_store.complete(&process_id).await?;
        tracing::info!(process_id = %process.id, "process completed");

        // A spawned instance shares its id with the caller's execution
        if process.is_call_activity() {
            dispatcher
                .dispatch(Command::CompleteActivity {
                    activity_id: ActivityId(process.id.0.clone()),
                    variables: HashMap::new(),
                })
                .await?;
        }
        Ok(CommandOutput::Process(process))
    }
}

/// Handler for [`Command::TerminateProcess`]
pub struct TerminateProcessHandler {
    process_store: Arc<dyn ProcessStore>,
    activity_store: Arc<dyn ActivityStore>,
}

impl TerminateProcessHandler {
    /// Create the handler over the process and activity stores
    pub fn new(
        process_store: Arc<dyn ProcessStore>,
        activity_store: Arc<dyn ActivityStore>,
    ) -> Self {
        Self {
            process_store,
            activity_store,
        }
    }
}

#[async_trait]
impl CommandHandler for TerminateProcessHandler {
    async fn handle(
        &self,
        command: Command,
        dispatcher: &Arc<Dispatcher>,
    ) -> Result<CommandOutput, EngineError> {
        let Command::TerminateProcess {
            process_id,
            terminate_call_activity,
        } = command
        else {
            return Err(EngineError::Other(
                "process termination received a foreign command".to_string(),
            ));
        };

        let process = self.process_store.terminate(&process_id).await?;
        tracing::info!(process_id = %process.id, "process terminated");

        let all_ids: Vec<_> = process
            .definition
            .activities
            .iter()
            .map(|definition| definition.id.clone())
            .collect();
        let live = self.activity_store.find_active(&process.id, &all_ids).await?;
        for execution in live {
            // Completions race with the sweep; the transition check decides
            if let Err(error) = self.activity_store.terminate(&execution).await {
                tracing::debug!(activity_id = %execution.id, %error, "execution already settled");
            }
        }

        if terminate_call_activity && process.is_call_activity() {
            dispatcher
                .dispatch(Command::TerminateActivity {
                    activity_id: ActivityId(process.id.0.clone()),
                    with_interruption: false,
                })
                .await?;
        }
        Ok(CommandOutput::Process(process))
    }
}

/// Handler for [`Command::IncidentProcess`]
pub struct IncidentProcessHandler {
    process_store: Arc<dyn ProcessStore>,
}

impl IncidentProcessHandler {
    /// Create the handler over the process store
    pub fn new(process_store: Arc<dyn ProcessStore>) -> Self {
        Self { process_store }
    }
}

#[async_trait]
impl CommandHandler for IncidentProcessHandler {
    async fn handle(
        &self,
        command: Command,
        _dispatcher: &Arc<Dispatcher>,
    ) -> Result<CommandOutput, EngineError> {
        let Command::IncidentProcess { process_id } = command else {
            return Err(EngineError::Other(
                "incident received a foreign command".to_string(),
            ));
        };

        let current = self
            .process_store
            .find_by_id(&process_id)
            .await?
            .ok_or_else(|| EngineError::ProcessNotFound(process_id.0.clone()))?;
        if current.state == ProcessState::Incident {
            return Ok(CommandOutput::Process(current));
        }

        let process = self.process_store.incident(&process_id).await?;
        tracing::warn!(process_id = %process.id, "process flagged with incident");
        Ok(CommandOutput::Process(process))
    }
}

/// Handler for [`Command::ResolveIncident`]
pub struct ResolveIncidentHandler {
    process_store: Arc<dyn ProcessStore>,
}

impl ResolveIncidentHandler {
    /// Create the handler over the process store
    pub fn new(process_store: Arc<dyn ProcessStore>) -> Self {
        Self { process_store }
    }
}

#[async_trait]
impl CommandHandler for ResolveIncidentHandler {
    async fn handle(
        &self,
        command: Command,
        dispatcher: &Arc<Dispatcher>,
    ) -> Result<CommandOutput, EngineError> {
        let Command::ResolveIncident { process_id } = command else {
            return Err(EngineError::Other(
                "incident resolution received a foreign command".to_string(),
            ));
        };

        let process = self.process_store.resolve_incident(&process_id).await?;
        tracing::info!(process_id = %process.id, "incident resolved");

        dispatcher
            .dispatch(Command::RetryAllActivities {
                process_id: process.id.clone(),
            })
            .await?;
        Ok(CommandOutput::Process(process))
    }
}
