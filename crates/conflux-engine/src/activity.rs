//! Activity lifecycle command handlers
//!
//! Each command resolves the behavior for its activity type and lets it
//! drive the stores; the completion handler then routes tokens along the
//! outgoing edges, closes enclosing scopes and completes drained processes.

use crate::behavior::BehaviorRegistry;
use crate::dispatch::{Command, CommandHandler, CommandOutput, Dispatcher};
use crate::variables::VariableService;
use conflux_core::model::{ActivityExecution, ProcessState};
use conflux_core::persistence::{ActivityStore, ProcessStore};
use conflux_core::EngineError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Handler for [`Command::RunActivity`]
pub struct RunActivityHandler {
    process_store: Arc<dyn ProcessStore>,
    registry: Arc<BehaviorRegistry>,
}

impl RunActivityHandler {
    /// Create the handler over the process store and behavior registry
    pub fn new(process_store: Arc<dyn ProcessStore>, registry: Arc<BehaviorRegistry>) -> Self {
        Self {
            process_store,
            registry,
        }
    }
}

#[async_trait]
impl CommandHandler for RunActivityHandler {
    async fn handle(
        &self,
        command: Command,
        dispatcher: &Arc<Dispatcher>,
    ) -> Result<CommandOutput, EngineError> {
        let Command::RunActivity {
            process,
            definition_id,
        } = command
        else {
            return Err(EngineError::Other(
                "activity run received a foreign command".to_string(),
            ));
        };

        // The dispatched snapshot may predate a terminal transition
        let mut process = self
            .process_store
            .find_by_id(&process.id)
            .await?
            .unwrap_or(process);

        // Flow reaching a new activity ends the incident; resolution runs
        // first because the activity can complete the process within this
        // dispatch chain
        if process.state == ProcessState::Incident {
            process = dispatcher
                .execute(Command::ResolveIncident {
                    process_id: process.id.clone(),
                })
                .await?
                .into_process()?;
        }
        let execution = ActivityExecution::new(process, definition_id);

        if (execution.process.is_terminal() && !execution.is_async()) || execution.process.suspended
        {
            tracing::debug!(
                definition = %execution.definition_id,
                process_id = %execution.process.id,
                process_state = %execution.process.state,
                "activity run skipped"
            );
            return Ok(CommandOutput::Unit);
        }

        tracing::debug!(
            definition = %execution.definition_id,
            process_id = %execution.process.id,
            "running activity"
        );
        let behavior = self.registry.resolve(execution.activity_type()?)?;
        let active = behavior.run(dispatcher, &execution).await?;
        Ok(CommandOutput::Activity(active))
    }
}

/// Handler for [`Command::TriggerActivity`]
pub struct TriggerActivityHandler {
    registry: Arc<BehaviorRegistry>,
}

impl TriggerActivityHandler {
    /// Create the handler over the behavior registry
    pub fn new(registry: Arc<BehaviorRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl CommandHandler for TriggerActivityHandler {
    async fn handle(
        &self,
        command: Command,
        dispatcher: &Arc<Dispatcher>,
    ) -> Result<CommandOutput, EngineError> {
        let Command::TriggerActivity {
            process,
            definition_id,
            variables,
        } = command
        else {
            return Err(EngineError::Other(
                "activity trigger received a foreign command".to_string(),
            ));
        };

        let definition = process
            .definition
            .activity_by_id(&definition_id)
            .cloned()
            .ok_or_else(|| EngineError::ActivityDefinitionNotFound(definition_id.0.clone()))?;
        tracing::debug!(
            definition = %definition.id,
            process_id = %process.id,
            "triggering activity"
        );
        let behavior = self.registry.resolve(definition.activity_type())?;
        behavior
            .trigger(dispatcher, &process, &definition, variables)
            .await?;
        Ok(CommandOutput::Unit)
    }
}

/// Handler for [`Command::CompleteActivity`]
pub struct CompleteActivityHandler {
    activity_store: Arc<dyn ActivityStore>,
    registry: Arc<BehaviorRegistry>,
    variables: Arc<VariableService>,
}

impl CompleteActivityHandler {
    /// Create the handler over its store, registry and variable service
    pub fn new(
        activity_store: Arc<dyn ActivityStore>,
        registry: Arc<BehaviorRegistry>,
        variables: Arc<VariableService>,
    ) -> Self {
        Self {
            activity_store,
            registry,
            variables,
        }
    }
}

#[async_trait]
impl CommandHandler for CompleteActivityHandler {
    async fn handle(
        &self,
        command: Command,
        dispatcher: &Arc<Dispatcher>,
    ) -> Result<CommandOutput, EngineError> {
        let Command::CompleteActivity {
            activity_id,
            variables,
        } = command
        else {
            return Err(EngineError::Other(
                "activity completion received a foreign command".to_string(),
            ));
        };

        let activity = self
            .activity_store
            .find_by_id(&activity_id)
            .await?
            .ok_or_else(|| EngineError::ActivityNotFound(activity_id.0.clone()))?;
        if activity.is_terminal() || (activity.process.is_terminal() && !activity.is_async()) {
            tracing::debug!(
                activity_id = %activity.id,
                state = %activity.state,
                "activity completion skipped"
            );
            return Ok(CommandOutput::Unit);
        }

        if !variables.is_empty() {
            let evaluated = self.variables.evaluate(&activity, &variables).await?;
            let (process, records) = self
                .variables
                .set_activity_variables(&activity, evaluated, false)
                .await?;
            dispatcher.dispatch_async(Command::CorrelateVariables {
                process,
                variables: records,
            });
        }

        let behavior = self.registry.resolve(activity.activity_type()?)?;
        let completed = behavior.complete(dispatcher, &activity).await?;
        Ok(CommandOutput::Activity(completed))
    }
}

/// Handler for [`Command::FailActivity`]
pub struct FailActivityHandler {
    activity_store: Arc<dyn ActivityStore>,
    registry: Arc<BehaviorRegistry>,
}

impl FailActivityHandler {
    /// Create the handler over the activity store and behavior registry
    pub fn new(activity_store: Arc<dyn ActivityStore>, registry: Arc<BehaviorRegistry>) -> Self {
        Self {
            activity_store,
            registry,
        }
    }
}

#[async_trait]
impl CommandHandler for FailActivityHandler {
    async fn handle(
        &self,
        command: Command,
        dispatcher: &Arc<Dispatcher>,
    ) -> Result<CommandOutput, EngineError> {
        let Command::FailActivity {
            activity_id,
            failure,
        } = command
        else {
            return Err(EngineError::Other(
                "activity failure received a foreign command".to_string(),
            ));
        };

        let activity = self
            .activity_store
            .find_by_id(&activity_id)
            .await?
            .ok_or_else(|| EngineError::ActivityNotFound(activity_id.0.clone()))?;
        if activity.is_terminal() || (activity.process.is_terminal() && !activity.is_async()) {
            tracing::debug!(
                activity_id = %activity.id,
                state = %activity.state,
                "activity failure skipped"
            );
            return Ok(CommandOutput::Unit);
        }

        let behavior = self.registry.resolve(activity.activity_type()?)?;
        if behavior.fail(dispatcher, &activity, failure).await? {
            tracing::debug!(activity_id = %activity.id, "activity failed");
            dispatcher
                .dispatch(Command::IncidentProcess {
                    process_id: activity.process.id.clone(),
                })
                .await?;
        }
        Ok(CommandOutput::Unit)
    }
}

/// Handler for [`Command::TerminateActivity`]
pub struct TerminateActivityHandler {
    activity_store: Arc<dyn ActivityStore>,
    registry: Arc<BehaviorRegistry>,
}

impl TerminateActivityHandler {
    /// Create the handler over the activity store and behavior registry
    pub fn new(activity_store: Arc<dyn ActivityStore>, registry: Arc<BehaviorRegistry>) -> Self {
        Self {
            activity_store,
            registry,
        }
    }
}

#[async_trait]
impl CommandHandler for TerminateActivityHandler {
    async fn handle(
        &self,
        command: Command,
        dispatcher: &Arc<Dispatcher>,
    ) -> Result<CommandOutput, EngineError> {
        let Command::TerminateActivity {
            activity_id,
            with_interruption,
        } = command
        else {
            return Err(EngineError::Other(
                "activity termination received a foreign command".to_string(),
            ));
        };

        let activity = self
            .activity_store
            .find_by_id(&activity_id)
            .await?
            .ok_or_else(|| EngineError::ActivityNotFound(activity_id.0.clone()))?;
        if activity.is_terminal() {
            tracing::debug!(
                activity_id = %activity.id,
                state = %activity.state,
                "activity termination skipped"
            );
            return Ok(CommandOutput::Activity(activity));
        }

        let behavior = self.registry.resolve(activity.activity_type()?)?;
        let terminated = behavior
            .terminate(dispatcher, &activity, with_interruption)
            .await?;
        if !with_interruption {
            dispatcher
                .dispatch(Command::HandleActivityCompletion {
                    activity: terminated.clone(),
                    with_next: false,
                })
                .await?;
        }
        Ok(CommandOutput::Activity(terminated))
    }
}

/// Handler for [`Command::RetryActivity`]
pub struct RetryActivityHandler {
    activity_store: Arc<dyn ActivityStore>,
    registry: Arc<BehaviorRegistry>,
}

impl RetryActivityHandler {
    /// Create the handler over the activity store and behavior registry
    pub fn new(activity_store: Arc<dyn ActivityStore>, registry: Arc<BehaviorRegistry>) -> Self {
        Self {
            activity_store,
            registry,
        }
    }
}

#[async_trait]
impl CommandHandler for RetryActivityHandler {
    async fn handle(
        &self,
        command: Command,
        dispatcher: &Arc<Dispatcher>,
    ) -> Result<CommandOutput, EngineError> {
        let Command::RetryActivity { activity_id } = command else {
            return Err(EngineError::Other(
                "activity retry received a foreign command".to_string(),
            ));
        };

        let activity = self
            .activity_store
            .find_by_id(&activity_id)
            .await?
            .ok_or_else(|| EngineError::ActivityNotFound(activity_id.0.clone()))?;
        let behavior = self.registry.resolve(activity.activity_type()?)?;
        let retried = behavior.retry(dispatcher, &activity).await?;
        Ok(CommandOutput::Activity(retried))
    }
}

/// Handler for [`Command::RetryAllActivities`]
pub struct RetryAllActivitiesHandler {
    activity_store: Arc<dyn ActivityStore>,
    registry: Arc<BehaviorRegistry>,
}

impl RetryAllActivitiesHandler {
    /// Create the handler over the activity store and behavior registry
    pub fn new(activity_store: Arc<dyn ActivityStore>, registry: Arc<BehaviorRegistry>) -> Self {
        Self {
            activity_store,
            registry,
        }
    }
}

#[async_trait]
impl CommandHandler for RetryAllActivitiesHandler {
    async fn handle(
        &self,
        command: Command,
        dispatcher: &Arc<Dispatcher>,
    ) -> Result<CommandOutput, EngineError> {
        let Command::RetryAllActivities { process_id } = command else {
            return Err(EngineError::Other(
                "activity retry received a foreign command".to_string(),
            ));
        };

        let failed = self.activity_store.find_failed(&process_id).await?;
        tracing::debug!(process_id = %process_id, count = failed.len(), "retrying failed activities");
        for execution in failed {
            let behavior = self.registry.resolve(execution.activity_type()?)?;
            behavior.retry(dispatcher, &execution).await?;
        }
        Ok(CommandOutput::Unit)
    }
}

/// Handler for [`Command::HandleActivityCompletion`]
///
/// With `with_next` the behavior picks the outgoing edges and each target
/// is run. Without a continuation the handler closes the enclosing scope
/// once its children are drained, or completes the process when the last
/// root-level execution settles.
pub struct HandleActivityCompletionHandler {
    activity_store: Arc<dyn ActivityStore>,
    registry: Arc<BehaviorRegistry>,
}

impl HandleActivityCompletionHandler {
    /// Create the handler over the activity store and behavior registry
    pub fn new(activity_store: Arc<dyn ActivityStore>, registry: Arc<BehaviorRegistry>) -> Self {
        Self {
            activity_store,
            registry,
        }
    }
}

#[async_trait]
impl CommandHandler for HandleActivityCompletionHandler {
    async fn handle(
        &self,
        command: Command,
        dispatcher: &Arc<Dispatcher>,
    ) -> Result<CommandOutput, EngineError> {
        let Command::HandleActivityCompletion { activity, with_next } = command else {
            return Err(EngineError::Other(
                "completion routing received a foreign command".to_string(),
            ));
        };

        if with_next {
            let behavior = self.registry.resolve(activity.activity_type()?)?;
            let next = match behavior.next_definitions(&activity).await {
                Ok(next) => next,
                Err(error @ EngineError::Gateway { .. }) => {
                    tracing::warn!(activity_id = %activity.id, %error, "gateway routing failed");
                    dispatcher
                        .dispatch(Command::IncidentProcess {
                            process_id: activity.process.id.clone(),
                        })
                        .await?;
                    return Ok(CommandOutput::Unit);
                }
                Err(other) => return Err(other),
            };
            if !next.is_empty() {
                for definition in next {
                    dispatcher
                        .dispatch(Command::RunActivity {
                            process: activity.process.clone(),
                            definition_id: definition.id,
                        })
                        .await?;
                }
                return Ok(CommandOutput::Unit);
            }
        }

        let definition = activity.definition()?;
        if let Some(parent_id) = definition.parent_id.clone() {
            let child_ids: Vec<_> = activity
                .process
                .definition
                .children_of(&parent_id)
                .into_iter()
                .map(|child| child.id.clone())
                .collect();
            let live = self
                .activity_store
                .find_active(&activity.process.id, &child_ids)
                .await?;
            if !live.is_empty() {
                return Ok(CommandOutput::Unit);
            }

            let parent = self
                .activity_store
                .find_by_definition_id(&activity.process.id, &parent_id)
                .await?
                .into_iter()
                .find(|execution| !execution.is_terminal());
            if let Some(parent) = parent {
                dispatcher
                    .dispatch(Command::CompleteActivity {
                        activity_id: parent.id,
                        variables: HashMap::new(),
                    })
                    .await?;
            }
            return Ok(CommandOutput::Unit);
        }

        // Event subprocess tokens never finish the process on their own
        if activity.is_async() {
            return Ok(CommandOutput::Unit);
        }
        if self
            .activity_store
            .is_all_completed(&activity.process.id)
            .await?
        {
            dispatcher
                .dispatch(Command::CompleteProcess {
                    process_id: activity.process.id.clone(),
                })
                .await?;
        }
        Ok(CommandOutput::Unit)
    }
}
