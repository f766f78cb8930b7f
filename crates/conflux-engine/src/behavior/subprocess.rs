//! Scope behaviors
//!
//! Embedded subprocesses open a nested scope inside the same instance,
//! event subprocesses do the same for correlated signals, and call
//! activities spawn a separate process instance with variable mappings
//! across the boundary.

use crate::behavior::ActivityBehavior;
use crate::dispatch::{Command, Dispatcher};
use crate::variables::VariableService;
use conflux_core::model::{
    ActivityExecution, ActivityPayload, IoMapping, Process, ProcessId,
};
use conflux_core::persistence::{ActivityStore, DefinitionStore, ProcessStore};
use conflux_core::{EngineError, ExpressionEvaluator};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Activate the scope and run its start event
async fn run_scope(
    store: &Arc<dyn ActivityStore>,
    dispatcher: &Arc<Dispatcher>,
    activity: &ActivityExecution,
) -> Result<ActivityExecution, EngineError> {
    let active = store.run(activity).await?;
    let start = active
        .process
        .definition
        .start_activity_of(&active.definition_id)
        .ok_or_else(|| {
            EngineError::Validation(format!(
                "subprocess {} has no start event",
                active.definition_id
            ))
        })?;

    dispatcher
        .dispatch(Command::RunActivity {
            process: active.process.clone(),
            definition_id: start.id.clone(),
        })
        .await?;
    Ok(active)
}

/// Terminate the scope's live children before the scope itself
async fn terminate_scope(
    store: &Arc<dyn ActivityStore>,
    dispatcher: &Arc<Dispatcher>,
    activity: &ActivityExecution,
) -> Result<ActivityExecution, EngineError> {
    let child_ids: Vec<_> = activity
        .child_definitions()
        .into_iter()
        .map(|child| child.id.clone())
        .collect();
    let live = store.find_active(&activity.process.id, &child_ids).await?;
    for child in live {
        dispatcher
            .dispatch(Command::TerminateActivity {
                activity_id: child.id,
                with_interruption: true,
            })
            .await?;
    }
    store.terminate(activity).await
}

/// Behavior for embedded subprocesses
pub struct SubprocessBehavior {
    activity_store: Arc<dyn ActivityStore>,
}

impl SubprocessBehavior {
    /// Create the behavior over the activity store
    pub fn new(activity_store: Arc<dyn ActivityStore>) -> Self {
        Self { activity_store }
    }
}

#[async_trait]
impl ActivityBehavior for SubprocessBehavior {
    fn activity_store(&self) -> &Arc<dyn ActivityStore> {
        &self.activity_store
    }

    async fn run(
        &self,
        dispatcher: &Arc<Dispatcher>,
        activity: &ActivityExecution,
    ) -> Result<ActivityExecution, EngineError> {
        run_scope(&self.activity_store, dispatcher, activity).await
    }

    async fn terminate(
        &self,
        dispatcher: &Arc<Dispatcher>,
        activity: &ActivityExecution,
        _with_interruption: bool,
    ) -> Result<ActivityExecution, EngineError> {
        terminate_scope(&self.activity_store, dispatcher, activity).await
    }
}

/// Behavior for event subprocesses
///
/// Runs like an embedded subprocess but never routes a continuation: the
/// scope is opened by a correlated signal, not by an incoming edge.
pub struct EventSubprocessBehavior {
    activity_store: Arc<dyn ActivityStore>,
}

impl EventSubprocessBehavior {
    /// Create the behavior over the activity store
    pub fn new(activity_store: Arc<dyn ActivityStore>) -> Self {
        Self { activity_store }
    }
}

#[async_trait]
impl ActivityBehavior for EventSubprocessBehavior {
    fn activity_store(&self) -> &Arc<dyn ActivityStore> {
        &self.activity_store
    }

    async fn run(
        &self,
        dispatcher: &Arc<Dispatcher>,
        activity: &ActivityExecution,
    ) -> Result<ActivityExecution, EngineError> {
        run_scope(&self.activity_store, dispatcher, activity).await
    }

    /// The detached scope finishes without feeding parent completion
    async fn complete(
        &self,
        _dispatcher: &Arc<Dispatcher>,
        activity: &ActivityExecution,
    ) -> Result<ActivityExecution, EngineError> {
        self.activity_store.complete(activity).await
    }

    async fn terminate(
        &self,
        dispatcher: &Arc<Dispatcher>,
        activity: &ActivityExecution,
        _with_interruption: bool,
    ) -> Result<ActivityExecution, EngineError> {
        terminate_scope(&self.activity_store, dispatcher, activity).await
    }
}

/// Apply input or output mappings against a variable context
fn apply_mappings(
    mappings: &[IoMapping],
    context: &HashMap<String, Value>,
    evaluator: &Arc<dyn ExpressionEvaluator>,
) -> Result<HashMap<String, Value>, EngineError> {
    let mut mapped = HashMap::new();
    for mapping in mappings {
        match mapping {
            IoMapping::Copy { source, target } => {
                if let Some(value) = context.get(source) {
                    mapped.insert(target.clone(), value.clone());
                }
            }
            IoMapping::Expression { expression, target } => {
                mapped.insert(target.clone(), evaluator.evaluate(expression, context)?);
            }
            IoMapping::All => {
                for (key, value) in context {
                    mapped.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
        }
    }
    Ok(mapped)
}

/// Behavior spawning a child process instance
///
/// The child instance shares its id with the call activity execution, so
/// completing the child finds its way back to the caller.
pub struct CallActivityBehavior {
    activity_store: Arc<dyn ActivityStore>,
    process_store: Arc<dyn ProcessStore>,
    definition_store: Arc<dyn DefinitionStore>,
    variables: Arc<VariableService>,
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl CallActivityBehavior {
    /// Create the behavior over the stores, variables and expression port
    pub fn new(
        activity_store: Arc<dyn ActivityStore>,
        process_store: Arc<dyn ProcessStore>,
        definition_store: Arc<dyn DefinitionStore>,
        variables: Arc<VariableService>,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> Self {
        Self {
            activity_store,
            process_store,
            definition_store,
            variables,
            evaluator,
        }
    }

    fn call_payload(
        activity: &ActivityExecution,
    ) -> Result<(String, Option<i32>, Vec<IoMapping>, Vec<IoMapping>), EngineError> {
        match &activity.definition()?.payload {
            ActivityPayload::CallActivity {
                called_element,
                version,
                inputs,
                outputs,
            } => Ok((
                called_element.clone(),
                *version,
                inputs.clone(),
                outputs.clone(),
            )),
            _ => Err(EngineError::Validation(format!(
                "activity {} is not a call activity",
                activity.definition_id
            ))),
        }
    }
}

#[async_trait]
impl ActivityBehavior for CallActivityBehavior {
    fn activity_store(&self) -> &Arc<dyn ActivityStore> {
        &self.activity_store
    }

    /// Resolve the called definition, map the inputs and spawn the child
    async fn run(
        &self,
        dispatcher: &Arc<Dispatcher>,
        activity: &ActivityExecution,
    ) -> Result<ActivityExecution, EngineError> {
        let (called_element, version, inputs, _) = Self::call_payload(activity)?;
        let active = self.activity_store.run(activity).await?;

        let called = match version {
            Some(version) => {
                self.definition_store
                    .find_by_key_and_version(&called_element, version)
                    .await?
            }
            None => self.definition_store.find_latest_by_key(&called_element).await?,
        }
        .ok_or_else(|| EngineError::DefinitionNotFound(called_element.clone()))?;

        let context = self.variables.scoped_variables(&active).await?;
        let seeded = apply_mappings(&inputs, &context, &self.evaluator)?;
        let child = Process::spawned(called, &active.process, active.id.0.clone(), seeded);

        tracing::debug!(
            caller = %active.process.id,
            child = %child.id,
            definition = %child.definition.id,
            "spawning called process"
        );
        dispatcher.dispatch(Command::RunProcess { process: child }).await?;
        Ok(active)
    }

    /// Map the finished child's variables back before routing on
    async fn complete(
        &self,
        dispatcher: &Arc<Dispatcher>,
        activity: &ActivityExecution,
    ) -> Result<ActivityExecution, EngineError> {
        let (_, _, _, outputs) = Self::call_payload(activity)?;
        let completed = self.activity_store.complete(activity).await?;

        if !outputs.is_empty() {
            let child_id = ProcessId(completed.id.0.clone());
            if let Some(child) = self.process_store.find_by_id(&child_id).await? {
                let context = self.variables.process_variables(&child).await?;
                let mapped = apply_mappings(&outputs, &context, &self.evaluator)?;
                if !mapped.is_empty() {
                    dispatcher
                        .dispatch(Command::SetVariables {
                            execution_id: completed.process.id.0.clone(),
                            variables: mapped,
                            local: false,
                        })
                        .await?;
                }
            }
        }

        dispatcher
            .dispatch(Command::HandleActivityCompletion {
                activity: completed.clone(),
                with_next: true,
            })
            .await?;
        Ok(completed)
    }

    /// Retrying the caller retries the failed work inside the child
    async fn retry(
        &self,
        dispatcher: &Arc<Dispatcher>,
        activity: &ActivityExecution,
    ) -> Result<ActivityExecution, EngineError> {
        dispatcher.dispatch_async(Command::RetryAllActivities {
            process_id: ProcessId(activity.id.0.clone()),
        });
        Ok(activity.clone())
    }

    async fn terminate(
        &self,
        dispatcher: &Arc<Dispatcher>,
        activity: &ActivityExecution,
        _with_interruption: bool,
    ) -> Result<ActivityExecution, EngineError> {
        let child_id = ProcessId(activity.id.0.clone());
        if let Some(child) = self.process_store.find_by_id(&child_id).await? {
            if !child.is_terminal() {
                dispatcher
                    .dispatch(Command::TerminateProcess {
                        process_id: child.id,
                        terminate_call_activity: false,
                    })
                    .await?;
            }
        }
        self.activity_store.terminate(activity).await
    }
}
