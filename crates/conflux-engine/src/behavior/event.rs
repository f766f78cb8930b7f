//! Event behaviors
//!
//! Triggerable start events open their event subprocess, terminate end
//! events tear down their scope, throwing events hand their signal to the
//! correlation services, and catch events wait until a trigger completes
//! them. Plain start and end events use the pass-through behavior.

use crate::behavior::{cancel_event_gateway_siblings, ActivityBehavior};
use crate::correlation::{ErrorCorrelation, EscalationCorrelation};
use crate::dispatch::{Command, Dispatcher};
use conflux_core::model::{
    ActivityDefinition, ActivityExecution, ActivityType, Process,
};
use conflux_core::persistence::ActivityStore;
use conflux_core::EngineError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Behavior for start events that open an event subprocess when triggered
pub struct TriggerableStartEventBehavior {
    activity_store: Arc<dyn ActivityStore>,
}

impl TriggerableStartEventBehavior {
    /// Create the behavior over the activity store
    pub fn new(activity_store: Arc<dyn ActivityStore>) -> Self {
        Self { activity_store }
    }

    /// Terminate the live executions of the scope the event subprocess
    /// interrupts; detached event subprocess executions stay untouched
    async fn interrupt_host(
        &self,
        dispatcher: &Arc<Dispatcher>,
        activity: &ActivityExecution,
        subprocess: &ActivityDefinition,
    ) -> Result<(), EngineError> {
        let definition = &activity.process.definition;
        let candidates: Vec<_> = match &subprocess.parent_id {
            None => definition
                .activities
                .iter()
                .map(|activity| activity.id.clone())
                .collect(),
            Some(host_id) => definition
                .children_of(host_id)
                .into_iter()
                .map(|child| child.id.clone())
                .collect(),
        };

        let live = self
            .activity_store
            .find_active(&activity.process.id, &candidates)
            .await?;
        for execution in live {
            if execution.is_async() {
                continue;
            }
            tracing::debug!(
                subprocess = %subprocess.id,
                interrupted = %execution.id,
                "interrupting scope for event subprocess"
            );
            dispatcher
                .dispatch(Command::TerminateActivity {
                    activity_id: execution.id,
                    with_interruption: true,
                })
                .await?;
        }
        Ok(())
    }

    fn event_subprocess<'a>(
        activity: &'a ActivityExecution,
    ) -> Result<&'a ActivityDefinition, EngineError> {
        activity
            .definition()?
            .parent_id
            .as_ref()
            .and_then(|parent| activity.process.definition.activity_by_id(parent))
            .filter(|parent| parent.activity_type() == ActivityType::EventSubprocess)
            .ok_or_else(|| {
                EngineError::Correlation(format!(
                    "start event {} has no event subprocess to trigger",
                    activity.definition_id
                ))
            })
    }
}

#[async_trait]
impl ActivityBehavior for TriggerableStartEventBehavior {
    fn activity_store(&self) -> &Arc<dyn ActivityStore> {
        &self.activity_store
    }

    /// A correlated signal opens the surrounding event subprocess
    async fn trigger(
        &self,
        dispatcher: &Arc<Dispatcher>,
        process: &Process,
        definition: &ActivityDefinition,
        _variables: HashMap<String, Value>,
    ) -> Result<(), EngineError> {
        let subprocess = definition
            .parent_id
            .as_ref()
            .and_then(|parent| process.definition.activity_by_id(parent))
            .filter(|parent| parent.activity_type() == ActivityType::EventSubprocess)
            .ok_or_else(|| {
                EngineError::Correlation(format!(
                    "start event {} has no event subprocess to trigger",
                    definition.id
                ))
            })?;

        dispatcher
            .dispatch(Command::RunActivity {
                process: process.clone(),
                definition_id: subprocess.id.clone(),
            })
            .await
    }

    /// An interrupting start tears down its host scope before routing on
    async fn complete(
        &self,
        dispatcher: &Arc<Dispatcher>,
        activity: &ActivityExecution,
    ) -> Result<ActivityExecution, EngineError> {
        let completed = self.activity_store.complete(activity).await?;

        if completed.definition()?.interrupting() {
            let subprocess = Self::event_subprocess(&completed)?.clone();
            self.interrupt_host(dispatcher, &completed, &subprocess)
                .await?;
        }

        dispatcher
            .dispatch(Command::HandleActivityCompletion {
                activity: completed.clone(),
                with_next: true,
            })
            .await?;
        Ok(completed)
    }
}

/// Behavior tearing down the enclosing scope on completion
pub struct TerminateEndEventBehavior {
    activity_store: Arc<dyn ActivityStore>,
}

impl TerminateEndEventBehavior {
    /// Create the behavior over the activity store
    pub fn new(activity_store: Arc<dyn ActivityStore>) -> Self {
        Self { activity_store }
    }
}

#[async_trait]
impl ActivityBehavior for TerminateEndEventBehavior {
    fn activity_store(&self) -> &Arc<dyn ActivityStore> {
        &self.activity_store
    }

    /// At the root the whole process terminates; inside a subprocess only
    /// the enclosing scope does. An interrupting top-level event subprocess
    /// takes the process down with it.
    async fn complete(
        &self,
        dispatcher: &Arc<Dispatcher>,
        activity: &ActivityExecution,
    ) -> Result<ActivityExecution, EngineError> {
        let completed = self.activity_store.complete(activity).await?;
        let definition = &completed.process.definition;

        let Some(parent_id) = completed.definition()?.parent_id.clone() else {
            dispatcher
                .dispatch(Command::TerminateProcess {
                    process_id: completed.process.id.clone(),
                    terminate_call_activity: false,
                })
                .await?;
            return Ok(completed);
        };

        let parent_definition = definition.activity_by_id(&parent_id).ok_or_else(|| {
            EngineError::ActivityDefinitionNotFound(parent_id.0.clone())
        })?;
        let parent_execution = self
            .activity_store
            .find_by_definition_id(&completed.process.id, &parent_id)
            .await?
            .into_iter()
            .find(|execution| !execution.is_terminal())
            .ok_or_else(|| EngineError::ActivityNotFound(parent_id.0.clone()))?;

        if parent_definition.activity_type() == ActivityType::EventSubprocess {
            let interrupting = definition
                .start_activity_of(&parent_id)
                .map(|start| start.interrupting())
                .unwrap_or(false);

            dispatcher
                .dispatch(Command::TerminateActivity {
                    activity_id: parent_execution.id,
                    with_interruption: true,
                })
                .await?;

            if interrupting && parent_definition.parent_id.is_none() {
                dispatcher
                    .dispatch(Command::TerminateProcess {
                        process_id: completed.process.id.clone(),
                        terminate_call_activity: false,
                    })
                    .await?;
            }
        } else {
            dispatcher
                .dispatch(Command::TerminateActivity {
                    activity_id: parent_execution.id,
                    with_interruption: false,
                })
                .await?;
        }
        Ok(completed)
    }

    async fn next_definitions(
        &self,
        _activity: &ActivityExecution,
    ) -> Result<Vec<ActivityDefinition>, EngineError> {
        Ok(Vec::new())
    }
}

/// Behavior handing a raised error code to error correlation
pub struct ErrorEndEventBehavior {
    activity_store: Arc<dyn ActivityStore>,
    correlation: Arc<ErrorCorrelation>,
}

impl ErrorEndEventBehavior {
    /// Create the behavior over the store and the correlation service
    pub fn new(activity_store: Arc<dyn ActivityStore>, correlation: Arc<ErrorCorrelation>) -> Self {
        Self {
            activity_store,
            correlation,
        }
    }
}

#[async_trait]
impl ActivityBehavior for ErrorEndEventBehavior {
    fn activity_store(&self) -> &Arc<dyn ActivityStore> {
        &self.activity_store
    }

    /// Correlation routes the error; the token never continues here
    async fn complete(
        &self,
        dispatcher: &Arc<Dispatcher>,
        activity: &ActivityExecution,
    ) -> Result<ActivityExecution, EngineError> {
        let completed = self.activity_store.complete(activity).await?;
        self.correlation.correlate(dispatcher, &completed).await?;
        Ok(completed)
    }

    async fn next_definitions(
        &self,
        _activity: &ActivityExecution,
    ) -> Result<Vec<ActivityDefinition>, EngineError> {
        Ok(Vec::new())
    }
}

/// Behavior handing a raised escalation code to escalation correlation
pub struct EscalationThrowBehavior {
    activity_store: Arc<dyn ActivityStore>,
    correlation: Arc<EscalationCorrelation>,
}

impl EscalationThrowBehavior {
    /// Create the behavior over the store and the correlation service
    pub fn new(
        activity_store: Arc<dyn ActivityStore>,
        correlation: Arc<EscalationCorrelation>,
    ) -> Self {
        Self {
            activity_store,
            correlation,
        }
    }
}

#[async_trait]
impl ActivityBehavior for EscalationThrowBehavior {
    fn activity_store(&self) -> &Arc<dyn ActivityStore> {
        &self.activity_store
    }

    /// Correlation decides whether the token continues, so the usual
    /// completion routing is not dispatched here
    async fn complete(
        &self,
        dispatcher: &Arc<Dispatcher>,
        activity: &ActivityExecution,
    ) -> Result<ActivityExecution, EngineError> {
        let completed = self.activity_store.complete(activity).await?;
        self.correlation.correlate(dispatcher, &completed).await?;
        Ok(completed)
    }
}

/// Behavior for intermediate catch events waiting on a trigger
pub struct CatchEventBehavior {
    activity_store: Arc<dyn ActivityStore>,
}

impl CatchEventBehavior {
    /// Create the behavior over the activity store
    pub fn new(activity_store: Arc<dyn ActivityStore>) -> Self {
        Self { activity_store }
    }
}

#[async_trait]
impl ActivityBehavior for CatchEventBehavior {
    fn activity_store(&self) -> &Arc<dyn ActivityStore> {
        &self.activity_store
    }

    /// Activate and wait; the trigger completes the execution
    async fn run(
        &self,
        _dispatcher: &Arc<Dispatcher>,
        activity: &ActivityExecution,
    ) -> Result<ActivityExecution, EngineError> {
        self.activity_store.run(activity).await
    }

    async fn trigger(
        &self,
        dispatcher: &Arc<Dispatcher>,
        process: &Process,
        definition: &ActivityDefinition,
        variables: HashMap<String, Value>,
    ) -> Result<(), EngineError> {
        let waiting = self
            .activity_store
            .find_active(&process.id, std::slice::from_ref(&definition.id))
            .await?;
        let Some(execution) = waiting.into_iter().next() else {
            tracing::debug!(
                process_id = %process.id,
                definition_id = %definition.id,
                "no waiting execution for trigger"
            );
            return Ok(());
        };

        dispatcher
            .dispatch(Command::CompleteActivity {
                activity_id: execution.id,
                variables,
            })
            .await
    }

    async fn complete(
        &self,
        dispatcher: &Arc<Dispatcher>,
        activity: &ActivityExecution,
    ) -> Result<ActivityExecution, EngineError> {
        let completed = self.activity_store.complete(activity).await?;
        cancel_event_gateway_siblings(&self.activity_store, dispatcher, &completed).await?;
        dispatcher
            .dispatch(Command::HandleActivityCompletion {
                activity: completed.clone(),
                with_next: true,
            })
            .await?;
        Ok(completed)
    }

    async fn terminate(
        &self,
        dispatcher: &Arc<Dispatcher>,
        activity: &ActivityExecution,
        _with_interruption: bool,
    ) -> Result<ActivityExecution, EngineError> {
        let terminated = self.activity_store.terminate(activity).await?;
        cancel_event_gateway_siblings(&self.activity_store, dispatcher, &terminated).await?;
        Ok(terminated)
    }
}
