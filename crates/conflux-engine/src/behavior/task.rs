//! Task behaviors
//!
//! Polled tasks sit in the worker queue until an external worker reports
//! back; receive tasks wait for a matching message. Both are wait states,
//! so `run` never completes the execution on its own.

use crate::behavior::{cancel_event_gateway_siblings, ActivityBehavior};
use crate::config::EngineConfig;
use crate::dispatch::{Command, Dispatcher};
use conflux_core::model::{ActivityDefinition, ActivityExecution, Failure, Process};
use conflux_core::persistence::ActivityStore;
use conflux_core::EngineError;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Behavior for external and send tasks picked up by polling workers
pub struct PolledTaskBehavior {
    activity_store: Arc<dyn ActivityStore>,
    config: Arc<EngineConfig>,
}

impl PolledTaskBehavior {
    /// Create the behavior over the activity store and engine defaults
    pub fn new(activity_store: Arc<dyn ActivityStore>, config: Arc<EngineConfig>) -> Self {
        Self {
            activity_store,
            config,
        }
    }
}

#[async_trait]
impl ActivityBehavior for PolledTaskBehavior {
    fn activity_store(&self) -> &Arc<dyn ActivityStore> {
        &self.activity_store
    }

    /// Queue the execution for workers with its poll deadline
    async fn run(
        &self,
        _dispatcher: &Arc<Dispatcher>,
        activity: &ActivityExecution,
    ) -> Result<ActivityExecution, EngineError> {
        let timeout = self.config.task_timeout(activity.definition()?.timeout_secs());
        let mut scheduled = activity.clone();
        scheduled.timeout = Some(Utc::now() + timeout);
        self.activity_store.schedule(&scheduled).await
    }

    /// Consume one retry before surfacing the failure as an incident
    async fn fail(
        &self,
        dispatcher: &Arc<Dispatcher>,
        activity: &ActivityExecution,
        failure: Failure,
    ) -> Result<bool, EngineError> {
        let budget = self.config.task_retries(activity.definition()?.retries());
        if activity.retries < budget {
            tracing::debug!(
                activity_id = %activity.id,
                attempt = activity.retries + 1,
                budget,
                "retrying failed task"
            );
            dispatcher.dispatch_async(Command::RetryActivity {
                activity_id: activity.id.clone(),
            });
            return Ok(false);
        }

        self.activity_store.fail(activity, failure).await?;
        Ok(true)
    }

    /// Requeue with a fresh poll deadline
    async fn retry(
        &self,
        _dispatcher: &Arc<Dispatcher>,
        activity: &ActivityExecution,
    ) -> Result<ActivityExecution, EngineError> {
        let timeout = self.config.task_timeout(activity.definition()?.timeout_secs());
        self.activity_store
            .retry(activity, Some(Utc::now() + timeout))
            .await
    }
}

/// Behavior for receive tasks waiting on a message
pub struct ReceiveTaskBehavior {
    activity_store: Arc<dyn ActivityStore>,
}

impl ReceiveTaskBehavior {
    /// Create the behavior over the activity store
    pub fn new(activity_store: Arc<dyn ActivityStore>) -> Self {
        Self { activity_store }
    }
}

#[async_trait]
impl ActivityBehavior for ReceiveTaskBehavior {
    fn activity_store(&self) -> &Arc<dyn ActivityStore> {
        &self.activity_store
    }

    /// Activate and wait; the message trigger completes the execution
    async fn run(
        &self,
        _dispatcher: &Arc<Dispatcher>,
        activity: &ActivityExecution,
    ) -> Result<ActivityExecution, EngineError> {
        self.activity_store.run(activity).await
    }

    /// A correlated message completes the waiting execution
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
