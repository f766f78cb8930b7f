//! Error correlation
//!
//! An error raised by an error end event searches its scope chain for a
//! handler. Every subprocess level the error escapes on the way out is
//! terminated. When the chain is exhausted inside a spawned process the
//! search continues through the hosting call activity: a boundary handler
//! cancels the host itself when it fires, an event-subprocess handler has
//! the host cancelled before it starts, and a level with no handler has
//! its call activity cancelled before the search moves up. The root moves
//! to incident if nobody catches.

use crate::correlation::{resolve, SignalKind};
use crate::dispatch::{Command, Dispatcher};
use conflux_core::model::{
    ActivityDefinition, ActivityDefinitionId, ActivityExecution, ActivityId, ActivityType, Process,
    ProcessId,
};
use conflux_core::persistence::ActivityStore;
use conflux_core::EngineError;
use std::collections::HashMap;
use std::sync::Arc;

/// Routes raised error codes to the closest matching handler
pub struct ErrorCorrelation {
    activity_store: Arc<dyn ActivityStore>,
}

impl ErrorCorrelation {
    /// Create the service over the activity store
    pub fn new(activity_store: Arc<dyn ActivityStore>) -> Self {
        Self { activity_store }
    }

    /// Correlate the error raised by `source`
    ///
    /// The matched handler is triggered on a detached task. An error that
    /// no scope in any ancestor process handles raises an incident on the
    /// root process.
    pub async fn correlate(
        &self,
        dispatcher: &Arc<Dispatcher>,
        source: &ActivityExecution,
    ) -> Result<(), EngineError> {
        let code = source
            .definition()?
            .error_code()
            .map(str::to_string)
            .ok_or_else(|| {
                EngineError::Correlation(format!(
                    "activity {} raised an error without an error code",
                    source.definition_id
                ))
            })?;

        if let Some(handler) = self.correlate_within(dispatcher, &code, source).await? {
            self.trigger_handler(dispatcher, handler, &source.process);
            return Ok(());
        }

        let mut current = source.process.clone();
        loop {
            if !current.is_call_activity() {
                tracing::warn!(process_id = %current.id, code, "unhandled error");
                dispatcher.dispatch_async(Command::IncidentProcess {
                    process_id: current.id.clone(),
                });
                return Ok(());
            }

            let call_activity = self.call_activity(&current.id).await?;
            match self
                .correlate_within(dispatcher, &code, &call_activity)
                .await?
            {
                Some(handler) => {
                    // An event-subprocess handler replaces the spawned scope,
                    // so the hosting call activity is cancelled up front; a
                    // boundary handler cancels its host when it fires
                    if handler.is_start_event() {
                        dispatcher
                            .dispatch(Command::TerminateActivity {
                                activity_id: ActivityId(current.id.0.clone()),
                                with_interruption: true,
                            })
                            .await?;
                    }
                    self.trigger_handler(dispatcher, handler, &call_activity.process);
                    return Ok(());
                }
                None => {
                    // The error escapes this process through its hosting
                    // call activity
                    dispatcher
                        .dispatch(Command::TerminateActivity {
                            activity_id: ActivityId(current.id.0.clone()),
                            with_interruption: true,
                        })
                        .await?;
                    current = call_activity.process;
                }
            }
        }
    }

    fn trigger_handler(
        &self,
        dispatcher: &Arc<Dispatcher>,
        handler: ActivityDefinition,
        process: &Process,
    ) {
        dispatcher.dispatch_async(Command::TriggerActivity {
            process: process.clone(),
            definition_id: handler.id,
            variables: HashMap::new(),
        });
    }

    /// Walk the scope chain of one execution, terminating escaped levels
    async fn correlate_within(
        &self,
        dispatcher: &Arc<Dispatcher>,
        code: &str,
        source: &ActivityExecution,
    ) -> Result<Option<ActivityDefinition>, EngineError> {
        let process = &source.process;
        for level in source.scope() {
            if let Some(handler) = resolve(SignalKind::Error, code, &level, process) {
                tracing::debug!(
                    process_id = %process.id,
                    handler = %handler.id,
                    code,
                    "correlated error"
                );
                return Ok(Some(handler.clone()));
            }

            if level == process.definition.id.0 {
                continue;
            }

            let definition_id = ActivityDefinitionId(level.clone());
            let definition = process
                .definition
                .activity_by_id(&definition_id)
                .ok_or_else(|| EngineError::ActivityDefinitionNotFound(level.clone()))?;
            if matches!(
                definition.activity_type(),
                ActivityType::Subprocess | ActivityType::EventSubprocess
            ) {
                self.terminate_level(dispatcher, process, &definition_id)
                    .await?;
            }
        }
        Ok(None)
    }

    /// Terminate live executions of a subprocess level the error escaped
    async fn terminate_level(
        &self,
        dispatcher: &Arc<Dispatcher>,
        process: &Process,
        definition_id: &ActivityDefinitionId,
    ) -> Result<(), EngineError> {
        let executions = self
            .activity_store
            .find_active(&process.id, std::slice::from_ref(definition_id))
            .await?;
        for execution in executions {
            dispatcher
                .dispatch(Command::TerminateActivity {
                    activity_id: execution.id,
                    with_interruption: true,
                })
                .await?;
        }
        Ok(())
    }

    /// The call activity execution sharing its id with a spawned process
    async fn call_activity(
        &self,
        process_id: &ProcessId,
    ) -> Result<ActivityExecution, EngineError> {
        self.activity_store
            .find_by_id(&ActivityId(process_id.0.clone()))
            .await?
            .ok_or_else(|| EngineError::ActivityNotFound(process_id.0.clone()))
    }
}
