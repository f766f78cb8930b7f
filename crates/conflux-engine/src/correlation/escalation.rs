//! Escalation correlation
//!
//! Escalations are soft signals: a raised code that nobody handles simply
//! lets the raising event complete and continue normally. An interrupting
//! handler (a cancelling boundary event or an interrupting event-subprocess
//! start) replaces the raising event's continuation; a non-interrupting one
//! runs detached while the raising event completes normally.

use crate::correlation::{resolve, SignalKind};
use crate::dispatch::{Command, Dispatcher};
use conflux_core::model::{ActivityDefinition, ActivityExecution, ActivityId, Process};
use conflux_core::persistence::ActivityStore;
use conflux_core::EngineError;
use std::collections::HashMap;
use std::sync::Arc;

/// Routes raised escalation codes to the closest matching handler
pub struct EscalationCorrelation {
    activity_store: Arc<dyn ActivityStore>,
}

impl EscalationCorrelation {
    /// Create the service over the activity store
    pub fn new(activity_store: Arc<dyn ActivityStore>) -> Self {
        Self { activity_store }
    }

    /// Correlate the escalation raised by `event`
    pub async fn correlate(
        &self,
        dispatcher: &Arc<Dispatcher>,
        event: &ActivityExecution,
    ) -> Result<(), EngineError> {
        let code = event
            .definition()?
            .escalation_code()
            .map(str::to_string)
            .ok_or_else(|| {
                EngineError::Correlation(format!(
                    "activity {} raised an escalation without an escalation code",
                    event.definition_id
                ))
            })?;

        let Some((handler, process)) = self.resolve_handler(&code, event).await? else {
            tracing::debug!(process_id = %event.process.id, code, "unhandled escalation");
            return dispatcher
                .dispatch(Command::HandleActivityCompletion {
                    activity: event.clone(),
                    with_next: true,
                })
                .await;
        };

        let interrupting = if handler.is_boundary_event() {
            handler.cancel_activity()
        } else {
            handler.interrupting()
        };

        if interrupting {
            // The handler replaces the raising event's continuation
            dispatcher
                .dispatch(Command::TriggerActivity {
                    process,
                    definition_id: handler.id,
                    variables: HashMap::new(),
                })
                .await
        } else {
            dispatcher.dispatch_async(Command::TriggerActivity {
                process,
                definition_id: handler.id,
                variables: HashMap::new(),
            });
            dispatcher
                .dispatch(Command::HandleActivityCompletion {
                    activity: event.clone(),
                    with_next: true,
                })
                .await
        }
    }

    /// Search the raising event's scope chain, hopping to the parent
    /// process while the current one was spawned by a call activity
    async fn resolve_handler(
        &self,
        code: &str,
        event: &ActivityExecution,
    ) -> Result<Option<(ActivityDefinition, Process)>, EngineError> {
        let mut current = event.clone();
        loop {
            for level in current.scope() {
                if let Some(handler) = resolve(SignalKind::Escalation, code, &level, &current.process)
                {
                    return Ok(Some((handler.clone(), current.process.clone())));
                }
            }

            if !current.process.is_call_activity() {
                return Ok(None);
            }

            let call_id = ActivityId(current.process.id.0.clone());
            current = self
                .activity_store
                .find_by_id(&call_id)
                .await?
                .ok_or_else(|| EngineError::ActivityNotFound(call_id.0.clone()))?;
        }
    }
}
