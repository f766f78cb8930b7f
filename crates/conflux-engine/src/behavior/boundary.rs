//! Boundary event behavior
//!
//! A boundary event fires against a live execution of its host activity.
//! Message and error boundaries require the host to be active; an
//! escalation boundary also fires while the host is still queued. A
//! cancelling boundary interrupts the host before the event's own token
//! continues.

use crate::behavior::ActivityBehavior;
use crate::dispatch::{Command, Dispatcher};
use conflux_core::model::{ActivityExecution, ActivityState, ActivityType};
use conflux_core::persistence::ActivityStore;
use conflux_core::EngineError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Behavior shared by message, error and escalation boundary events
pub struct BoundaryEventBehavior {
    activity_store: Arc<dyn ActivityStore>,
}

impl BoundaryEventBehavior {
    /// Create the behavior over the activity store
    pub fn new(activity_store: Arc<dyn ActivityStore>) -> Self {
        Self { activity_store }
    }
}

#[async_trait]
impl ActivityBehavior for BoundaryEventBehavior {
    fn activity_store(&self) -> &Arc<dyn ActivityStore> {
        &self.activity_store
    }

    /// Fire against the live host execution, cancelling it first when the
    /// boundary is a cancelling one; without a live host the event is
    /// dropped unpersisted
    async fn run(
        &self,
        dispatcher: &Arc<Dispatcher>,
        activity: &ActivityExecution,
    ) -> Result<ActivityExecution, EngineError> {
        let definition = activity.definition()?;
        let host_id = definition
            .attached_to()
            .cloned()
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "boundary event {} has no host",
                    activity.definition_id
                ))
            })?;
        let cancelling = definition.cancel_activity();
        let requires_active = matches!(
            definition.activity_type(),
            ActivityType::MessageBoundaryEvent | ActivityType::ErrorBoundaryEvent
        );

        let host = self
            .activity_store
            .find_by_definition_id(&activity.process.id, &host_id)
            .await?
            .into_iter()
            .find(|execution| !execution.is_terminal());
        let Some(host) = host else {
            tracing::debug!(
                boundary = %activity.definition_id,
                host = %host_id,
                "boundary event without a live host dropped"
            );
            return Ok(activity.clone());
        };
        if requires_active && host.state != ActivityState::Active {
            tracing::debug!(
                boundary = %activity.definition_id,
                host = %host.id,
                "boundary event skipped, host not active"
            );
            return Ok(activity.clone());
        }

        let active = self.activity_store.run(activity).await?;

        if cancelling {
            dispatcher
                .dispatch(Command::TerminateActivity {
                    activity_id: host.id,
                    with_interruption: true,
                })
                .await?;
        }
        dispatcher
            .dispatch(Command::CompleteActivity {
                activity_id: active.id.clone(),
                variables: HashMap::new(),
            })
            .await?;
        Ok(active)
    }
}
