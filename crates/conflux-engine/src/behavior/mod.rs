//! Per-type activity behaviors
//!
//! One behavior per activity type drives the run/complete/fail/terminate
//! life cycle against the stores and issues follow-up commands. The trait's
//! provided methods implement the plain pass-through life cycle; each
//! concrete behavior overrides only the steps its type diverges on.

pub mod boundary;
pub mod event;
pub mod gateway;
pub mod subprocess;
pub mod task;

pub use boundary::BoundaryEventBehavior;
pub use event::{
    CatchEventBehavior, ErrorEndEventBehavior, EscalationThrowBehavior, TerminateEndEventBehavior,
    TriggerableStartEventBehavior,
};
pub use gateway::{ExclusiveGatewayBehavior, InclusiveGatewayBehavior, ParallelGatewayBehavior};
pub use subprocess::{CallActivityBehavior, EventSubprocessBehavior, SubprocessBehavior};
pub use task::{PolledTaskBehavior, ReceiveTaskBehavior};

use crate::config::EngineConfig;
use crate::correlation::{ErrorCorrelation, EscalationCorrelation};
use crate::dispatch::{Command, Dispatcher};
use crate::variables::VariableService;
use async_trait::async_trait;
use conflux_core::model::{ActivityDefinition, ActivityExecution, ActivityType, Failure, Process};
use conflux_core::persistence::{ActivityStore, DefinitionStore, ProcessStore};
use conflux_core::{EngineError, ExpressionEvaluator};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Life cycle of one activity type
///
/// The provided methods implement the pass-through life cycle: `run`
/// persists the execution and immediately completes it, completion routes
/// along the outgoing edges. Wait states, gateways and scopes override the
/// steps they diverge on.
#[async_trait]
pub trait ActivityBehavior: Send + Sync {
    /// The store executions are persisted through
    fn activity_store(&self) -> &Arc<dyn ActivityStore>;

    /// Start an execution
    async fn run(
        &self,
        dispatcher: &Arc<Dispatcher>,
        activity: &ActivityExecution,
    ) -> Result<ActivityExecution, EngineError> {
        let active = self.activity_store().run(activity).await?;
        dispatcher
            .dispatch(Command::CompleteActivity {
                activity_id: active.id.clone(),
                variables: HashMap::new(),
            })
            .await?;
        Ok(active)
    }

    /// Finish an execution and route its continuation
    async fn complete(
        &self,
        dispatcher: &Arc<Dispatcher>,
        activity: &ActivityExecution,
    ) -> Result<ActivityExecution, EngineError> {
        let completed = self.activity_store().complete(activity).await?;
        dispatcher
            .dispatch(Command::HandleActivityCompletion {
                activity: completed.clone(),
                with_next: true,
            })
            .await?;
        Ok(completed)
    }

    /// Definitions the completion handler runs next
    async fn next_definitions(
        &self,
        activity: &ActivityExecution,
    ) -> Result<Vec<ActivityDefinition>, EngineError> {
        Ok(activity.next_definitions()?.into_iter().cloned().collect())
    }

    /// Record a failure; returns whether it surfaces as a process incident
    async fn fail(
        &self,
        _dispatcher: &Arc<Dispatcher>,
        activity: &ActivityExecution,
        failure: Failure,
    ) -> Result<bool, EngineError> {
        self.activity_store().fail(activity, failure).await?;
        Ok(true)
    }

    /// Force a terminal state
    async fn terminate(
        &self,
        _dispatcher: &Arc<Dispatcher>,
        activity: &ActivityExecution,
        _with_interruption: bool,
    ) -> Result<ActivityExecution, EngineError> {
        self.activity_store().terminate(activity).await
    }

    /// Put the execution back in the worker queue
    async fn retry(
        &self,
        _dispatcher: &Arc<Dispatcher>,
        activity: &ActivityExecution,
    ) -> Result<ActivityExecution, EngineError> {
        self.activity_store().retry(activity, None).await
    }

    /// React to an external trigger aimed at a definition node
    async fn trigger(
        &self,
        dispatcher: &Arc<Dispatcher>,
        process: &Process,
        definition: &ActivityDefinition,
        _variables: HashMap<String, Value>,
    ) -> Result<(), EngineError> {
        dispatcher
            .dispatch(Command::RunActivity {
                process: process.clone(),
                definition_id: definition.id.clone(),
            })
            .await
    }
}

/// Terminate racing candidates of a preceding event-based gateway
///
/// When an event downstream of an event-based gateway settles, the other
/// in-flight events the gateway armed lose the race and are terminated.
pub(crate) async fn cancel_event_gateway_siblings(
    store: &Arc<dyn ActivityStore>,
    dispatcher: &Arc<Dispatcher>,
    activity: &ActivityExecution,
) -> Result<(), EngineError> {
    let gateway = activity
        .previous_definitions()?
        .into_iter()
        .find(|definition| definition.activity_type() == ActivityType::EventBasedGateway);
    let Some(gateway) = gateway else {
        return Ok(());
    };

    let losers = store
        .find_active(&activity.process.id, &gateway.outgoing)
        .await?;
    for loser in losers {
        if loser.id == activity.id {
            continue;
        }
        tracing::debug!(
            gateway = %gateway.id,
            loser = %loser.id,
            "cancelling event gateway candidate"
        );
        dispatcher
            .dispatch(Command::TerminateActivity {
                activity_id: loser.id,
                with_interruption: false,
            })
            .await?;
    }
    Ok(())
}

/// Behavior for activities with no wait state or routing of their own
///
/// Covers plain start events, plain end events and the event-based
/// gateway, which all persist, complete and route along outgoing edges.
pub struct PassThroughBehavior {
    activity_store: Arc<dyn ActivityStore>,
}

impl PassThroughBehavior {
    /// Create the behavior over the activity store
    pub fn new(activity_store: Arc<dyn ActivityStore>) -> Self {
        Self { activity_store }
    }
}

#[async_trait]
impl ActivityBehavior for PassThroughBehavior {
    fn activity_store(&self) -> &Arc<dyn ActivityStore> {
        &self.activity_store
    }
}

/// Immutable map from activity type to its behavior
pub struct BehaviorRegistry {
    behaviors: HashMap<ActivityType, Arc<dyn ActivityBehavior>>,
}

impl BehaviorRegistry {
    /// Start building a registry
    pub fn builder() -> BehaviorRegistryBuilder {
        BehaviorRegistryBuilder {
            behaviors: HashMap::new(),
        }
    }

    /// The behavior registered for an activity type
    pub fn resolve(
        &self,
        activity_type: ActivityType,
    ) -> Result<Arc<dyn ActivityBehavior>, EngineError> {
        self.behaviors.get(&activity_type).cloned().ok_or_else(|| {
            EngineError::Configuration(format!(
                "no behavior registered for activity type {}",
                activity_type
            ))
        })
    }

    /// Registry covering every activity type, wired over the given ports
    pub fn standard(
        activity_store: Arc<dyn ActivityStore>,
        process_store: Arc<dyn ProcessStore>,
        definition_store: Arc<dyn DefinitionStore>,
        variables: Arc<VariableService>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        config: Arc<EngineConfig>,
    ) -> Self {
        let error_correlation = Arc::new(ErrorCorrelation::new(activity_store.clone()));
        let escalation_correlation = Arc::new(EscalationCorrelation::new(activity_store.clone()));

        let pass_through = Arc::new(PassThroughBehavior::new(activity_store.clone()));
        let polled = Arc::new(PolledTaskBehavior::new(activity_store.clone(), config));
        let catch = Arc::new(CatchEventBehavior::new(activity_store.clone()));
        let triggerable_start =
            Arc::new(TriggerableStartEventBehavior::new(activity_store.clone()));
        let boundary = Arc::new(BoundaryEventBehavior::new(activity_store.clone()));
        let escalation_throw = Arc::new(EscalationThrowBehavior::new(
            activity_store.clone(),
            escalation_correlation,
        ));

        Self::builder()
            .register(ActivityType::StartEvent, pass_through.clone())
            .register(ActivityType::EndEvent, pass_through.clone())
            .register(ActivityType::EventBasedGateway, pass_through)
            .register(ActivityType::ExternalTask, polled.clone())
            .register(ActivityType::SendTask, polled)
            .register(
                ActivityType::ReceiveTask,
                Arc::new(ReceiveTaskBehavior::new(activity_store.clone())),
            )
            .register(ActivityType::MessageCatchEvent, catch.clone())
            .register(ActivityType::ConditionalCatchEvent, catch)
            .register(ActivityType::MessageStartEvent, triggerable_start.clone())
            .register(ActivityType::ErrorStartEvent, triggerable_start.clone())
            .register(
                ActivityType::EscalationStartEvent,
                triggerable_start.clone(),
            )
            .register(ActivityType::ConditionalStartEvent, triggerable_start)
            .register(ActivityType::MessageBoundaryEvent, boundary.clone())
            .register(ActivityType::ErrorBoundaryEvent, boundary.clone())
            .register(ActivityType::EscalationBoundaryEvent, boundary)
            .register(
                ActivityType::ExclusiveGateway,
                Arc::new(ExclusiveGatewayBehavior::new(
                    activity_store.clone(),
                    variables.clone(),
                    evaluator.clone(),
                )),
            )
            .register(
                ActivityType::InclusiveGateway,
                Arc::new(InclusiveGatewayBehavior::new(
                    activity_store.clone(),
                    variables.clone(),
                    evaluator.clone(),
                )),
            )
            .register(
                ActivityType::ParallelGateway,
                Arc::new(ParallelGatewayBehavior::new(activity_store.clone())),
            )
            .register(
                ActivityType::ErrorEndEvent,
                Arc::new(ErrorEndEventBehavior::new(
                    activity_store.clone(),
                    error_correlation,
                )),
            )
            .register(ActivityType::EscalationEndEvent, escalation_throw.clone())
            .register(ActivityType::EscalationThrowEvent, escalation_throw)
            .register(
                ActivityType::TerminateEndEvent,
                Arc::new(TerminateEndEventBehavior::new(activity_store.clone())),
            )
            .register(
                ActivityType::Subprocess,
                Arc::new(SubprocessBehavior::new(activity_store.clone())),
            )
            .register(
                ActivityType::EventSubprocess,
                Arc::new(EventSubprocessBehavior::new(activity_store.clone())),
            )
            .register(
                ActivityType::CallActivity,
                Arc::new(CallActivityBehavior::new(
                    activity_store,
                    process_store,
                    definition_store,
                    variables,
                    evaluator,
                )),
            )
            .build()
    }
}

/// Builder collecting behavior registrations
pub struct BehaviorRegistryBuilder {
    behaviors: HashMap<ActivityType, Arc<dyn ActivityBehavior>>,
}

impl BehaviorRegistryBuilder {
    /// Register the behavior for an activity type, replacing any previous one
    pub fn register(
        mut self,
        activity_type: ActivityType,
        behavior: Arc<dyn ActivityBehavior>,
    ) -> Self {
        self.behaviors.insert(activity_type, behavior);
        self
    }

    /// Freeze the registry
    pub fn build(self) -> BehaviorRegistry {
        BehaviorRegistry {
            behaviors: self.behaviors,
        }
    }
}
