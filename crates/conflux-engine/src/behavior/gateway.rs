//! Gateway behaviors
//!
//! Gateways shape the token flow: exclusive picks one outgoing path,
//! inclusive activates every matching path, parallel forks and joins.
//! The event-based gateway has no routing of its own and uses the
//! pass-through behavior; its race is settled by the armed events.

use crate::behavior::ActivityBehavior;
use crate::dispatch::{Command, Dispatcher};
use crate::variables::VariableService;
use conflux_core::model::{ActivityDefinition, ActivityExecution, ActivityPayload, ConditionedPath};
use conflux_core::persistence::ActivityStore;
use conflux_core::{EngineError, ExpressionEvaluator};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

fn gateway_error(activity: &ActivityExecution, message: impl Into<String>) -> EngineError {
    EngineError::Gateway {
        activity: activity.definition_id.0.clone(),
        message: message.into(),
    }
}

/// Split the conditioned paths into evaluated matches and defaults
fn matching_paths<'a>(
    paths: &'a [ConditionedPath],
    context: &HashMap<String, Value>,
    evaluator: &Arc<dyn ExpressionEvaluator>,
) -> Result<(Vec<&'a ConditionedPath>, Vec<&'a ConditionedPath>), EngineError> {
    let mut matched = Vec::new();
    let mut defaults = Vec::new();
    for path in paths {
        match &path.condition {
            None => defaults.push(path),
            Some(condition) => {
                if evaluator.evaluate_bool(condition, context)? {
                    matched.push(path);
                }
            }
        }
    }
    Ok((matched, defaults))
}

fn resolve_targets(
    activity: &ActivityExecution,
    targets: Vec<&ConditionedPath>,
) -> Result<Vec<ActivityDefinition>, EngineError> {
    targets
        .into_iter()
        .map(|path| {
            activity
                .process
                .definition
                .activity_by_id(&path.target)
                .cloned()
                .ok_or_else(|| EngineError::ActivityDefinitionNotFound(path.target.0.clone()))
        })
        .collect()
}

/// Behavior routing a token along exactly one conditioned path
pub struct ExclusiveGatewayBehavior {
    activity_store: Arc<dyn ActivityStore>,
    variables: Arc<VariableService>,
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl ExclusiveGatewayBehavior {
    /// Create the behavior over the stores and the expression port
    pub fn new(
        activity_store: Arc<dyn ActivityStore>,
        variables: Arc<VariableService>,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> Self {
        Self {
            activity_store,
            variables,
            evaluator,
        }
    }
}

#[async_trait]
impl ActivityBehavior for ExclusiveGatewayBehavior {
    fn activity_store(&self) -> &Arc<dyn ActivityStore> {
        &self.activity_store
    }

    async fn next_definitions(
        &self,
        activity: &ActivityExecution,
    ) -> Result<Vec<ActivityDefinition>, EngineError> {
        let definition = activity.definition()?;
        let ActivityPayload::ExclusiveGateway { paths } = &definition.payload else {
            return Err(gateway_error(activity, "activity is not an exclusive gateway"));
        };

        let context = self.variables.scoped_variables(activity).await?;
        let (matched, defaults) = matching_paths(paths, &context, &self.evaluator)?;
        let targets = if matched.is_empty() { defaults } else { matched };

        match targets.len() {
            0 => Err(gateway_error(
                activity,
                "no valid path out of the exclusive gateway",
            )),
            1 => resolve_targets(activity, targets),
            count => Err(gateway_error(
                activity,
                format!("{count} paths matched where exactly one is allowed"),
            )),
        }
    }
}

/// Behavior activating every conditioned path that matches
pub struct InclusiveGatewayBehavior {
    activity_store: Arc<dyn ActivityStore>,
    variables: Arc<VariableService>,
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl InclusiveGatewayBehavior {
    /// Create the behavior over the stores and the expression port
    pub fn new(
        activity_store: Arc<dyn ActivityStore>,
        variables: Arc<VariableService>,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> Self {
        Self {
            activity_store,
            variables,
            evaluator,
        }
    }
}

#[async_trait]
impl ActivityBehavior for InclusiveGatewayBehavior {
    fn activity_store(&self) -> &Arc<dyn ActivityStore> {
        &self.activity_store
    }

    async fn next_definitions(
        &self,
        activity: &ActivityExecution,
    ) -> Result<Vec<ActivityDefinition>, EngineError> {
        let definition = activity.definition()?;
        let ActivityPayload::InclusiveGateway { paths } = &definition.payload else {
            return Err(gateway_error(activity, "activity is not an inclusive gateway"));
        };

        let context = self.variables.scoped_variables(activity).await?;
        let (matched, defaults) = matching_paths(paths, &context, &self.evaluator)?;
        let targets = if matched.is_empty() { defaults } else { matched };

        if targets.is_empty() {
            return Err(gateway_error(
                activity,
                "no valid path out of the inclusive gateway",
            ));
        }
        resolve_targets(activity, targets)
    }
}

/// Behavior forking on multiple outgoing edges and joining incoming tokens
pub struct ParallelGatewayBehavior {
    activity_store: Arc<dyn ActivityStore>,
}

impl ParallelGatewayBehavior {
    /// Create the behavior over the activity store
    pub fn new(activity_store: Arc<dyn ActivityStore>) -> Self {
        Self { activity_store }
    }
}

#[async_trait]
impl ActivityBehavior for ParallelGatewayBehavior {
    fn activity_store(&self) -> &Arc<dyn ActivityStore> {
        &self.activity_store
    }

    /// A join waits until a token arrived on every incoming edge; the
    /// arrival that satisfies the join folds the earlier sibling tokens
    /// so only one completion fans out downstream
    async fn run(
        &self,
        dispatcher: &Arc<Dispatcher>,
        activity: &ActivityExecution,
    ) -> Result<ActivityExecution, EngineError> {
        let active = self.activity_store.run(activity).await?;
        let definition = active.definition()?;

        if definition.incoming.len() > 1 {
            let arrived = self
                .activity_store
                .count_by_definition_id(&active.process.id, &active.definition_id)
                .await?;
            if arrived < definition.incoming.len() {
                tracing::debug!(
                    gateway = %active.definition_id,
                    arrived,
                    expected = definition.incoming.len(),
                    "parallel join waiting"
                );
                return Ok(active);
            }

            let siblings = self
                .activity_store
                .find_active(
                    &active.process.id,
                    std::slice::from_ref(&active.definition_id),
                )
                .await?;
            for sibling in siblings {
                if sibling.id != active.id {
                    self.activity_store.complete(&sibling).await?;
                }
            }
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
