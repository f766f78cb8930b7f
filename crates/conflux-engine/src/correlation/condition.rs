//! Conditional event correlation
//!
//! Every variable write re-examines the conditional events of the owning
//! process: a condition is evaluated against the freshly written records
//! visible from the event's scope and, when it holds, the event is
//! triggered on a detached task.

use crate::dispatch::{Command, CommandHandler, CommandOutput, Dispatcher};
use crate::variables::fold_by_scope;
use conflux_core::model::{Process, Variable};
use conflux_core::{EngineError, ExpressionEvaluator};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Handler for [`Command::CorrelateVariables`]
pub struct CorrelateVariablesHandler {
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl CorrelateVariablesHandler {
    /// Create the handler over the expression port
    pub fn new(evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        Self { evaluator }
    }

    fn correlate(
        &self,
        dispatcher: &Arc<Dispatcher>,
        process: &Process,
        variables: &[Variable],
    ) -> Result<(), EngineError> {
        for definition in &process.definition.activities {
            let Some(condition) = definition.condition() else {
                continue;
            };

            let scope = process.definition.scope(&definition.id);
            let written: Vec<Variable> = variables
                .iter()
                .filter(|record| scope.contains(&record.execution_definition_id))
                .cloned()
                .collect();
            let context = fold_by_scope(&written, &scope)?;

            // A condition over variables that are not written yet is not met
            let met = match self.evaluator.evaluate_bool(condition, &context) {
                Ok(value) => value,
                Err(error) => {
                    tracing::trace!(definition_id = %definition.id, %error, "condition skipped");
                    false
                }
            };

            if met {
                tracing::debug!(
                    process_id = %process.id,
                    definition_id = %definition.id,
                    "condition met by variable write"
                );
                dispatcher.dispatch_async(Command::TriggerActivity {
                    process: process.clone(),
                    definition_id: definition.id.clone(),
                    variables: HashMap::new(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CommandHandler for CorrelateVariablesHandler {
    async fn handle(
        &self,
        command: Command,
        dispatcher: &Arc<Dispatcher>,
    ) -> Result<CommandOutput, EngineError> {
        let Command::CorrelateVariables { process, variables } = command else {
            return Err(EngineError::Other(
                "variable correlation received a foreign command".to_string(),
            ));
        };

        if variables.is_empty() {
            return Ok(CommandOutput::Unit);
        }

        self.correlate(dispatcher, &process, &variables)?;
        Ok(CommandOutput::Unit)
    }
}
