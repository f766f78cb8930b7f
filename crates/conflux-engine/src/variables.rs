//! Scoped variable reads, merging writes, and expression-bearing input
//!
//! Variable records live at a definition-level scope. Reads fold the
//! activity's scope chain innermost-first, so an inner record shadows an
//! outer one with the same key. Writes update the record the key already
//! resolves to; keys unknown anywhere in scope become new records at the
//! process level (or the execution's own level for local writes).

use crate::dispatch::{Command, CommandHandler, CommandOutput, Dispatcher};
use conflux_core::model::{
    ActivityExecution, ActivityId, Process, ProcessId, Variable,
};
use conflux_core::persistence::{ActivityStore, ProcessStore, VariableStore};
use conflux_core::{EngineError, ExpressionEvaluator};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Runtime service for reading and writing scoped variables
pub struct VariableService {
    variable_store: Arc<dyn VariableStore>,
    process_store: Arc<dyn ProcessStore>,
    activity_store: Arc<dyn ActivityStore>,
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl VariableService {
    /// Create the service over its stores and the expression port
    pub fn new(
        variable_store: Arc<dyn VariableStore>,
        process_store: Arc<dyn ProcessStore>,
        activity_store: Arc<dyn ActivityStore>,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> Self {
        Self {
            variable_store,
            process_store,
            activity_store,
            evaluator,
        }
    }

    /// Variables visible to an activity, folded innermost-first
    pub async fn scoped_variables(
        &self,
        activity: &ActivityExecution,
    ) -> Result<HashMap<String, Value>, EngineError> {
        let scope = activity.scope();
        let records = self
            .variable_store
            .find_in_scope(&activity.process.id, &scope)
            .await?;
        fold_by_scope(&records, &scope)
    }

    /// Process-level variables as a flat map
    pub async fn process_variables(
        &self,
        process: &Process,
    ) -> Result<HashMap<String, Value>, EngineError> {
        let scope = vec![process.definition.id.0.clone()];
        let records = self
            .variable_store
            .find_in_scope(&process.id, &scope)
            .await?;
        fold_by_scope(&records, &scope)
    }

    /// Resolve expression-bearing input against the activity's scope
    ///
    /// Literal-only maps pass through untouched; the scope context is only
    /// fetched when at least one value is an expression string.
    pub async fn evaluate(
        &self,
        activity: &ActivityExecution,
        raw: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>, EngineError> {
        if raw.is_empty() || !self.has_expression(raw) {
            return Ok(raw.clone());
        }

        let context = self.scoped_variables(activity).await?;
        let mut resolved = HashMap::with_capacity(raw.len());
        for (key, value) in raw {
            let evaluated = match value {
                Value::String(text) if self.evaluator.is_expression(text) => {
                    self.evaluator.evaluate(text, &context)?
                }
                other => other.clone(),
            };
            resolved.insert(key.clone(), evaluated);
        }
        Ok(resolved)
    }

    /// Write variables through a process or activity execution id
    ///
    /// The id is resolved as a process first, then as an activity. Returns
    /// the affected process and the written records so the caller can
    /// re-trigger conditional correlation.
    pub async fn set_variables(
        &self,
        execution_id: &str,
        variables: HashMap<String, Value>,
        local: bool,
    ) -> Result<Option<(Process, Vec<Variable>)>, EngineError> {
        if variables.is_empty() {
            return Ok(None);
        }

        if let Some(process) = self
            .process_store
            .find_by_id(&ProcessId(execution_id.to_string()))
            .await?
        {
            return self
                .set_process_variables(&process, variables)
                .await
                .map(Some);
        }

        let activity = self
            .activity_store
            .find_by_id(&ActivityId(execution_id.to_string()))
            .await?
            .ok_or_else(|| EngineError::ActivityNotFound(execution_id.to_string()))?;
        self.set_activity_variables(&activity, variables, local)
            .await
            .map(Some)
    }

    /// Write variables at the process level
    pub async fn set_process_variables(
        &self,
        process: &Process,
        variables: HashMap<String, Value>,
    ) -> Result<(Process, Vec<Variable>), EngineError> {
        if variables.is_empty() {
            return Ok((process.clone(), Vec::new()));
        }

        let scope = vec![process.definition.id.0.clone()];
        let existing = self.variable_store.find_in_scope(&process.id, &scope).await?;
        let existing_by_key = first_by_key(&existing);

        let batch = merge(variables, &existing_by_key, |key, value| {
            Variable::of(
                process.id.clone(),
                process.id.0.clone(),
                process.definition.id.0.clone(),
                key,
                value,
            )
        });

        tracing::debug!(process_id = %process.id, count = batch.len(), "writing process variables");
        self.variable_store.upsert(batch.clone()).await?;
        Ok((process.clone(), batch))
    }

    /// Write variables through an activity execution
    ///
    /// Non-local writes update the record the key resolves to anywhere in
    /// the activity's scope and create unknown keys at the process level.
    /// Local writes only consider records written through this execution
    /// and create unknown keys at the activity's own level.
    pub async fn set_activity_variables(
        &self,
        activity: &ActivityExecution,
        variables: HashMap<String, Value>,
        local: bool,
    ) -> Result<(Process, Vec<Variable>), EngineError> {
        if variables.is_empty() {
            return Ok((activity.process.clone(), Vec::new()));
        }

        let process = &activity.process;
        let all = self.variable_store.find_by_process(&process.id).await?;
        let scope = activity.scope();
        let visible: Vec<&Variable> = all
            .iter()
            .filter(|record| {
                if local {
                    record.execution_id == activity.id.0
                } else {
                    scope.contains(&record.execution_definition_id)
                }
            })
            .collect();
        let existing_by_key = first_by_key_ref(&visible);

        let batch = merge(variables, &existing_by_key, |key, value| {
            if local {
                Variable::of(
                    process.id.clone(),
                    activity.id.0.clone(),
                    activity.definition_id.0.clone(),
                    key,
                    value,
                )
            } else {
                Variable::of(
                    process.id.clone(),
                    process.id.0.clone(),
                    process.definition.id.0.clone(),
                    key,
                    value,
                )
            }
        });

        tracing::debug!(
            activity_id = %activity.id,
            process_id = %process.id,
            count = batch.len(),
            local,
            "writing activity variables"
        );
        self.variable_store.upsert(batch.clone()).await?;
        Ok((process.clone(), batch))
    }

    fn has_expression(&self, variables: &HashMap<String, Value>) -> bool {
        variables.values().any(|value| match value {
            Value::String(text) => self.evaluator.is_expression(text),
            _ => false,
        })
    }
}

/// Handler for [`Command::SetVariables`]
///
/// Writes resolve through the variable service and re-trigger conditional
/// correlation for the affected process in the background.
pub struct SetVariablesHandler {
    variables: Arc<VariableService>,
}

impl SetVariablesHandler {
    /// Create the handler over the variable service
    pub fn new(variables: Arc<VariableService>) -> Self {
        Self { variables }
    }
}

#[async_trait]
impl CommandHandler for SetVariablesHandler {
    async fn handle(
        &self,
        command: Command,
        dispatcher: &Arc<Dispatcher>,
    ) -> Result<CommandOutput, EngineError> {
        let Command::SetVariables {
            execution_id,
            variables,
            local,
        } = command
        else {
            return Err(EngineError::Other(
                "variable write received a foreign command".to_string(),
            ));
        };

        if let Some((process, records)) = self
            .variables
            .set_variables(&execution_id, variables, local)
            .await?
        {
            dispatcher.dispatch_async(Command::CorrelateVariables {
                process,
                variables: records,
            });
        }
        Ok(CommandOutput::Unit)
    }
}

/// Fold records into a flat map walking the scope chain innermost-first
pub(crate) fn fold_by_scope(
    records: &[Variable],
    scope: &[String],
) -> Result<HashMap<String, Value>, EngineError> {
    let mut folded = HashMap::new();
    for level in scope {
        for record in records
            .iter()
            .filter(|r| &r.execution_definition_id == level)
        {
            if !folded.contains_key(&record.key) {
                folded.insert(record.key.clone(), record.typed_value()?);
            }
        }
    }
    Ok(folded)
}

fn first_by_key(records: &[Variable]) -> HashMap<&str, &Variable> {
    let mut by_key = HashMap::new();
    for record in records {
        by_key.entry(record.key.as_str()).or_insert(record);
    }
    by_key
}

fn first_by_key_ref<'a>(records: &[&'a Variable]) -> HashMap<&'a str, &'a Variable> {
    let mut by_key = HashMap::new();
    for record in records {
        by_key.entry(record.key.as_str()).or_insert(*record);
    }
    by_key
}

fn merge(
    variables: HashMap<String, Value>,
    existing_by_key: &HashMap<&str, &Variable>,
    create: impl Fn(&str, &Value) -> Variable,
) -> Vec<Variable> {
    let mut batch = Vec::with_capacity(variables.len());
    for (key, value) in &variables {
        match existing_by_key.get(key.as_str()) {
            Some(record) => {
                let mut updated = (*record).clone();
                updated.set_value(value);
                batch.push(updated);
            }
            None => batch.push(create(key, value)),
        }
    }
    batch
}
