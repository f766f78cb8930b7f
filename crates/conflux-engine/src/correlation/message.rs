//! Message correlation
//!
//! A published message must land on exactly one active process: zero
//! candidates and more than one candidate are both reported back to the
//! sender as distinct failures. On a single match the carried variables
//! are merged at process scope before every subscribed definition is
//! triggered.

use crate::dispatch::{Command, CommandHandler, CommandOutput, Dispatcher};
use crate::variables::VariableService;
use conflux_core::model::Process;
use conflux_core::persistence::ProcessStore;
use conflux_core::EngineError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Handler for [`Command::CorrelateMessage`]
pub struct CorrelateMessageHandler {
    process_store: Arc<dyn ProcessStore>,
    variables: Arc<VariableService>,
}

impl CorrelateMessageHandler {
    /// Create the handler over the process store and the variable service
    pub fn new(process_store: Arc<dyn ProcessStore>, variables: Arc<VariableService>) -> Self {
        Self {
            process_store,
            variables,
        }
    }

    async fn correlate(
        &self,
        dispatcher: &Arc<Dispatcher>,
        message: String,
        business_key: Option<String>,
        correlation_keys: HashMap<String, Value>,
        variables: HashMap<String, Value>,
    ) -> Result<Process, EngineError> {
        if business_key.is_none() && correlation_keys.is_empty() {
            return Err(EngineError::Correlation(
                "message correlation needs a business key or correlation keys".to_string(),
            ));
        }

        let candidates = self
            .process_store
            .find_candidates(&message, business_key.as_deref())
            .await?;
        let mut matched = self.filter_by_keys(candidates, &correlation_keys).await?;

        if matched.is_empty() {
            return Err(EngineError::NoneCorrelated(message));
        }
        if matched.len() > 1 {
            return Err(EngineError::AmbiguousCorrelation {
                message,
                count: matched.len(),
            });
        }
        let process = matched.remove(0);
        tracing::debug!(message, process_id = %process.id, "correlated message");

        if !variables.is_empty() {
            dispatcher
                .dispatch(Command::SetVariables {
                    execution_id: process.id.0.clone(),
                    variables,
                    local: false,
                })
                .await?;
        }

        for definition in process
            .definition
            .activities
            .iter()
            .filter(|definition| definition.message_name() == Some(message.as_str()))
        {
            dispatcher.dispatch_async(Command::TriggerActivity {
                process: process.clone(),
                definition_id: definition.id.clone(),
                variables: HashMap::new(),
            });
        }

        Ok(process)
    }

    /// Keep candidates whose process-level variables carry every key
    async fn filter_by_keys(
        &self,
        candidates: Vec<Process>,
        correlation_keys: &HashMap<String, Value>,
    ) -> Result<Vec<Process>, EngineError> {
        if correlation_keys.is_empty() {
            return Ok(candidates);
        }

        let mut matched = Vec::new();
        for candidate in candidates {
            let visible = self.variables.process_variables(&candidate).await?;
            let all_match = correlation_keys
                .iter()
                .all(|(key, value)| visible.get(key) == Some(value));
            if all_match {
                matched.push(candidate);
            }
        }
        Ok(matched)
    }
}

#[async_trait]
impl CommandHandler for CorrelateMessageHandler {
    async fn handle(
        &self,
        command: Command,
        dispatcher: &Arc<Dispatcher>,
    ) -> Result<CommandOutput, EngineError> {
        let Command::CorrelateMessage {
            message,
            business_key,
            correlation_keys,
            variables,
        } = command
        else {
            return Err(EngineError::Other(
                "message correlation received a foreign command".to_string(),
            ));
        };

        self.correlate(dispatcher, message, business_key, correlation_keys, variables)
            .await
            .map(CommandOutput::Process)
    }
}
