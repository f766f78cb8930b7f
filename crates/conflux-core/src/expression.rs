//! Expression evaluation port and jmespath-backed default
//!
//! Expressions are wrapped in `${...}`; the body is a jmespath query
//! evaluated against a flat map of scoped variables.

use crate::EngineError;
use serde_json::Value;
use std::collections::HashMap;

/// Port for evaluating expressions against scoped variables
pub trait ExpressionEvaluator: Send + Sync {
    /// Whether the input is an expression rather than a literal
    fn is_expression(&self, input: &str) -> bool;

    /// Evaluate an expression against the given context
    fn evaluate(&self, expression: &str, context: &HashMap<String, Value>)
        -> Result<Value, EngineError>;

    /// Evaluate a condition; non-boolean results are an error
    fn evaluate_bool(
        &self,
        expression: &str,
        context: &HashMap<String, Value>,
    ) -> Result<bool, EngineError> {
        match self.evaluate(expression, context)? {
            Value::Bool(value) => Ok(value),
            other => Err(EngineError::Expression(format!(
                "condition did not evaluate to a boolean: {} -> {}",
                expression, other
            ))),
        }
    }
}

/// Default evaluator backed by jmespath
#[derive(Debug, Clone, Copy, Default)]
pub struct JmespathEvaluator;

impl JmespathEvaluator {
    /// Create a new evaluator
    pub fn new() -> Self {
        Self
    }

    fn strip_wrapper(input: &str) -> &str {
        let trimmed = input.trim();
        trimmed
            .strip_prefix("${")
            .and_then(|rest| rest.strip_suffix('}'))
            .map(str::trim)
            .unwrap_or(trimmed)
    }
}

impl ExpressionEvaluator for JmespathEvaluator {
    fn is_expression(&self, input: &str) -> bool {
        let trimmed = input.trim();
        trimmed.starts_with("${") && trimmed.ends_with('}')
    }

    fn evaluate(
        &self,
        expression: &str,
        context: &HashMap<String, Value>,
    ) -> Result<Value, EngineError> {
        let body = Self::strip_wrapper(expression);
        let compiled = jmespath::compile(body).map_err(|e| {
            EngineError::Expression(format!("failed to compile expression {}: {}", body, e))
        })?;

        let data = serde_json::to_value(context)?;
        let result = compiled.search(&data).map_err(|e| {
            EngineError::Expression(format!("failed to evaluate expression {}: {}", body, e))
        })?;

        serde_json::to_value(result).map_err(EngineError::from)
    }
}
