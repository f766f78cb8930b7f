use crate::model::process::ProcessId;
use crate::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Value object: variable record ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariableId(pub String);

impl std::fmt::Display for VariableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type tag of a string-encoded variable value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    /// JSON null
    Null,
    /// 32-bit integer
    Integer,
    /// 64-bit integer
    Long,
    /// Boolean
    Boolean,
    /// 64-bit float
    Double,
    /// 32-bit float
    Float,
    /// Plain string, stored unquoted
    String,
    /// JSON array
    List,
    /// JSON object
    Map,
}

/// One persisted variable record
///
/// Keys are unique per `execution_id`; scope-chain resolution takes the
/// innermost definition scope that defines a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    /// Unique identifier
    pub id: VariableId,

    /// Owning process instance
    pub process_id: ProcessId,

    /// Process or activity instance the variable was written through
    pub execution_id: String,

    /// Definition-level scope the variable lives at: an activity
    /// definition id or the process definition id
    pub execution_definition_id: String,

    /// Variable name
    pub key: String,

    /// String-encoded value
    pub value: String,

    /// Type tag of the encoded value
    pub value_type: VariableType,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Variable {
    /// Create a variable record from a JSON value
    pub fn of(
        process_id: ProcessId,
        execution_id: impl Into<String>,
        execution_definition_id: impl Into<String>,
        key: impl Into<String>,
        value: &Value,
    ) -> Self {
        let (encoded, value_type) = encode(value);
        let now = Utc::now();
        Self {
            id: VariableId(Uuid::new_v4().to_string()),
            process_id,
            execution_id: execution_id.into(),
            execution_definition_id: execution_definition_id.into(),
            key: key.into(),
            value: encoded,
            value_type,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the value, re-deriving the type tag
    pub fn set_value(&mut self, value: &Value) {
        let (encoded, value_type) = encode(value);
        self.value = encoded;
        self.value_type = value_type;
        self.updated_at = Utc::now();
    }

    /// Decode the stored value back into JSON
    pub fn typed_value(&self) -> Result<Value, EngineError> {
        match self.value_type {
            VariableType::Null => Ok(Value::Null),
            VariableType::String => Ok(Value::String(self.value.clone())),
            VariableType::Boolean => self
                .value
                .parse::<bool>()
                .map(Value::Bool)
                .map_err(|e| decode_error(&self.key, e)),
            VariableType::Integer | VariableType::Long => self
                .value
                .parse::<i64>()
                .map(|n| Value::Number(n.into()))
                .map_err(|e| decode_error(&self.key, e)),
            VariableType::Double | VariableType::Float => {
                let parsed = self
                    .value
                    .parse::<f64>()
                    .map_err(|e| decode_error(&self.key, e))?;
                serde_json::Number::from_f64(parsed)
                    .map(Value::Number)
                    .ok_or_else(|| {
                        EngineError::Serialization(format!(
                            "variable {} holds a non-finite number",
                            self.key
                        ))
                    })
            }
            VariableType::List | VariableType::Map => {
                serde_json::from_str(&self.value).map_err(EngineError::from)
            }
        }
    }
}

fn decode_error(key: &str, err: impl std::fmt::Display) -> EngineError {
    EngineError::Serialization(format!("cannot decode variable {}: {}", key, err))
}

fn encode(value: &Value) -> (String, VariableType) {
    match value {
        Value::Null => (String::new(), VariableType::Null),
        Value::Bool(b) => (b.to_string(), VariableType::Boolean),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                let value_type = if i32::try_from(i).is_ok() {
                    VariableType::Integer
                } else {
                    VariableType::Long
                };
                (i.to_string(), value_type)
            } else {
                (n.to_string(), VariableType::Double)
            }
        }
        Value::String(s) => (s.clone(), VariableType::String),
        Value::Array(_) => (value.to_string(), VariableType::List),
        Value::Object(_) => (value.to_string(), VariableType::Map),
    }
}
