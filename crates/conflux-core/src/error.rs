use thiserror::Error;

/// Engine error type shared by every Conflux crate
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Activity instance not found
    #[error("Activity not found: {0}")]
    ActivityNotFound(String),

    /// Process instance not found
    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    /// Process definition not found
    #[error("Process definition not found: {0}")]
    DefinitionNotFound(String),

    /// Activity definition not found within a process definition
    #[error("Activity definition not found: {0}")]
    ActivityDefinitionNotFound(String),

    /// No handler registered for a command kind
    #[error("No handler registered for command: {0}")]
    HandlerNotFound(String),

    /// Illegal state transition on a process or activity instance
    #[error("Illegal transition for {instance}: {from} -> {to}")]
    Transition {
        /// Instance the transition was attempted on
        instance: String,
        /// State the instance is currently in
        from: String,
        /// State the transition targeted
        to: String,
    },

    /// Gateway could not pick an outgoing path
    #[error("Gateway error at {activity}: {message}")]
    Gateway {
        /// Gateway activity definition id
        activity: String,
        /// What went wrong
        message: String,
    },

    /// Message correlation matched no process
    #[error("No processes correlated for message: {0}")]
    NoneCorrelated(String),

    /// Message correlation matched more than one process
    #[error("Ambiguous correlation for message {message}: {count} processes matched")]
    AmbiguousCorrelation {
        /// Message name the correlation was attempted for
        message: String,
        /// How many processes matched
        count: usize,
    },

    /// Correlation input was unusable
    #[error("Correlation error: {0}")]
    Correlation(String),

    /// Dispatching a command failed
    #[error("Dispatch of {command} failed: {source}")]
    Dispatch {
        /// Command kind that was dispatched
        command: String,
        /// Underlying failure
        source: Box<EngineError>,
    },

    /// Expression evaluation error
    #[error("Expression evaluation error: {0}")]
    Expression(String),

    /// Definition validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// State store error
    #[error("State store error: {0}")]
    Store(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Input/output error
    #[error("Input/output error: {0}")]
    Io(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Build a transition error from displayable states
    pub fn transition(
        instance: impl Into<String>,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        EngineError::Transition {
            instance: instance.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

impl From<String> for EngineError {
    fn from(err: String) -> Self {
        EngineError::Other(err)
    }
}

impl From<&str> for EngineError {
    fn from(err: &str) -> Self {
        EngineError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_error_display() {
        let errors = vec![
            (
                EngineError::ActivityNotFound("act1".to_string()),
                "Activity not found: act1",
            ),
            (
                EngineError::ProcessNotFound("proc1".to_string()),
                "Process not found: proc1",
            ),
            (
                EngineError::DefinitionNotFound("def1".to_string()),
                "Process definition not found: def1",
            ),
            (
                EngineError::ActivityDefinitionNotFound("task1".to_string()),
                "Activity definition not found: task1",
            ),
            (
                EngineError::HandlerNotFound("RunProcess".to_string()),
                "No handler registered for command: RunProcess",
            ),
            (
                EngineError::transition("act1", "COMPLETED", "ACTIVE"),
                "Illegal transition for act1: COMPLETED -> ACTIVE",
            ),
            (
                EngineError::Gateway {
                    activity: "gw1".to_string(),
                    message: "no valid path".to_string(),
                },
                "Gateway error at gw1: no valid path",
            ),
            (
                EngineError::NoneCorrelated("order_placed".to_string()),
                "No processes correlated for message: order_placed",
            ),
            (
                EngineError::AmbiguousCorrelation {
                    message: "order_placed".to_string(),
                    count: 2,
                },
                "Ambiguous correlation for message order_placed: 2 processes matched",
            ),
            (
                EngineError::Expression("bad syntax".to_string()),
                "Expression evaluation error: bad syntax",
            ),
            (
                EngineError::Validation("duplicate id".to_string()),
                "Validation error: duplicate id",
            ),
            (
                EngineError::Store("db_err".to_string()),
                "State store error: db_err",
            ),
            (
                EngineError::Serialization("ser_err".to_string()),
                "Serialization error: ser_err",
            ),
            (
                EngineError::Io("io_err".to_string()),
                "Input/output error: io_err",
            ),
            (
                EngineError::Configuration("config_err".to_string()),
                "Configuration error: config_err",
            ),
            (EngineError::Other("other_err".to_string()), "other_err"),
        ];

        for (error, expected_msg) in errors {
            assert_eq!(error.to_string(), expected_msg);
        }
    }

    #[test]
    fn test_dispatch_error_preserves_cause() {
        let cause = EngineError::ActivityNotFound("act1".to_string());
        let error = EngineError::Dispatch {
            command: "CompleteActivity".to_string(),
            source: Box::new(cause.clone()),
        };

        assert_eq!(
            error.to_string(),
            "Dispatch of CompleteActivity failed: Activity not found: act1"
        );
        match error {
            EngineError::Dispatch { source, .. } => assert_eq!(*source, cause),
            _ => panic!("Expected Dispatch variant"),
        }
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let error: EngineError = json_error.into();

        match error {
            EngineError::Serialization(msg) => {
                assert!(msg.contains("expected value"));
            }
            _ => panic!("Expected Serialization variant"),
        }
    }

    #[test]
    fn test_from_io_error() {
        let io_error = IoError::new(ErrorKind::NotFound, "file not found");
        let error: EngineError = io_error.into();

        match error {
            EngineError::Io(msg) => {
                assert!(msg.contains("file not found"));
            }
            _ => panic!("Expected Io variant"),
        }
    }

    #[test]
    fn test_from_string() {
        let error: EngineError = "test error message".to_string().into();

        match error {
            EngineError::Other(msg) => {
                assert_eq!(msg, "test error message");
            }
            _ => panic!("Expected Other variant"),
        }
    }

    #[test]
    fn test_error_clone_and_eq() {
        let original = EngineError::Validation("test".to_string());
        let cloned = original.clone();

        assert_eq!(original, cloned);
        assert_eq!(format!("{:?}", original), format!("{:?}", cloned));
    }
}
