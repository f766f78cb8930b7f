//! Scope and correlation resolution
//!
//! A raised signal (an error code or an escalation code) searches for its
//! handler along the raising activity's scope chain, innermost level first.
//! Within one level a boundary event attached to the level outranks an
//! event-subprocess start event, and an exact-code handler always outranks
//! a code-less catch-all, even across those two variants. When the level
//! under search is the process definition itself, any start event of the
//! signal category anywhere in the process qualifies.

use conflux_core::model::{ActivityDefinition, ActivityType, Process};

pub mod condition;
pub mod error;
pub mod escalation;
pub mod message;

pub use condition::CorrelateVariablesHandler;
pub use error::ErrorCorrelation;
pub use escalation::EscalationCorrelation;
pub use message::CorrelateMessageHandler;

/// Signal category a handler search is parameterized by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Error codes raised by error end events
    Error,
    /// Escalation codes raised by escalation end and throw events
    Escalation,
}

impl SignalKind {
    fn boundary_type(self) -> ActivityType {
        match self {
            SignalKind::Error => ActivityType::ErrorBoundaryEvent,
            SignalKind::Escalation => ActivityType::EscalationBoundaryEvent,
        }
    }

    fn start_type(self) -> ActivityType {
        match self {
            SignalKind::Error => ActivityType::ErrorStartEvent,
            SignalKind::Escalation => ActivityType::EscalationStartEvent,
        }
    }

    fn code_of(self, definition: &ActivityDefinition) -> Option<&str> {
        match self {
            SignalKind::Error => definition.error_code(),
            SignalKind::Escalation => definition.escalation_code(),
        }
    }
}

/// Find the handler for `code` at one scope level of a process
///
/// Returns `None` when the level has no handler; the caller walks the
/// scope chain outward and re-invokes with the next level.
pub fn resolve<'a>(
    kind: SignalKind,
    code: &str,
    scope_level: &str,
    process: &'a Process,
) -> Option<&'a ActivityDefinition> {
    if scope_level == process.definition.id.0 {
        process_level_handler(kind, code, process)
    } else {
        scoped_handler(kind, code, scope_level, process)
    }
}

fn process_level_handler<'a>(
    kind: SignalKind,
    code: &str,
    process: &'a Process,
) -> Option<&'a ActivityDefinition> {
    start_event(kind, Some(code), process).or_else(|| start_event(kind, None, process))
}

fn scoped_handler<'a>(
    kind: SignalKind,
    code: &str,
    scope_level: &str,
    process: &'a Process,
) -> Option<&'a ActivityDefinition> {
    boundary_event(kind, Some(code), scope_level, process)
        .or_else(|| scoped_start_event(kind, Some(code), scope_level, process))
        .or_else(|| boundary_event(kind, None, scope_level, process))
        .or_else(|| scoped_start_event(kind, None, scope_level, process))
}

fn start_event<'a>(
    kind: SignalKind,
    code: Option<&str>,
    process: &'a Process,
) -> Option<&'a ActivityDefinition> {
    process
        .definition
        .activities
        .iter()
        .filter(|definition| definition.activity_type() == kind.start_type())
        .find(|definition| kind.code_of(definition) == code)
}

fn boundary_event<'a>(
    kind: SignalKind,
    code: Option<&str>,
    scope_level: &str,
    process: &'a Process,
) -> Option<&'a ActivityDefinition> {
    process
        .definition
        .activities
        .iter()
        .filter(|definition| definition.activity_type() == kind.boundary_type())
        .filter(|definition| {
            definition.attached_to().map(|id| id.0.as_str()) == Some(scope_level)
        })
        .find(|definition| kind.code_of(definition) == code)
}

/// Start events of event subprocesses that sit directly inside the level
fn scoped_start_event<'a>(
    kind: SignalKind,
    code: Option<&str>,
    scope_level: &str,
    process: &'a Process,
) -> Option<&'a ActivityDefinition> {
    process
        .definition
        .activities
        .iter()
        .filter(|definition| definition.activity_type() == kind.start_type())
        .filter(|definition| {
            definition
                .parent_id
                .as_ref()
                .and_then(|subprocess_id| process.definition.activity_by_id(subprocess_id))
                .and_then(|subprocess| subprocess.parent_id.as_ref())
                .map(|parent| parent.0.as_str())
                == Some(scope_level)
        })
        .find(|definition| kind.code_of(definition) == code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conflux_core::model::{
        ActivityDefinitionId, ActivityPayload, ProcessDefinition, ProcessDefinitionId,
    };
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn create_activity(
        id: &str,
        parent: Option<&str>,
        payload: ActivityPayload,
    ) -> ActivityDefinition {
        ActivityDefinition {
            id: ActivityDefinitionId(id.to_string()),
            name: id.to_string(),
            parent_id: parent.map(ActivityDefinitionId::from),
            incoming: Vec::new(),
            outgoing: Vec::new(),
            payload,
        }
    }

    fn create_process(activities: Vec<ActivityDefinition>) -> Process {
        let definition = ProcessDefinition {
            id: ProcessDefinitionId("order:1".to_string()),
            key: "order".to_string(),
            version: 1,
            activities,
            messages: Vec::new(),
            errors: Vec::new(),
            metadata: HashMap::new(),
        };
        Process::new(definition, None, HashMap::new())
    }

    #[test]
    fn test_exact_boundary_event_wins_over_catch_all() {
        let process = create_process(vec![
            create_activity("task", None, ActivityPayload::ExternalTask {
                topic: "work".to_string(),
                retries: None,
                timeout: None,
            }),
            create_activity("catch_all", None, ActivityPayload::ErrorBoundaryEvent {
                error_code: None,
                attached_to: ActivityDefinitionId::from("task"),
                cancel_activity: true,
            }),
            create_activity("catch_payment", None, ActivityPayload::ErrorBoundaryEvent {
                error_code: Some("payment_failed".to_string()),
                attached_to: ActivityDefinitionId::from("task"),
                cancel_activity: true,
            }),
        ]);

        let handler = resolve(SignalKind::Error, "payment_failed", "task", &process).unwrap();
        assert_eq!(handler.id.0, "catch_payment");

        let fallback = resolve(SignalKind::Error, "something_else", "task", &process).unwrap();
        assert_eq!(fallback.id.0, "catch_all");
    }

    #[test]
    fn test_exact_start_event_wins_over_catch_all_boundary() {
        let process = create_process(vec![
            create_activity("sub", None, ActivityPayload::Subprocess),
            create_activity("catch_all", None, ActivityPayload::ErrorBoundaryEvent {
                error_code: None,
                attached_to: ActivityDefinitionId::from("sub"),
                cancel_activity: true,
            }),
            create_activity("esp", Some("sub"), ActivityPayload::EventSubprocess),
            create_activity("esp_start", Some("esp"), ActivityPayload::ErrorStartEvent {
                error_code: Some("payment_failed".to_string()),
                interrupting: true,
            }),
        ]);

        let handler = resolve(SignalKind::Error, "payment_failed", "sub", &process).unwrap();
        assert_eq!(handler.id.0, "esp_start");
    }

    #[test]
    fn test_boundary_event_wins_over_start_event_at_same_tier() {
        let process = create_process(vec![
            create_activity("sub", None, ActivityPayload::Subprocess),
            create_activity("boundary", None, ActivityPayload::EscalationBoundaryEvent {
                escalation_code: Some("overdue".to_string()),
                attached_to: ActivityDefinitionId::from("sub"),
                cancel_activity: false,
            }),
            create_activity("esp", Some("sub"), ActivityPayload::EventSubprocess),
            create_activity("esp_start", Some("esp"), ActivityPayload::EscalationStartEvent {
                escalation_code: Some("overdue".to_string()),
                interrupting: false,
            }),
        ]);

        let handler = resolve(SignalKind::Escalation, "overdue", "sub", &process).unwrap();
        assert_eq!(handler.id.0, "boundary");
    }

    #[test]
    fn test_process_level_scope_finds_start_events_anywhere() {
        let process = create_process(vec![
            create_activity("esp", None, ActivityPayload::EventSubprocess),
            create_activity("esp_start", Some("esp"), ActivityPayload::ErrorStartEvent {
                error_code: Some("payment_failed".to_string()),
                interrupting: true,
            }),
        ]);

        let handler = resolve(SignalKind::Error, "payment_failed", "order:1", &process).unwrap();
        assert_eq!(handler.id.0, "esp_start");
    }

    #[test]
    fn test_unmatched_scope_level_yields_none() {
        let process = create_process(vec![create_activity(
            "task",
            None,
            ActivityPayload::ExternalTask {
                topic: "work".to_string(),
                retries: None,
                timeout: None,
            },
        )]);

        assert!(resolve(SignalKind::Error, "payment_failed", "task", &process).is_none());
        assert!(resolve(SignalKind::Escalation, "overdue", "order:1", &process).is_none());
    }

    #[test]
    fn test_signal_kinds_do_not_cross_match() {
        let process = create_process(vec![
            create_activity("task", None, ActivityPayload::ExternalTask {
                topic: "work".to_string(),
                retries: None,
                timeout: None,
            }),
            create_activity("boundary", None, ActivityPayload::ErrorBoundaryEvent {
                error_code: Some("overdue".to_string()),
                attached_to: ActivityDefinitionId::from("task"),
                cancel_activity: true,
            }),
        ]);

        assert!(resolve(SignalKind::Escalation, "overdue", "task", &process).is_none());
    }
}
