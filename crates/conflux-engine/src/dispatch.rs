//! Command dispatch core
//!
//! Every state change travels as a `Command` through the `Dispatcher`.
//! Each command kind has exactly one handler and the registry is immutable
//! once built. Handlers receive the dispatcher back so they can issue
//! follow-up commands, synchronously on the continuation path and detached
//! for fire-and-forget work.

use async_trait::async_trait;
use conflux_core::model::{
    ActivityDefinitionId, ActivityExecution, ActivityId, Failure, Process, ProcessId, Variable,
};
use conflux_core::EngineError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Closed set of state-changing commands understood by the engine
#[derive(Debug, Clone)]
pub enum Command {
    /// Start a process instance and run its start activity
    RunProcess {
        /// Instance to start
        process: Process,
    },
    /// Finish a process instance normally
    CompleteProcess {
        /// Instance to complete
        process_id: ProcessId,
    },
    /// Force a process instance into a terminal state
    TerminateProcess {
        /// Instance to terminate
        process_id: ProcessId,
        /// Also terminate the call activity execution that spawned it
        terminate_call_activity: bool,
    },
    /// Flag a process instance as needing operator attention
    IncidentProcess {
        /// Instance to flag
        process_id: ProcessId,
    },
    /// Return an incident process to normal execution
    ResolveIncident {
        /// Instance to resolve
        process_id: ProcessId,
    },
    /// Run an activity definition node within a process
    RunActivity {
        /// Owning process snapshot
        process: Process,
        /// Definition node to instantiate
        definition_id: ActivityDefinitionId,
    },
    /// Trigger an event activity with payload variables
    TriggerActivity {
        /// Owning process snapshot
        process: Process,
        /// Definition node to trigger
        definition_id: ActivityDefinitionId,
        /// Payload handed to the triggered activity
        variables: HashMap<String, Value>,
    },
    /// Finish an activity execution normally
    CompleteActivity {
        /// Execution to complete
        activity_id: ActivityId,
        /// Output variables written to the execution scope
        variables: HashMap<String, Value>,
    },
    /// Report a worker failure on an activity execution
    FailActivity {
        /// Execution that failed
        activity_id: ActivityId,
        /// What went wrong
        failure: Failure,
    },
    /// Force an activity execution into a terminal state
    TerminateActivity {
        /// Execution to terminate
        activity_id: ActivityId,
        /// Whether nested executions are terminated as well
        with_interruption: bool,
    },
    /// Put a failed or active execution back in the worker queue
    RetryActivity {
        /// Execution to retry
        activity_id: ActivityId,
    },
    /// Re-queue every failed execution of a process
    RetryAllActivities {
        /// Process whose failed executions are retried
        process_id: ProcessId,
    },
    /// Route a completed execution to its continuation
    HandleActivityCompletion {
        /// Execution that just completed
        activity: ActivityExecution,
        /// Whether definitions on outgoing edges are run
        with_next: bool,
    },
    /// Deliver a message to the matching subscribed process
    CorrelateMessage {
        /// Message name
        message: String,
        /// Narrow candidates to one business key
        business_key: Option<String>,
        /// Narrow candidates by variable equality
        correlation_keys: HashMap<String, Value>,
        /// Variables merged into the matched process before triggering
        variables: HashMap<String, Value>,
    },
    /// Evaluate conditional events against freshly written variables
    CorrelateVariables {
        /// Process the variables were written in
        process: Process,
        /// Records written by the triggering update
        variables: Vec<Variable>,
    },
    /// Write variables through a process or activity execution
    SetVariables {
        /// Process or activity instance id the write goes through
        execution_id: String,
        /// Variables to write
        variables: HashMap<String, Value>,
        /// Write into the execution's own scope instead of resolving
        local: bool,
    },
}

/// Discriminant of a [`Command`], used as the handler registry key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// See [`Command::RunProcess`]
    RunProcess,
    /// See [`Command::CompleteProcess`]
    CompleteProcess,
    /// See [`Command::TerminateProcess`]
    TerminateProcess,
    /// See [`Command::IncidentProcess`]
    IncidentProcess,
    /// See [`Command::ResolveIncident`]
    ResolveIncident,
    /// See [`Command::RunActivity`]
    RunActivity,
    /// See [`Command::TriggerActivity`]
    TriggerActivity,
    /// See [`Command::CompleteActivity`]
    CompleteActivity,
    /// See [`Command::FailActivity`]
    FailActivity,
    /// See [`Command::TerminateActivity`]
    TerminateActivity,
    /// See [`Command::RetryActivity`]
    RetryActivity,
    /// See [`Command::RetryAllActivities`]
    RetryAllActivities,
    /// See [`Command::HandleActivityCompletion`]
    HandleActivityCompletion,
    /// See [`Command::CorrelateMessage`]
    CorrelateMessage,
    /// See [`Command::CorrelateVariables`]
    CorrelateVariables,
    /// See [`Command::SetVariables`]
    SetVariables,
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Command {
    /// The discriminant this command is routed by
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::RunProcess { .. } => CommandKind::RunProcess,
            Command::CompleteProcess { .. } => CommandKind::CompleteProcess,
            Command::TerminateProcess { .. } => CommandKind::TerminateProcess,
            Command::IncidentProcess { .. } => CommandKind::IncidentProcess,
            Command::ResolveIncident { .. } => CommandKind::ResolveIncident,
            Command::RunActivity { .. } => CommandKind::RunActivity,
            Command::TriggerActivity { .. } => CommandKind::TriggerActivity,
            Command::CompleteActivity { .. } => CommandKind::CompleteActivity,
            Command::FailActivity { .. } => CommandKind::FailActivity,
            Command::TerminateActivity { .. } => CommandKind::TerminateActivity,
            Command::RetryActivity { .. } => CommandKind::RetryActivity,
            Command::RetryAllActivities { .. } => CommandKind::RetryAllActivities,
            Command::HandleActivityCompletion { .. } => CommandKind::HandleActivityCompletion,
            Command::CorrelateMessage { .. } => CommandKind::CorrelateMessage,
            Command::CorrelateVariables { .. } => CommandKind::CorrelateVariables,
            Command::SetVariables { .. } => CommandKind::SetVariables,
        }
    }
}

/// Value produced by executing a command
#[derive(Debug, Clone)]
pub enum CommandOutput {
    /// The command produced no value
    Unit,
    /// The command produced a process instance
    Process(Process),
    /// The command produced process instances
    Processes(Vec<Process>),
    /// The command produced an activity execution
    Activity(ActivityExecution),
}

impl CommandOutput {
    /// Unwrap a process output
    pub fn into_process(self) -> Result<Process, EngineError> {
        match self {
            CommandOutput::Process(process) => Ok(process),
            other => Err(EngineError::Other(format!(
                "expected a process output, got {:?}",
                other
            ))),
        }
    }

    /// Unwrap a process list output
    pub fn into_processes(self) -> Result<Vec<Process>, EngineError> {
        match self {
            CommandOutput::Processes(processes) => Ok(processes),
            other => Err(EngineError::Other(format!(
                "expected a process list output, got {:?}",
                other
            ))),
        }
    }

    /// Unwrap an activity execution output
    pub fn into_activity(self) -> Result<ActivityExecution, EngineError> {
        match self {
            CommandOutput::Activity(activity) => Ok(activity),
            other => Err(EngineError::Other(format!(
                "expected an activity output, got {:?}",
                other
            ))),
        }
    }
}

/// Handler for one command kind
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Execute the command, issuing follow-up commands through `dispatcher`
    async fn handle(
        &self,
        command: Command,
        dispatcher: &Arc<Dispatcher>,
    ) -> Result<CommandOutput, EngineError>;
}

/// Routes commands to their registered handlers
pub struct Dispatcher {
    handlers: HashMap<CommandKind, Arc<dyn CommandHandler>>,
}

impl Dispatcher {
    /// Start building a dispatcher
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder {
            handlers: HashMap::new(),
        }
    }

    /// Execute a command and return its output
    pub async fn execute(self: &Arc<Self>, command: Command) -> Result<CommandOutput, EngineError> {
        let kind = command.kind();
        let handler = self
            .handlers
            .get(&kind)
            .ok_or_else(|| EngineError::HandlerNotFound(kind.to_string()))?;

        tracing::debug!(command = %kind, "executing command");
        handler
            .handle(command, self)
            .await
            .map_err(|source| EngineError::Dispatch {
                command: kind.to_string(),
                source: Box::new(source),
            })
    }

    /// Execute a command, discarding its output
    pub async fn dispatch(self: &Arc<Self>, command: Command) -> Result<(), EngineError> {
        self.execute(command).await.map(|_| ())
    }

    /// Execute a command on a detached task
    ///
    /// Failures are logged and swallowed; the caller's own outcome never
    /// depends on a detached command.
    pub fn dispatch_async(self: &Arc<Self>, command: Command) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let kind = command.kind();
            if let Err(error) = dispatcher.dispatch(command).await {
                tracing::warn!(command = %kind, %error, "detached command failed");
            }
        });
    }
}

/// Builder collecting handler registrations
pub struct DispatcherBuilder {
    handlers: HashMap<CommandKind, Arc<dyn CommandHandler>>,
}

impl DispatcherBuilder {
    /// Register the handler for a command kind, replacing any previous one
    pub fn register(mut self, kind: CommandKind, handler: Arc<dyn CommandHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Freeze the registry
    pub fn build(self) -> Arc<Dispatcher> {
        Arc::new(Dispatcher {
            handlers: self.handlers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conflux_core::model::{
        ActivityDefinition, ActivityPayload, ProcessDefinition, ProcessDefinitionId,
    };
    use std::sync::Mutex;
    use tokio::sync::Notify;

    fn create_process() -> Process {
        let definition = ProcessDefinition {
            id: ProcessDefinitionId("proc:1".to_string()),
            key: "proc".to_string(),
            version: 1,
            activities: vec![ActivityDefinition {
                id: ActivityDefinitionId("start".to_string()),
                name: "start".to_string(),
                parent_id: None,
                incoming: Vec::new(),
                outgoing: Vec::new(),
                payload: ActivityPayload::StartEvent,
            }],
            messages: Vec::new(),
            errors: Vec::new(),
            metadata: HashMap::new(),
        };
        Process::new(definition, None, HashMap::new())
    }

    struct RecordingHandler {
        seen: Mutex<Vec<CommandKind>>,
        output: CommandOutput,
        notify: Arc<Notify>,
    }

    impl RecordingHandler {
        fn new(output: CommandOutput) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                output,
                notify: Arc::new(Notify::new()),
            })
        }
    }

    #[async_trait]
    impl CommandHandler for RecordingHandler {
        async fn handle(
            &self,
            command: Command,
            _dispatcher: &Arc<Dispatcher>,
        ) -> Result<CommandOutput, EngineError> {
            self.seen.lock().unwrap().push(command.kind());
            self.notify.notify_one();
            Ok(self.output.clone())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl CommandHandler for FailingHandler {
        async fn handle(
            &self,
            _command: Command,
            _dispatcher: &Arc<Dispatcher>,
        ) -> Result<CommandOutput, EngineError> {
            Err(EngineError::ProcessNotFound("ghost".to_string()))
        }
    }

    struct ChainingHandler;

    #[async_trait]
    impl CommandHandler for ChainingHandler {
        async fn handle(
            &self,
            command: Command,
            dispatcher: &Arc<Dispatcher>,
        ) -> Result<CommandOutput, EngineError> {
            if let Command::RunProcess { process } = command {
                dispatcher
                    .dispatch(Command::CompleteProcess {
                        process_id: process.id,
                    })
                    .await?;
            }
            Ok(CommandOutput::Unit)
        }
    }

    #[tokio::test]
    async fn test_execute_routes_to_registered_handler() {
        let process = create_process();
        let handler = RecordingHandler::new(CommandOutput::Process(process.clone()));
        let dispatcher = Dispatcher::builder()
            .register(CommandKind::RunProcess, handler.clone())
            .build();

        let output = dispatcher
            .execute(Command::RunProcess {
                process: process.clone(),
            })
            .await
            .unwrap();

        assert_eq!(output.into_process().unwrap().id, process.id);
        assert_eq!(
            *handler.seen.lock().unwrap(),
            vec![CommandKind::RunProcess]
        );
    }

    #[tokio::test]
    async fn test_unregistered_kind_is_reported() {
        let dispatcher = Dispatcher::builder().build();

        match dispatcher
            .dispatch(Command::CompleteProcess {
                process_id: ProcessId::from("p1"),
            })
            .await
        {
            Err(EngineError::HandlerNotFound(kind)) => assert_eq!(kind, "CompleteProcess"),
            other => panic!("Expected handler-not-found error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_error_is_wrapped() {
        let dispatcher = Dispatcher::builder()
            .register(CommandKind::IncidentProcess, Arc::new(FailingHandler))
            .build();

        match dispatcher
            .dispatch(Command::IncidentProcess {
                process_id: ProcessId::from("ghost"),
            })
            .await
        {
            Err(EngineError::Dispatch { command, source }) => {
                assert_eq!(command, "IncidentProcess");
                assert_eq!(*source, EngineError::ProcessNotFound("ghost".to_string()));
            }
            other => panic!("Expected dispatch error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handlers_can_dispatch_follow_up_commands() {
        let recorder = RecordingHandler::new(CommandOutput::Unit);
        let dispatcher = Dispatcher::builder()
            .register(CommandKind::RunProcess, Arc::new(ChainingHandler))
            .register(CommandKind::CompleteProcess, recorder.clone())
            .build();

        dispatcher
            .dispatch(Command::RunProcess {
                process: create_process(),
            })
            .await
            .unwrap();

        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![CommandKind::CompleteProcess]
        );
    }

    #[tokio::test]
    async fn test_dispatch_async_runs_detached() {
        let recorder = RecordingHandler::new(CommandOutput::Unit);
        let dispatcher = Dispatcher::builder()
            .register(CommandKind::CompleteProcess, recorder.clone())
            .build();

        dispatcher.dispatch_async(Command::CompleteProcess {
            process_id: ProcessId::from("p1"),
        });

        recorder.notify.notified().await;
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![CommandKind::CompleteProcess]
        );
    }

    #[test]
    fn test_kind_display_matches_variant_name() {
        assert_eq!(CommandKind::RunActivity.to_string(), "RunActivity");
        assert_eq!(
            CommandKind::HandleActivityCompletion.to_string(),
            "HandleActivityCompletion"
        );
    }
}
