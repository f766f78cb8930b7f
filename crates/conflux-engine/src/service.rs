//! Produced API facades and standard engine wiring
//!
//! `Engine::new` assembles the variable service, the behavior registry and a
//! dispatcher with every command kind registered, then exposes the two
//! facades embedders talk to: `RuntimeService` for process-level operations
//! and `ActivityService` for worker-facing activity operations. Facades
//! dispatch synchronously and surface the result; detached continuations
//! still happen inside the handlers.

use crate::activity::{
    CompleteActivityHandler, FailActivityHandler, HandleActivityCompletionHandler,
    RetryActivityHandler, RetryAllActivitiesHandler, RunActivityHandler, TerminateActivityHandler,
    TriggerActivityHandler,
};
use crate::behavior::BehaviorRegistry;
use crate::config::EngineConfig;
use crate::correlation::{CorrelateMessageHandler, CorrelateVariablesHandler};
use crate::dispatch::{Command, CommandKind, Dispatcher};
use crate::process::{
    CompleteProcessHandler, IncidentProcessHandler, ResolveIncidentHandler, RunProcessHandler,
    TerminateProcessHandler,
};
use crate::variables::{SetVariablesHandler, VariableService};
use conflux_core::model::{
    ActivityDefinitionId, ActivityExecution, ActivityId, Failure, Process, ProcessDefinitionId,
    ProcessFilter, ProcessId,
};
use conflux_core::persistence::{ActivityStore, DefinitionStore, ProcessStore, VariableStore};
use conflux_core::{EngineError, ExpressionEvaluator};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Fully wired engine: dispatcher, services and the behavior registry
pub struct Engine {
    /// Dispatcher with every command kind registered
    pub dispatcher: Arc<Dispatcher>,
    /// Process-level operations
    pub runtime: Arc<RuntimeService>,
    /// Worker-facing activity operations
    pub activities: Arc<ActivityService>,
    /// Scoped variable reads and writes
    pub variables: Arc<VariableService>,
}

impl Engine {
    /// Wire the standard engine over the given stores
    pub fn new(
        process_store: Arc<dyn ProcessStore>,
        activity_store: Arc<dyn ActivityStore>,
        definition_store: Arc<dyn DefinitionStore>,
        variable_store: Arc<dyn VariableStore>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        config: Arc<EngineConfig>,
    ) -> Self {
        let variables = Arc::new(VariableService::new(
            variable_store,
            process_store.clone(),
            activity_store.clone(),
            evaluator.clone(),
        ));
        let registry = Arc::new(BehaviorRegistry::standard(
            activity_store.clone(),
            process_store.clone(),
            definition_store.clone(),
            variables.clone(),
            evaluator.clone(),
            config,
        ));

        let dispatcher = Dispatcher::builder()
            .register(
                CommandKind::RunProcess,
                Arc::new(RunProcessHandler::new(
                    process_store.clone(),
                    variables.clone(),
                )),
            )
            .register(
                CommandKind::CompleteProcess,
                Arc::new(CompleteProcessHandler::new(process_store.clone())),
            )
            .register(
                CommandKind::TerminateProcess,
                Arc::new(TerminateProcessHandler::new(
                    process_store.clone(),
                    activity_store.clone(),
                )),
            )
            .register(
                CommandKind::IncidentProcess,
                Arc::new(IncidentProcessHandler::new(process_store.clone())),
            )
            .register(
                CommandKind::ResolveIncident,
                Arc::new(ResolveIncidentHandler::new(process_store.clone())),
            )
            .register(
                CommandKind::RunActivity,
                Arc::new(RunActivityHandler::new(
                    process_store.clone(),
                    registry.clone(),
                )),
            )
            .register(
                CommandKind::TriggerActivity,
                Arc::new(TriggerActivityHandler::new(registry.clone())),
            )
            .register(
                CommandKind::CompleteActivity,
                Arc::new(CompleteActivityHandler::new(
                    activity_store.clone(),
                    registry.clone(),
                    variables.clone(),
                )),
            )
            .register(
                CommandKind::FailActivity,
                Arc::new(FailActivityHandler::new(
                    activity_store.clone(),
                    registry.clone(),
                )),
            )
            .register(
                CommandKind::TerminateActivity,
                Arc::new(TerminateActivityHandler::new(
                    activity_store.clone(),
                    registry.clone(),
                )),
            )
            .register(
                CommandKind::RetryActivity,
                Arc::new(RetryActivityHandler::new(
                    activity_store.clone(),
                    registry.clone(),
                )),
            )
            .register(
                CommandKind::RetryAllActivities,
                Arc::new(RetryAllActivitiesHandler::new(
                    activity_store.clone(),
                    registry.clone(),
                )),
            )
            .register(
                CommandKind::HandleActivityCompletion,
                Arc::new(HandleActivityCompletionHandler::new(
                    activity_store.clone(),
                    registry.clone(),
                )),
            )
            .register(
                CommandKind::CorrelateMessage,
                Arc::new(CorrelateMessageHandler::new(
                    process_store.clone(),
                    variables.clone(),
                )),
            )
            .register(
                CommandKind::CorrelateVariables,
                Arc::new(CorrelateVariablesHandler::new(evaluator)),
            )
            .register(
                CommandKind::SetVariables,
                Arc::new(SetVariablesHandler::new(variables.clone())),
            )
            .build();

        let runtime = Arc::new(RuntimeService {
            dispatcher: dispatcher.clone(),
            process_store: process_store.clone(),
            definition_store,
        });
        let activities = Arc::new(ActivityService {
            dispatcher: dispatcher.clone(),
            process_store,
            activity_store,
        });

        Self {
            dispatcher,
            runtime,
            activities,
            variables,
        }
    }
}

/// Process-level operations of the produced API
pub struct RuntimeService {
    dispatcher: Arc<Dispatcher>,
    process_store: Arc<dyn ProcessStore>,
    definition_store: Arc<dyn DefinitionStore>,
}

impl RuntimeService {
    /// Start a process instance of a specific definition version
    pub async fn start_by_id(
        &self,
        definition_id: &ProcessDefinitionId,
        business_key: Option<String>,
        variables: HashMap<String, Value>,
    ) -> Result<Process, EngineError> {
        tracing::debug!(definition_id = %definition_id, "starting process by definition id");
        let definition = self
            .definition_store
            .find_by_id(definition_id)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(definition_id.0.clone()))?;
        self.start(Process::new(definition, business_key, variables))
            .await
    }

    /// Start a process instance of the latest version of a definition key
    pub async fn start_by_key(
        &self,
        key: &str,
        business_key: Option<String>,
        variables: HashMap<String, Value>,
    ) -> Result<Process, EngineError> {
        tracing::debug!(definition_key = key, "starting process by definition key");
        let definition = self
            .definition_store
            .find_latest_by_key(key)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(key.to_string()))?;
        self.start(Process::new(definition, business_key, variables))
            .await
    }

    async fn start(&self, process: Process) -> Result<Process, EngineError> {
        self.dispatcher
            .execute(Command::RunProcess { process })
            .await?
            .into_process()
    }

    /// Force a process instance into a terminal state
    ///
    /// Terminating a spawned child also terminates the call activity
    /// execution that spawned it.
    pub async fn terminate(&self, process_id: &ProcessId) -> Result<(), EngineError> {
        tracing::debug!(process_id = %process_id, "terminating process");
        self.dispatcher
            .dispatch(Command::TerminateProcess {
                process_id: process_id.clone(),
                terminate_call_activity: true,
            })
            .await
    }

    /// Re-queue every failed execution of an incident process
    pub async fn resolve_incident(&self, process_id: &ProcessId) -> Result<(), EngineError> {
        tracing::debug!(process_id = %process_id, "resolving incident");
        self.dispatcher
            .dispatch(Command::RetryAllActivities {
                process_id: process_id.clone(),
            })
            .await
    }

    /// Pause a process instance
    pub async fn suspend(&self, process_id: &ProcessId) -> Result<Process, EngineError> {
        tracing::debug!(process_id = %process_id, "suspending process");
        self.process_store.suspend(process_id).await
    }

    /// Resume a paused process instance
    pub async fn resume(&self, process_id: &ProcessId) -> Result<Process, EngineError> {
        tracing::debug!(process_id = %process_id, "resuming process");
        self.process_store.resume(process_id).await
    }

    /// Look up a process instance by id
    pub async fn find_by_id(&self, process_id: &ProcessId) -> Result<Option<Process>, EngineError> {
        self.process_store.find_by_id(process_id).await
    }

    /// Find process instances matching a filter
    pub async fn find_by_filter(
        &self,
        filter: &ProcessFilter,
    ) -> Result<Vec<Process>, EngineError> {
        self.process_store.find_by_filter(filter).await
    }

    /// Write variables through a process or activity execution scope
    pub async fn set_variables(
        &self,
        execution_id: &str,
        variables: HashMap<String, Value>,
    ) -> Result<(), EngineError> {
        self.write_variables(execution_id, variables, false).await
    }

    /// Write variables into an execution's own scope level
    pub async fn set_variables_local(
        &self,
        execution_id: &str,
        variables: HashMap<String, Value>,
    ) -> Result<(), EngineError> {
        self.write_variables(execution_id, variables, true).await
    }

    async fn write_variables(
        &self,
        execution_id: &str,
        variables: HashMap<String, Value>,
        local: bool,
    ) -> Result<(), EngineError> {
        tracing::debug!(execution_id, local, "setting variables");
        self.dispatcher
            .dispatch(Command::SetVariables {
                execution_id: execution_id.to_string(),
                variables,
                local,
            })
            .await
    }

    /// Deliver a message to the single matching subscribed process
    pub async fn correlate_message(
        &self,
        message: &str,
        business_key: Option<String>,
        correlation_keys: HashMap<String, Value>,
        variables: HashMap<String, Value>,
    ) -> Result<(), EngineError> {
        tracing::debug!(message, "correlating message");
        self.dispatcher
            .dispatch(Command::CorrelateMessage {
                message: message.to_string(),
                business_key,
                correlation_keys,
                variables,
            })
            .await
    }
}

/// Worker-facing activity operations of the produced API
pub struct ActivityService {
    dispatcher: Arc<Dispatcher>,
    process_store: Arc<dyn ProcessStore>,
    activity_store: Arc<dyn ActivityStore>,
}

impl ActivityService {
    /// Run an activity definition node within a process
    pub async fn run(
        &self,
        process_id: &ProcessId,
        definition_id: &ActivityDefinitionId,
    ) -> Result<(), EngineError> {
        tracing::debug!(process_id = %process_id, definition_id = %definition_id, "running activity");
        let process = self
            .process_store
            .find_by_id(process_id)
            .await?
            .ok_or_else(|| EngineError::ProcessNotFound(process_id.0.clone()))?;
        self.dispatcher
            .dispatch(Command::RunActivity {
                process,
                definition_id: definition_id.clone(),
            })
            .await
    }

    /// Finish an activity execution with its output variables
    pub async fn complete(
        &self,
        activity_id: &ActivityId,
        variables: HashMap<String, Value>,
    ) -> Result<(), EngineError> {
        tracing::debug!(activity_id = %activity_id, "completing activity");
        self.dispatcher
            .dispatch(Command::CompleteActivity {
                activity_id: activity_id.clone(),
                variables,
            })
            .await
    }

    /// Report a worker failure on an activity execution
    pub async fn fail(&self, activity_id: &ActivityId, failure: Failure) -> Result<(), EngineError> {
        tracing::debug!(activity_id = %activity_id, "failing activity");
        self.dispatcher
            .dispatch(Command::FailActivity {
                activity_id: activity_id.clone(),
                failure,
            })
            .await
    }

    /// Force an activity execution into a terminal state
    pub async fn terminate(&self, activity_id: &ActivityId) -> Result<(), EngineError> {
        tracing::debug!(activity_id = %activity_id, "terminating activity");
        self.dispatcher
            .dispatch(Command::TerminateActivity {
                activity_id: activity_id.clone(),
                with_interruption: true,
            })
            .await
    }

    /// Put a failed or active execution back in the worker queue
    pub async fn retry(&self, activity_id: &ActivityId) -> Result<(), EngineError> {
        tracing::debug!(activity_id = %activity_id, "retrying activity");
        self.dispatcher
            .dispatch(Command::RetryActivity {
                activity_id: activity_id.clone(),
            })
            .await
    }

    /// Hand out up to `limit` scheduled tasks of a topic to a worker
    pub async fn poll(
        &self,
        topic: &str,
        definition_key: &str,
        limit: usize,
    ) -> Result<Vec<ActivityExecution>, EngineError> {
        self.activity_store.poll(topic, definition_key, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conflux_core::model::{
        ActivityDefinition, ActivityPayload, ProcessDefinition, ProcessState,
    };
    use conflux_core::{JmespathEvaluator, MemoryEngineStore};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn create_activity(
        id: &str,
        outgoing: &[&str],
        payload: ActivityPayload,
    ) -> ActivityDefinition {
        ActivityDefinition {
            id: ActivityDefinitionId::from(id),
            name: id.to_string(),
            parent_id: None,
            incoming: Vec::new(),
            outgoing: outgoing.iter().map(|id| ActivityDefinitionId::from(*id)).collect(),
            payload,
        }
    }

    fn create_definition(activities: Vec<ActivityDefinition>) -> ProcessDefinition {
        ProcessDefinition {
            id: ProcessDefinitionId("order:1".to_string()),
            key: "order".to_string(),
            version: 1,
            activities,
            messages: Vec::new(),
            errors: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    fn straight_through_definition() -> ProcessDefinition {
        create_definition(vec![
            create_activity("start", &["end"], ActivityPayload::StartEvent),
            create_activity("end", &[], ActivityPayload::EndEvent),
        ])
    }

    fn worker_definition() -> ProcessDefinition {
        create_definition(vec![
            create_activity("start", &["work"], ActivityPayload::StartEvent),
            create_activity(
                "work",
                &["end"],
                ActivityPayload::ExternalTask {
                    topic: "billing".to_string(),
                    retries: None,
                    timeout: None,
                },
            ),
            create_activity("end", &[], ActivityPayload::EndEvent),
        ])
    }

    async fn create_engine(definition: ProcessDefinition) -> (Arc<MemoryEngineStore>, Engine) {
        let store = Arc::new(MemoryEngineStore::new());
        let definitions: Arc<dyn DefinitionStore> = store.clone();
        definitions.save(definition).await.unwrap();
        let engine = Engine::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(JmespathEvaluator::new()),
            Arc::new(EngineConfig::default()),
        );
        (store, engine)
    }

    #[tokio::test]
    async fn test_start_by_key_walks_to_completion() {
        let (store, engine) = create_engine(straight_through_definition()).await;

        let process = engine
            .runtime
            .start_by_key("order", Some("bk-1".to_string()), HashMap::new())
            .await
            .unwrap();

        let port: Arc<dyn ProcessStore> = store;
        let stored = port.find_by_id(&process.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ProcessState::Completed);
        assert_eq!(stored.business_key.as_deref(), Some("bk-1"));
    }

    #[tokio::test]
    async fn test_start_by_id_resolves_the_exact_version() {
        let (_store, engine) = create_engine(straight_through_definition()).await;

        let process = engine
            .runtime
            .start_by_id(
                &ProcessDefinitionId("order:1".to_string()),
                None,
                HashMap::new(),
            )
            .await
            .unwrap();

        assert_eq!(process.definition.id.0, "order:1");
    }

    #[tokio::test]
    async fn test_start_by_unknown_key_is_an_error() {
        let (_store, engine) = create_engine(straight_through_definition()).await;

        let result = engine
            .runtime
            .start_by_key("missing", None, HashMap::new())
            .await;

        match result {
            Err(EngineError::DefinitionNotFound(key)) => assert_eq!(key, "missing"),
            other => panic!("Expected a definition lookup failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_poll_and_complete_drives_the_process_home() {
        let (store, engine) = create_engine(worker_definition()).await;

        let process = engine
            .runtime
            .start_by_key("order", None, HashMap::new())
            .await
            .unwrap();

        let polled = engine.activities.poll("billing", "order", 10).await.unwrap();
        assert_eq!(polled.len(), 1);

        engine
            .activities
            .complete(
                &polled[0].id,
                HashMap::from([("approved".to_string(), json!(true))]),
            )
            .await
            .unwrap();

        let port: Arc<dyn ProcessStore> = store;
        let stored = port.find_by_id(&process.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ProcessState::Completed);
        let variables = engine.variables.process_variables(&stored).await.unwrap();
        assert_eq!(variables.get("approved"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_terminate_settles_live_work() {
        let (store, engine) = create_engine(worker_definition()).await;

        let process = engine
            .runtime
            .start_by_key("order", None, HashMap::new())
            .await
            .unwrap();
        engine.runtime.terminate(&process.id).await.unwrap();

        let processes: Arc<dyn ProcessStore> = store.clone();
        let stored = processes.find_by_id(&process.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ProcessState::Terminated);

        let activities: Arc<dyn ActivityStore> = store;
        let live = activities
            .find_active(&process.id, &[ActivityDefinitionId::from("work")])
            .await
            .unwrap();
        assert!(live.is_empty());
    }

    #[tokio::test]
    async fn test_suspend_blocks_new_work_until_resume() {
        let (_store, engine) = create_engine(worker_definition()).await;

        let process = engine
            .runtime
            .start_by_key("order", None, HashMap::new())
            .await
            .unwrap();

        let suspended = engine.runtime.suspend(&process.id).await.unwrap();
        assert!(suspended.suspended);

        let resumed = engine.runtime.resume(&process.id).await.unwrap();
        assert!(!resumed.suspended);
    }

    #[tokio::test]
    async fn test_set_variables_are_readable_in_scope() {
        let (_store, engine) = create_engine(worker_definition()).await;

        let process = engine
            .runtime
            .start_by_key("order", None, HashMap::new())
            .await
            .unwrap();

        engine
            .runtime
            .set_variables(
                &process.id.0,
                HashMap::from([("total".to_string(), json!(42))]),
            )
            .await
            .unwrap();

        let variables = engine.variables.process_variables(&process).await.unwrap();
        assert_eq!(variables.get("total"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn test_run_activity_on_an_unknown_process_is_an_error() {
        let (_store, engine) = create_engine(worker_definition()).await;

        let result = engine
            .activities
            .run(
                &ProcessId("missing".to_string()),
                &ActivityDefinitionId::from("work"),
            )
            .await;

        match result {
            Err(EngineError::ProcessNotFound(id)) => assert_eq!(id, "missing"),
            other => panic!("Expected a process lookup failure, got {:?}", other),
        }
    }
}
