//! Integration tests driving a fully wired engine against the in-memory
//! stores: gateway routing, parallel join, worker retry and incident
//! recovery, message correlation and the background jobs.

use conflux_core::model::{
    ActivityDefinition, ActivityDefinitionId, ActivityPayload, ActivityState, ConditionedPath,
    Failure, ProcessDefinition, ProcessDefinitionId, ProcessState,
};
use conflux_core::persistence::{ActivityStore, DefinitionStore, ProcessStore};
use conflux_core::{EngineError, JmespathEvaluator, MemoryEngineStore};
use conflux_engine::{CompactionJob, Engine, EngineConfig, TimeoutSweep};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

fn create_activity(
    id: &str,
    incoming: &[&str],
    outgoing: &[&str],
    payload: ActivityPayload,
) -> ActivityDefinition {
    ActivityDefinition {
        id: ActivityDefinitionId::from(id),
        name: id.to_string(),
        parent_id: None,
        incoming: incoming.iter().map(|id| ActivityDefinitionId::from(*id)).collect(),
        outgoing: outgoing.iter().map(|id| ActivityDefinitionId::from(*id)).collect(),
        payload,
    }
}

fn external_task(
    id: &str,
    topic: &str,
    incoming: &[&str],
    outgoing: &[&str],
    retries: Option<u32>,
    timeout: Option<i64>,
) -> ActivityDefinition {
    create_activity(
        id,
        incoming,
        outgoing,
        ActivityPayload::ExternalTask {
            topic: topic.to_string(),
            retries,
            timeout,
        },
    )
}

fn create_definition(
    id: &str,
    key: &str,
    activities: Vec<ActivityDefinition>,
    messages: Vec<&str>,
) -> ProcessDefinition {
    ProcessDefinition {
        id: ProcessDefinitionId(id.to_string()),
        key: key.to_string(),
        version: 1,
        activities,
        messages: messages.into_iter().map(String::from).collect(),
        errors: Vec::new(),
        metadata: HashMap::new(),
    }
}

async fn create_engine(definitions: Vec<ProcessDefinition>) -> (Arc<MemoryEngineStore>, Engine) {
    let store = Arc::new(MemoryEngineStore::new());
    let port: Arc<dyn DefinitionStore> = store.clone();
    for definition in definitions {
        port.save(definition).await.unwrap();
    }
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

/// Poll until the condition holds; detached continuations need a moment
async fn wait_until<F, Fut>(description: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("Timed out waiting until {}", description);
}

fn approval_definition() -> ProcessDefinition {
    create_definition(
        "approval:1",
        "approval",
        vec![
            create_activity("start", &[], &["route"], ActivityPayload::StartEvent),
            create_activity(
                "route",
                &["start"],
                &["grant", "escalate"],
                ActivityPayload::ExclusiveGateway {
                    paths: vec![
                        ConditionedPath {
                            condition: Some("${approved}".to_string()),
                            target: ActivityDefinitionId::from("grant"),
                        },
                        ConditionedPath {
                            condition: None,
                            target: ActivityDefinitionId::from("escalate"),
                        },
                    ],
                },
            ),
            external_task("grant", "grants", &["route"], &["end"], None, None),
            external_task("escalate", "reviews", &["route"], &["end"], None, None),
            create_activity("end", &["grant", "escalate"], &[], ActivityPayload::EndEvent),
        ],
        vec![],
    )
}

#[tokio::test]
async fn test_exclusive_gateway_routes_by_condition() {
    let (_store, engine) = create_engine(vec![approval_definition()]).await;

    engine
        .runtime
        .start_by_key(
            "approval",
            None,
            HashMap::from([("approved".to_string(), json!(true))]),
        )
        .await
        .unwrap();

    let granted = engine.activities.poll("grants", "approval", 10).await.unwrap();
    assert_eq!(granted.len(), 1);
    let reviews = engine.activities.poll("reviews", "approval", 10).await.unwrap();
    assert!(reviews.is_empty());
}

#[tokio::test]
async fn test_exclusive_gateway_falls_back_to_the_default_path() {
    let (_store, engine) = create_engine(vec![approval_definition()]).await;

    engine
        .runtime
        .start_by_key(
            "approval",
            None,
            HashMap::from([("approved".to_string(), json!(false))]),
        )
        .await
        .unwrap();

    let reviews = engine.activities.poll("reviews", "approval", 10).await.unwrap();
    assert_eq!(reviews.len(), 1);
    let granted = engine.activities.poll("grants", "approval", 10).await.unwrap();
    assert!(granted.is_empty());
}

#[tokio::test]
async fn test_parallel_fork_and_join_emit_one_downstream_token() {
    let definition = create_definition(
        "dispatch:1",
        "dispatch",
        vec![
            create_activity("start", &[], &["fork"], ActivityPayload::StartEvent),
            create_activity(
                "fork",
                &["start"],
                &["pack", "bill"],
                ActivityPayload::ParallelGateway,
            ),
            external_task("pack", "packing", &["fork"], &["join"], None, None),
            external_task("bill", "billing", &["fork"], &["join"], None, None),
            create_activity(
                "join",
                &["pack", "bill"],
                &["end"],
                ActivityPayload::ParallelGateway,
            ),
            create_activity("end", &["join"], &[], ActivityPayload::EndEvent),
        ],
        vec![],
    );
    let (store, engine) = create_engine(vec![definition]).await;

    let process = engine
        .runtime
        .start_by_key("dispatch", None, HashMap::new())
        .await
        .unwrap();

    let packing = engine.activities.poll("packing", "dispatch", 10).await.unwrap();
    let billing = engine.activities.poll("billing", "dispatch", 10).await.unwrap();
    assert_eq!((packing.len(), billing.len()), (1, 1));

    engine
        .activities
        .complete(&packing[0].id, HashMap::new())
        .await
        .unwrap();
    let processes: Arc<dyn ProcessStore> = store.clone();
    let waiting = processes.find_by_id(&process.id).await.unwrap().unwrap();
    assert_eq!(waiting.state, ProcessState::Active);

    engine
        .activities
        .complete(&billing[0].id, HashMap::new())
        .await
        .unwrap();

    let finished = processes.find_by_id(&process.id).await.unwrap().unwrap();
    assert_eq!(finished.state, ProcessState::Completed);
    let activities: Arc<dyn ActivityStore> = store;
    let ends = activities
        .count_by_definition_id(&process.id, &ActivityDefinitionId::from("end"))
        .await
        .unwrap();
    assert_eq!(ends, 1);
}

#[tokio::test]
async fn test_exhausted_retries_raise_an_incident_and_resolution_recovers() {
    let definition = create_definition(
        "billing:1",
        "billing",
        vec![
            create_activity("start", &[], &["charge"], ActivityPayload::StartEvent),
            external_task("charge", "cards", &["start"], &["end"], Some(1), None),
            create_activity("end", &["charge"], &[], ActivityPayload::EndEvent),
        ],
        vec![],
    );
    let (store, engine) = create_engine(vec![definition]).await;

    let process = engine
        .runtime
        .start_by_key("billing", None, HashMap::new())
        .await
        .unwrap();

    let first = engine.activities.poll("cards", "billing", 10).await.unwrap();
    assert_eq!(first.len(), 1);
    engine
        .activities
        .fail(&first[0].id, Failure::new("gateway unreachable"))
        .await
        .unwrap();

    // The first failure consumes the retry budget on a detached requeue
    let engine = Arc::new(engine);
    let retry_poll = engine.clone();
    wait_until("the failed task is requeued", move || {
        let engine = retry_poll.clone();
        async move {
            !engine
                .activities
                .poll("cards", "billing", 10)
                .await
                .unwrap()
                .is_empty()
        }
    })
    .await;

    let activities: Arc<dyn ActivityStore> = store.clone();
    let second = activities
        .find_by_id(&first[0].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.retries, 1);
    engine
        .activities
        .fail(&second.id, Failure::new("gateway unreachable"))
        .await
        .unwrap();

    let processes: Arc<dyn ProcessStore> = store.clone();
    let stuck = processes.find_by_id(&process.id).await.unwrap().unwrap();
    assert_eq!(stuck.state, ProcessState::Incident);

    engine.runtime.resolve_incident(&process.id).await.unwrap();
    let requeued = engine.activities.poll("cards", "billing", 10).await.unwrap();
    assert_eq!(requeued.len(), 1);
    assert_eq!(requeued[0].retries, 0);

    engine
        .activities
        .complete(&requeued[0].id, HashMap::new())
        .await
        .unwrap();

    let recovered = processes.find_by_id(&process.id).await.unwrap().unwrap();
    assert_eq!(recovered.state, ProcessState::Completed);
}

fn payment_definition() -> ProcessDefinition {
    create_definition(
        "payment:1",
        "payment",
        vec![
            create_activity("start", &[], &["await_payment"], ActivityPayload::StartEvent),
            create_activity(
                "await_payment",
                &["start"],
                &["end"],
                ActivityPayload::ReceiveTask {
                    message: "payment_received".to_string(),
                },
            ),
            create_activity("end", &["await_payment"], &[], ActivityPayload::EndEvent),
        ],
        vec!["payment_received"],
    )
}

#[tokio::test]
async fn test_message_correlation_completes_the_waiting_process() {
    let (store, engine) = create_engine(vec![payment_definition()]).await;

    let process = engine
        .runtime
        .start_by_key("payment", Some("inv-100".to_string()), HashMap::new())
        .await
        .unwrap();

    engine
        .runtime
        .correlate_message(
            "payment_received",
            Some("inv-100".to_string()),
            HashMap::new(),
            HashMap::from([("amount".to_string(), json!(250))]),
        )
        .await
        .unwrap();

    let processes: Arc<dyn ProcessStore> = store;
    let process_id = process.id.clone();
    let port = processes.clone();
    wait_until("the paid process completes", move || {
        let port = port.clone();
        let process_id = process_id.clone();
        async move {
            port.find_by_id(&process_id)
                .await
                .unwrap()
                .map(|p| p.state == ProcessState::Completed)
                .unwrap_or(false)
        }
    })
    .await;

    let finished = processes.find_by_id(&process.id).await.unwrap().unwrap();
    let variables = engine.variables.process_variables(&finished).await.unwrap();
    assert_eq!(variables.get("amount"), Some(&json!(250)));
}

#[tokio::test]
async fn test_message_without_a_match_is_reported() {
    let (_store, engine) = create_engine(vec![payment_definition()]).await;

    engine
        .runtime
        .start_by_key("payment", Some("inv-100".to_string()), HashMap::new())
        .await
        .unwrap();

    let result = engine
        .runtime
        .correlate_message(
            "payment_received",
            Some("inv-404".to_string()),
            HashMap::new(),
            HashMap::new(),
        )
        .await;

    match result {
        Err(EngineError::Dispatch { source, .. }) => match *source {
            EngineError::NoneCorrelated(message) => assert_eq!(message, "payment_received"),
            other => panic!("Expected no correlation, got {:?}", other),
        },
        other => panic!("Expected a dispatch failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_ambiguous_message_is_reported_with_the_match_count() {
    let (_store, engine) = create_engine(vec![payment_definition()]).await;

    for _ in 0..2 {
        engine
            .runtime
            .start_by_key("payment", Some("inv-100".to_string()), HashMap::new())
            .await
            .unwrap();
    }

    let result = engine
        .runtime
        .correlate_message(
            "payment_received",
            Some("inv-100".to_string()),
            HashMap::new(),
            HashMap::new(),
        )
        .await;

    match result {
        Err(EngineError::Dispatch { source, .. }) => match *source {
            EngineError::AmbiguousCorrelation { count, .. } => assert_eq!(count, 2),
            other => panic!("Expected an ambiguous correlation, got {:?}", other),
        },
        other => panic!("Expected a dispatch failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_message_without_any_key_is_rejected() {
    let (_store, engine) = create_engine(vec![payment_definition()]).await;

    let result = engine
        .runtime
        .correlate_message("payment_received", None, HashMap::new(), HashMap::new())
        .await;

    match result {
        Err(EngineError::Dispatch { source, .. }) => {
            assert!(matches!(*source, EngineError::Correlation(_)))
        }
        other => panic!("Expected a dispatch failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_compaction_removes_finished_history_and_keeps_live_work() {
    let straight = create_definition(
        "audit:1",
        "audit",
        vec![
            create_activity("start", &[], &["end"], ActivityPayload::StartEvent),
            create_activity("end", &["start"], &[], ActivityPayload::EndEvent),
        ],
        vec![],
    );
    let (store, engine) = create_engine(vec![straight, approval_definition()]).await;

    let finished = engine
        .runtime
        .start_by_key("audit", None, HashMap::new())
        .await
        .unwrap();
    let live = engine
        .runtime
        .start_by_key(
            "approval",
            None,
            HashMap::from([("approved".to_string(), json!(true))]),
        )
        .await
        .unwrap();

    let job = CompactionJob::new(
        store.clone(),
        store.clone(),
        store.clone(),
        Arc::new(EngineConfig::default()),
    );
    assert_eq!(job.run_once().await.unwrap(), 1);

    let processes: Arc<dyn ProcessStore> = store;
    assert!(processes.find_by_id(&finished.id).await.unwrap().is_none());
    assert!(processes.find_by_id(&live.id).await.unwrap().is_some());

    // The lease was released, so an immediate second pass can run again
    assert_eq!(job.run_once().await.unwrap(), 0);
}

#[tokio::test]
async fn test_timeout_sweep_fails_an_expired_task() {
    let definition = create_definition(
        "imports:1",
        "imports",
        vec![
            create_activity("start", &[], &["load"], ActivityPayload::StartEvent),
            external_task("load", "loaders", &["start"], &["end"], None, Some(0)),
            create_activity("end", &["load"], &[], ActivityPayload::EndEvent),
        ],
        vec![],
    );
    let (store, engine) = create_engine(vec![definition]).await;

    let process = engine
        .runtime
        .start_by_key("imports", None, HashMap::new())
        .await
        .unwrap();
    let polled = engine.activities.poll("loaders", "imports", 10).await.unwrap();
    assert_eq!(polled.len(), 1);

    let sweep = TimeoutSweep::new(store.clone(), store.clone(), Arc::new(EngineConfig::default()));
    assert_eq!(sweep.run_once(&engine.dispatcher).await.unwrap(), 1);

    let processes: Arc<dyn ProcessStore> = store.clone();
    let process_id = process.id.clone();
    let port = processes.clone();
    wait_until("the expired task raises an incident", move || {
        let port = port.clone();
        let process_id = process_id.clone();
        async move {
            port.find_by_id(&process_id)
                .await
                .unwrap()
                .map(|p| p.state == ProcessState::Incident)
                .unwrap_or(false)
        }
    })
    .await;

    let activities: Arc<dyn ActivityStore> = store;
    let failed = activities.find_by_id(&polled[0].id).await.unwrap().unwrap();
    assert_eq!(failed.state, ActivityState::Failed);
    assert_eq!(failed.failure.unwrap().reason, "Timeout");
}
