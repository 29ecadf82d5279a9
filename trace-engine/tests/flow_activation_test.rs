//! Flow activation integration tests
//!
//! Drive a full engine (in-memory durable tier, no live transport) with
//! fragments and envelopes and check what the flow graph shows.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use shared_types::{
    ActivationSnapshot, AgentNodeId, EdgeId, EdgeState, NodeState, StepKind, SuppressionKey, Task,
    TraceFragment, TraceGroup,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

use trace_engine::actors::connection::{SessionKey, Transport, TransportError, TransportLink};
use trace_engine::actors::activation::ActivationMsg;
use trace_engine::actors::event_bus::{BusEvent, BusPayload, Topic, TraceUpdate};
use trace_engine::actors::trace_store::{fingerprint, DurableTierArgs, MemoryTier};
use trace_engine::{EngineConfig, TraceEngine};

// ============================================================================
// Test Helpers
// ============================================================================

struct OfflineTransport;

#[async_trait]
impl Transport for OfflineTransport {
    async fn open(&self, _key: &SessionKey) -> Result<TransportLink, TransportError> {
        Err(TransportError::Closed)
    }
}

async fn start_engine() -> TraceEngine {
    start_engine_with_suppression(Duration::from_millis(100)).await
}

async fn start_engine_with_suppression(suppression_timeout: Duration) -> TraceEngine {
    let config = EngineConfig {
        suppression_timeout,
        ..EngineConfig::default()
    };
    TraceEngine::start_with(
        config,
        DurableTierArgs::Memory(MemoryTier::new()),
        Arc::new(OfflineTransport),
    )
    .await
    .expect("engine starts")
}

async fn wait_for_snapshot(
    engine: &TraceEngine,
    predicate: impl Fn(&ActivationSnapshot) -> bool,
) -> ActivationSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let snapshot = engine.snapshot().await.expect("snapshot");
        if predicate(&snapshot) {
            return snapshot;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for snapshot; last: {snapshot:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<BusEvent>) -> BusEvent {
    timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("Timeout waiting for bus event")
        .expect("Event stream closed")
}

fn now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn trace_update(group: &TraceGroup) -> TraceUpdate {
    TraceUpdate {
        node_id: group.agent_id,
        trace_group: group.clone(),
        fingerprint: fingerprint(group.agent_id, group),
    }
}

/// A placeholder-like group followed by its completed successor under the same id.
fn placeholder_then_real(node: AgentNodeId) -> (TraceGroup, TraceGroup) {
    let placeholder = TraceGroup::new(node, node.display_name(), now());
    let mut real = placeholder.clone();
    real.tasks.push(Task {
        step_number: 1,
        title: "Final Response (1.00 seconds)".into(),
        content: json!("Your order shipped yesterday."),
        raw_payload: None,
        timestamp: now(),
        sub_tasks: Vec::new(),
    });
    real.is_complete = true;
    real.last_update_time += 1;
    (placeholder, real)
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_empty_routing_trace_activates_classifier() {
    let engine = start_engine().await;

    let reports = engine
        .ingest_envelope(json!({"onUpdateChat": {"trace": {"trace": {"routingClassifierTrace": {}}}}}))
        .await
        .unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].node_id, AgentNodeId::RoutingClassifier);

    let snapshot = wait_for_snapshot(&engine, |s| {
        s.node_state(AgentNodeId::RoutingClassifier) == NodeState::Processing
    })
    .await;
    assert_eq!(
        snapshot.edge(EdgeId::RoutingClassifierSupervisor).unwrap().state,
        EdgeState::Active
    );

    let group = engine.trace(AgentNodeId::RoutingClassifier).await.unwrap().unwrap();
    assert_eq!(group.tasks.len(), 1);
    assert!(!group.is_complete);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_long_final_response_completes_troubleshoot() {
    let engine = start_engine().await;
    let mut activations = engine.watch(&[Topic::ActivationChanged]).await.unwrap();

    engine
        .ingest_fragment(TraceFragment::new(
            "Troubleshoot",
            StepKind::FinalResponse,
            json!("x".repeat(600)),
            now(),
        ))
        .await
        .unwrap();

    let mut saw_processing = false;
    loop {
        let event = next_event(&mut activations).await;
        let BusPayload::ActivationChanged(snapshot) = event.payload else {
            continue;
        };
        match snapshot.node_state(AgentNodeId::Troubleshoot) {
            NodeState::Processing => saw_processing = true,
            NodeState::Complete => break,
            NodeState::Idle => {}
        }
    }
    assert!(saw_processing, "complete must be reached through processing");

    let group = engine.trace(AgentNodeId::Troubleshoot).await.unwrap().unwrap();
    assert!(group.is_complete);
    assert!(group.final_elapsed_time.is_some());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_supervisor_fans_out_to_four_specialists() {
    let engine = start_engine().await;

    engine
        .ingest_fragment(TraceFragment::new(
            "Supervisor",
            StepKind::Rationale,
            json!("Routing the order question"),
            now(),
        ))
        .await
        .unwrap();

    let snapshot = wait_for_snapshot(&engine, |s| {
        AgentNodeId::SUB_AGENTS
            .iter()
            .all(|node| s.node_state(*node) == NodeState::Processing)
    })
    .await;

    let processing = snapshot.processing_nodes();
    assert_eq!(processing.len(), 5, "supervisor plus four specialists: {processing:?}");
    assert_eq!(snapshot.node_state(AgentNodeId::RoutingClassifier), NodeState::Idle);
    assert_eq!(snapshot.node_state(AgentNodeId::Customer), NodeState::Idle);

    for node in AgentNodeId::SUB_AGENTS {
        let edge = EdgeId::for_sub_agent(node).unwrap();
        let activation = snapshot.edge(edge).unwrap();
        assert_eq!(activation.state, EdgeState::Active);
        assert_eq!(activation.call_count, 1);
    }
    assert!(!snapshot.conversation_complete);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_placeholder_writes_carry_suppression_keys() {
    let engine = start_engine().await;
    let mut updates = engine.watch(&[Topic::TraceUpdated]).await.unwrap();

    engine
        .ingest_fragment(TraceFragment::new("Supervisor", StepKind::Rationale, json!("r"), now()))
        .await
        .unwrap();

    let mut seeded = Vec::new();
    while seeded.len() < AgentNodeId::SUB_AGENTS.len() {
        let event = next_event(&mut updates).await;
        let BusPayload::TraceUpdated(update) = &event.payload else {
            continue;
        };
        if update.node_id == AgentNodeId::Supervisor {
            assert!(event.suppression.is_none());
            continue;
        }
        let key = event.suppression.clone().expect("placeholder write is suppressed");
        assert_eq!(key.node_id, update.node_id);
        assert_eq!(key.trace_group_id, update.trace_group.id);
        seeded.push(update.node_id);
    }
    seeded.sort();
    let mut expected = AgentNodeId::SUB_AGENTS.to_vec();
    expected.sort();
    assert_eq!(seeded, expected);

    // A specialist's real trace merges into its placeholder group.
    let placeholder = engine.trace(AgentNodeId::OrderMgmt).await.unwrap().unwrap();
    let report = engine
        .ingest_fragment(TraceFragment::new(
            "OrderManagement",
            StepKind::FinalResponse,
            json!("y".repeat(700)),
            now(),
        ))
        .await
        .unwrap();
    assert_eq!(report.trace_group_id, placeholder.id);
    assert!(report.completed_now);

    let snapshot = wait_for_snapshot(&engine, |s| {
        s.node_state(AgentNodeId::OrderMgmt) == NodeState::Complete
    })
    .await;
    assert_eq!(snapshot.node_state(AgentNodeId::Troubleshoot), NodeState::Processing);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_completed_supervisor_does_not_fan_out() {
    let engine = start_engine().await;

    engine
        .ingest_fragment(
            TraceFragment::new("Supervisor", StepKind::FinalResponse, json!("Done."), now()).completed(),
        )
        .await
        .unwrap();

    let snapshot = wait_for_snapshot(&engine, |s| s.conversation_complete).await;
    for node in AgentNodeId::SUB_AGENTS {
        assert_eq!(snapshot.node_state(node), NodeState::Idle);
    }

    engine.shutdown().await;
}

#[tokio::test]
async fn test_select_redelivers_without_state_change() {
    let engine = start_engine().await;
    let mut selections = engine.watch(&[Topic::NodeSelected]).await.unwrap();

    engine
        .ingest_fragment(TraceFragment::new("Personalization", StepKind::Rationale, json!("why"), now()))
        .await
        .unwrap();
    let before = wait_for_snapshot(&engine, |s| {
        s.node_state(AgentNodeId::Personalization) == NodeState::Processing
    })
    .await;

    let first = engine.select(AgentNodeId::Personalization).await.unwrap().unwrap();
    let second = engine.select(AgentNodeId::Personalization).await.unwrap().unwrap();
    assert_eq!(first, second);
    assert_eq!(engine.snapshot().await.unwrap(), before);

    let event = next_event(&mut selections).await;
    match event.payload {
        BusPayload::NodeSelected { node_id, trace_group } => {
            assert_eq!(node_id, AgentNodeId::Personalization);
            assert_eq!(trace_group.unwrap().id, first.id);
        }
        other => panic!("unexpected payload {other:?}"),
    }

    assert_eq!(engine.select(AgentNodeId::Customer).await.unwrap(), None);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_reset_idles_nodes_and_keeps_call_counts() {
    let engine = start_engine().await;
    let mut resets = engine.watch(&[Topic::Reset]).await.unwrap();

    engine
        .ingest_fragment(TraceFragment::new("Troubleshoot", StepKind::Rationale, json!("r"), now()))
        .await
        .unwrap();
    wait_for_snapshot(&engine, |s| {
        s.node_state(AgentNodeId::Troubleshoot) == NodeState::Processing
    })
    .await;

    engine.reset().await.unwrap();
    let event = next_event(&mut resets).await;
    assert!(matches!(event.payload, BusPayload::Reset));

    let snapshot = engine.snapshot().await.unwrap();
    assert!(snapshot.processing_nodes().is_empty());
    assert!(snapshot.active_edges().is_empty());
    assert_eq!(snapshot.edge(EdgeId::SupervisorTroubleshoot).unwrap().call_count, 1);
    assert_eq!(engine.trace(AgentNodeId::Troubleshoot).await.unwrap(), None);

    // A new conversation counts as a second call on the same edge.
    engine
        .ingest_fragment(TraceFragment::new("Troubleshoot", StepKind::Rationale, json!("r2"), now()))
        .await
        .unwrap();
    let snapshot = wait_for_snapshot(&engine, |s| {
        s.node_state(AgentNodeId::Troubleshoot) == NodeState::Processing
    })
    .await;
    assert_eq!(snapshot.edge(EdgeId::SupervisorTroubleshoot).unwrap().call_count, 2);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_malformed_envelope_leaves_graph_idle() {
    let engine = start_engine().await;

    let result = engine
        .ingest_envelope(json!({"onUpdateChat": {"trace": "{not json"}}))
        .await;
    assert!(result.is_err());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = engine.snapshot().await.unwrap();
    assert!(snapshot.processing_nodes().is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_suppressed_notification_is_discarded_then_key_is_spent() {
    let engine = start_engine_with_suppression(Duration::from_secs(30)).await;
    let mut activations = engine.watch(&[Topic::ActivationChanged]).await.unwrap();
    let controller = engine.controller();

    let (placeholder, real) = placeholder_then_real(AgentNodeId::OrderMgmt);
    let key = SuppressionKey::new(AgentNodeId::OrderMgmt, placeholder.id.clone());

    controller.cast(ActivationMsg::Suppress { key: key.clone() }).unwrap();
    controller
        .cast(ActivationMsg::TraceUpdated {
            update: trace_update(&placeholder),
            suppression: Some(key.clone()),
        })
        .unwrap();

    // The snapshot call queues behind both casts.
    let snapshot = engine.snapshot().await.unwrap();
    assert_eq!(snapshot.node_state(AgentNodeId::OrderMgmt), NodeState::Idle);
    assert!(timeout(Duration::from_millis(150), activations.recv()).await.is_err());

    // The key went with the first notification; the next one is observed.
    controller
        .cast(ActivationMsg::TraceUpdated {
            update: trace_update(&real),
            suppression: Some(key),
        })
        .unwrap();
    let snapshot = wait_for_snapshot(&engine, |s| {
        s.node_state(AgentNodeId::OrderMgmt) == NodeState::Complete
    })
    .await;
    assert_eq!(
        snapshot.edge(EdgeId::SupervisorOrderMgmt).unwrap().call_count,
        1
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn test_expired_suppression_key_no_longer_discards() {
    let engine = start_engine_with_suppression(Duration::from_millis(50)).await;
    let controller = engine.controller();

    let (placeholder, _) = placeholder_then_real(AgentNodeId::Troubleshoot);
    let key = SuppressionKey::new(AgentNodeId::Troubleshoot, placeholder.id.clone());

    controller.cast(ActivationMsg::Suppress { key: key.clone() }).unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    controller
        .cast(ActivationMsg::TraceUpdated {
            update: trace_update(&placeholder),
            suppression: Some(key),
        })
        .unwrap();
    wait_for_snapshot(&engine, |s| {
        s.node_state(AgentNodeId::Troubleshoot) == NodeState::Processing
    })
    .await;

    engine.shutdown().await;
}

#[tokio::test]
async fn test_stale_expiry_keeps_reregistered_key() {
    let engine = start_engine_with_suppression(Duration::from_secs(30)).await;
    let controller = engine.controller();

    let (placeholder, _) = placeholder_then_real(AgentNodeId::Personalization);
    let key = SuppressionKey::new(AgentNodeId::Personalization, placeholder.id.clone());

    // Fresh controller: these registrations get tokens 1 and 2.
    controller.cast(ActivationMsg::Suppress { key: key.clone() }).unwrap();
    controller.cast(ActivationMsg::Suppress { key: key.clone() }).unwrap();
    controller
        .cast(ActivationMsg::ExpireSuppression {
            key: key.clone(),
            token: 1,
        })
        .unwrap();
    controller
        .cast(ActivationMsg::TraceUpdated {
            update: trace_update(&placeholder),
            suppression: Some(key),
        })
        .unwrap();

    let snapshot = engine.snapshot().await.unwrap();
    assert_eq!(snapshot.node_state(AgentNodeId::Personalization), NodeState::Idle);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_streamed_assistant_text_completes_supervisor() {
    let engine = start_engine().await;

    let first = "Let me look that up for you.";
    engine
        .ingest_envelope(json!({"onUpdateChat": {"assistant": first}}))
        .await
        .unwrap();
    wait_for_snapshot(&engine, |s| {
        s.node_state(AgentNodeId::Supervisor) == NodeState::Processing
    })
    .await;

    let full = format!("{first} Your order shipped yesterday. Is there anything else I can help with?");
    let reports = engine
        .ingest_envelope(json!({"onUpdateChat": {"assistant": full.clone()}}))
        .await
        .unwrap();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].changed);
    assert!(reports[0].completed_now);

    let snapshot = wait_for_snapshot(&engine, |s| s.conversation_complete).await;
    assert_eq!(snapshot.node_state(AgentNodeId::Supervisor), NodeState::Complete);

    let group = engine.trace(AgentNodeId::Supervisor).await.unwrap().unwrap();
    assert_eq!(group.tasks.len(), 1);
    assert_eq!(group.tasks[0].content, json!(full));

    engine.shutdown().await;
}
