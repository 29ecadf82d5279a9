//! ActivationControllerActor - node/edge activation state machine
//!
//! Observes trace updates (from the store's change notifications and from the
//! poll fallback) and derives what the flow graph shows:
//!
//! - node: `idle -> processing -> complete`, back to `idle` only on reset
//! - edge: `active` once an endpoint starts processing, `inactive` only on
//!   reset; `callCount` counts inactive -> active transitions and never drops
//! - supervisor going `processing` fans out to its four specialists before
//!   their own traces arrive
//!
//! Writes the controller causes itself (fan-out placeholders) carry a
//! suppression key. The first notification bearing a live key is dropped and
//! the key with it; unused keys expire after the configured timeout.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde_json::json;
use shared_types::{
    ActivationSnapshot, AgentNodeId, EdgeActivation, EdgeId, EdgeState, NodeActivation, NodeState,
    PersistedTrace, SuppressionKey, Task, TraceGroup,
};

use crate::actors::event_bus::{
    publish_event, subscribe_relay, BusEvent, BusPayload, EventBusMsg, Topic, TraceUpdate,
};
use crate::actors::ingest::TraceIngestMsg;
use crate::actors::trace_store::{fingerprint, read_trace, TraceStoreMsg};
use crate::display::prepare_for_display;

pub const PLACEHOLDER_TASK_TITLE: &str = "Processing request";
pub const PLACEHOLDER_TASK_CONTENT: &str = "Processing request from supervisor";

#[derive(Debug)]
pub enum ActivationMsg {
    /// Store change notification
    TraceUpdated {
        update: TraceUpdate,
        suppression: Option<SuppressionKey>,
    },
    /// Durable records read by the poll fallback
    Reconcile { records: Vec<PersistedTrace> },
    /// Re-deliver a node's trace group to the view; state is untouched
    Select {
        node: AgentNodeId,
        reply: Option<RpcReplyPort<Option<TraceGroup>>>,
    },
    Reset { reply: RpcReplyPort<()> },
    GetSnapshot { reply: RpcReplyPort<ActivationSnapshot> },
    /// Register a write the caller is about to make so its notification is
    /// not observed as new input
    Suppress { key: SuppressionKey },
    ExpireSuppression { key: SuppressionKey, token: u64 },
}

pub struct ActivationArguments {
    pub event_bus: ActorRef<EventBusMsg>,
    pub store: ActorRef<TraceStoreMsg>,
    pub ingest: ActorRef<TraceIngestMsg>,
    pub suppression_timeout: Duration,
}

/// Node and edge activation, independent of any actor.
#[derive(Debug, Clone)]
pub struct ActivationGraph {
    nodes: BTreeMap<AgentNodeId, NodeActivation>,
    edges: BTreeMap<EdgeId, EdgeActivation>,
}

impl Default for ActivationGraph {
    fn default() -> Self {
        let mut graph = Self {
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
        };
        graph.reset(0);
        graph
    }
}

impl ActivationGraph {
    /// Every node back to idle and every edge inactive. Call counts persist.
    pub fn reset(&mut self, now: i64) {
        for node in AgentNodeId::ALL {
            self.nodes.insert(
                node,
                NodeActivation {
                    node,
                    state: NodeState::Idle,
                    trace_group_id: None,
                    updated_at: now,
                },
            );
        }
        for edge in EdgeId::ALL {
            let entry = self.edges.entry(edge).or_insert(EdgeActivation {
                edge,
                state: EdgeState::Inactive,
                call_count: 0,
                last_activated_at: None,
            });
            entry.state = EdgeState::Inactive;
        }
    }

    pub fn node_state(&self, node: AgentNodeId) -> NodeState {
        self.nodes
            .get(&node)
            .map(|n| n.state)
            .unwrap_or(NodeState::Idle)
    }

    pub fn trace_group_id(&self, node: AgentNodeId) -> Option<&str> {
        self.nodes
            .get(&node)
            .and_then(|n| n.trace_group_id.as_deref())
    }

    pub fn edge(&self, edge: EdgeId) -> Option<&EdgeActivation> {
        self.edges.get(&edge)
    }

    pub fn snapshot(&self) -> ActivationSnapshot {
        ActivationSnapshot {
            nodes: self.nodes.values().cloned().collect(),
            edges: self.edges.values().cloned().collect(),
            conversation_complete: self.node_state(AgentNodeId::Supervisor) == NodeState::Complete,
        }
    }

    /// Record the group currently driving a node without changing its state.
    pub fn attach_group(&mut self, node: AgentNodeId, group_id: &str, now: i64) {
        if let Some(entry) = self.nodes.get_mut(&node) {
            entry.trace_group_id = Some(group_id.to_string());
            entry.updated_at = now;
        }
    }

    fn set_state(&mut self, node: AgentNodeId, to: NodeState, group_id: Option<&str>, now: i64) {
        if let Some(entry) = self.nodes.get_mut(&node) {
            entry.state = to;
            entry.updated_at = now;
            if let Some(id) = group_id {
                entry.trace_group_id = Some(id.to_string());
            }
        }
    }

    /// Activate every inactive edge touching `node`.
    fn activate_edges(&mut self, node: AgentNodeId, now: i64) {
        for edge in EdgeId::touching(node) {
            if let Some(entry) = self.edges.get_mut(&edge) {
                if entry.state == EdgeState::Inactive {
                    entry.state = EdgeState::Active;
                    entry.call_count += 1;
                    entry.last_activated_at = Some(now);
                    tracing::debug!(edge = %edge, call_count = entry.call_count, "Edge activated");
                }
            }
        }
    }

    /// idle -> processing. Returns false for any other starting state.
    pub fn start_processing(&mut self, node: AgentNodeId, group_id: Option<&str>, now: i64) -> bool {
        if self.node_state(node) != NodeState::Idle {
            return false;
        }
        self.set_state(node, NodeState::Processing, group_id, now);
        self.activate_edges(node, now);
        tracing::info!(node_id = %node, "Node processing");
        true
    }

    /// processing -> complete. Returns false for any other starting state.
    pub fn complete(&mut self, node: AgentNodeId, group_id: &str, now: i64) -> bool {
        if self.node_state(node) != NodeState::Processing {
            return false;
        }
        self.set_state(node, NodeState::Complete, Some(group_id), now);
        tracing::info!(node_id = %node, "Node complete");
        true
    }
}

/// Live suppression keys, each tagged with the token of its expiry timer.
#[derive(Debug, Default)]
pub struct SuppressionTable {
    keys: HashMap<SuppressionKey, u64>,
    next_token: u64,
}

impl SuppressionTable {
    /// Register (or re-register) a key. Returns the token its expiry must carry.
    pub fn register(&mut self, key: SuppressionKey) -> u64 {
        self.next_token += 1;
        self.keys.insert(key, self.next_token);
        self.next_token
    }

    /// Remove a live key. True when the notification bearing it must be dropped.
    pub fn consume(&mut self, key: &SuppressionKey) -> bool {
        self.keys.remove(key).is_some()
    }

    /// Drop a key whose timer fired, unless it was re-registered since.
    pub fn expire(&mut self, key: &SuppressionKey, token: u64) -> bool {
        if self.keys.get(key) == Some(&token) {
            self.keys.remove(key);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, key: &SuppressionKey) -> bool {
        self.keys.contains_key(key)
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }
}

pub struct ActivationState {
    event_bus: ActorRef<EventBusMsg>,
    store: ActorRef<TraceStoreMsg>,
    ingest: ActorRef<TraceIngestMsg>,
    suppression_timeout: Duration,
    graph: ActivationGraph,
    /// Fingerprint of the last trace update observed per node
    last_seen: HashMap<AgentNodeId, String>,
    suppressed: SuppressionTable,
}

impl ActivationState {
    fn reset(&mut self, now: i64) {
        self.graph.reset(now);
        self.last_seen.clear();
        self.suppressed.clear();
    }

    fn suppress(&mut self, myself: &ActorRef<ActivationMsg>, key: SuppressionKey) {
        let token = self.suppressed.register(key.clone());
        let _ = myself.send_after(self.suppression_timeout, move || {
            ActivationMsg::ExpireSuppression { key, token }
        });
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Placeholder shown for a specialist the supervisor is expected to call.
pub fn placeholder_group(node: AgentNodeId, now: i64) -> TraceGroup {
    let mut group = TraceGroup::new(node, node.display_name(), now);
    group.tasks.push(Task {
        step_number: 1,
        title: PLACEHOLDER_TASK_TITLE.to_string(),
        content: json!(PLACEHOLDER_TASK_CONTENT),
        raw_payload: None,
        timestamp: now,
        sub_tasks: Vec::new(),
    });
    group
}

fn relay_trace_updates(event: BusEvent) -> Option<ActivationMsg> {
    match event.payload {
        BusPayload::TraceUpdated(update) => Some(ActivationMsg::TraceUpdated {
            update,
            suppression: event.suppression,
        }),
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct ActivationControllerActor;

#[async_trait]
impl Actor for ActivationControllerActor {
    type Msg = ActivationMsg;
    type State = ActivationState;
    type Arguments = ActivationArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(actor_id = %myself.get_id(), "ActivationControllerActor starting");
        let mut graph = ActivationGraph::default();
        graph.reset(now_ms());
        Ok(ActivationState {
            event_bus: args.event_bus,
            store: args.store,
            ingest: args.ingest,
            suppression_timeout: args.suppression_timeout,
            graph,
            last_seen: HashMap::new(),
            suppressed: SuppressionTable::default(),
        })
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        subscribe_relay(
            &state.event_bus,
            &[Topic::TraceUpdated],
            &myself,
            relay_trace_updates,
        )
        .await?;
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ActivationMsg::TraceUpdated {
                update,
                suppression,
            } => {
                if let Some(key) = suppression {
                    if state.suppressed.consume(&key) {
                        tracing::debug!(
                            node_id = %key.node_id,
                            trace_group_id = %key.trace_group_id,
                            "Discarding notification of own write"
                        );
                        state.last_seen.insert(update.node_id, update.fingerprint);
                        return Ok(());
                    }
                }
                self.observe(&myself, update.node_id, update.trace_group, update.fingerprint, state)
                    .await;
            }
            ActivationMsg::Reconcile { records } => {
                for record in records {
                    let node = record.trace_group.agent_id;
                    let seen = fingerprint(node, &record.trace_group);
                    if state.last_seen.get(&node) == Some(&seen) {
                        continue;
                    }
                    tracing::debug!(node_id = %node, "Poll picked up an unseen trace update");
                    let group = record.trace_group.clone();
                    if let Err(e) = state.store.cast(TraceStoreMsg::Backfill { record }) {
                        tracing::warn!(error = %e, "Failed to backfill tier 1");
                    }
                    self.observe(&myself, node, group, seen, state).await;
                }
            }
            ActivationMsg::Select { node, reply } => {
                let group = match read_trace(&state.store, node).await {
                    Ok(group) => group.map(|g| prepare_for_display(&g)),
                    Err(e) => {
                        tracing::warn!(node_id = %node, error = %e, "Select could not read store");
                        None
                    }
                };
                let event = BusEvent::new(
                    BusPayload::NodeSelected {
                        node_id: node,
                        trace_group: group.clone(),
                    },
                    "activation_controller",
                );
                if let Err(e) = publish_event(&state.event_bus, event).await {
                    tracing::warn!(error = %e, "Failed to publish node selection");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(group);
                }
            }
            ActivationMsg::Reset { reply } => {
                state.reset(now_ms());
                tracing::info!("Activation state reset");
                let event = BusEvent::new(BusPayload::Reset, "activation_controller");
                if let Err(e) = publish_event(&state.event_bus, event).await {
                    tracing::warn!(error = %e, "Failed to publish reset");
                }
                self.publish_snapshot(state).await;
                let _ = reply.send(());
            }
            ActivationMsg::GetSnapshot { reply } => {
                let _ = reply.send(state.graph.snapshot());
            }
            ActivationMsg::Suppress { key } => {
                state.suppress(&myself, key);
            }
            ActivationMsg::ExpireSuppression { key, token } => {
                if state.suppressed.expire(&key, token) {
                    tracing::debug!(node_id = %key.node_id, "Suppression key expired unused");
                }
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        _state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!(actor_id = %myself.get_id(), "ActivationControllerActor stopped");
        Ok(())
    }
}

impl ActivationControllerActor {
    async fn observe(
        &self,
        myself: &ActorRef<ActivationMsg>,
        node: AgentNodeId,
        group: TraceGroup,
        seen: String,
        state: &mut ActivationState,
    ) {
        if state.last_seen.get(&node) == Some(&seen) {
            return;
        }
        state.last_seen.insert(node, seen);

        let now = now_ms();
        let started = state.graph.start_processing(node, Some(&group.id), now);
        if started {
            // A group that is already complete passes through processing.
            self.publish_snapshot(state).await;
        }
        if group.is_complete && state.graph.complete(node, &group.id, now) {
            self.publish_snapshot(state).await;
        } else if !started {
            state.graph.attach_group(node, &group.id, now);
        }

        if started && node == AgentNodeId::Supervisor && !group.is_complete {
            self.fan_out(myself, now, state).await;
        }
    }

    /// Move the four specialists to processing and seed placeholders for the
    /// ones without a trace yet.
    async fn fan_out(&self, myself: &ActorRef<ActivationMsg>, now: i64, state: &mut ActivationState) {
        let mut changed = false;
        for node in AgentNodeId::SUB_AGENTS {
            let has_group = state.graph.trace_group_id(node).is_some();

            let placeholder = (!has_group).then(|| placeholder_group(node, now));
            let group_id = placeholder.as_ref().map(|g| g.id.clone());
            changed |= state.graph.start_processing(node, group_id.as_deref(), now);

            if let Some(group) = placeholder {
                let key = SuppressionKey::new(node, group.id.clone());
                state.suppress(myself, key.clone());
                if let Err(e) = state.ingest.cast(TraceIngestMsg::Seed { group, origin: key }) {
                    tracing::warn!(node_id = %node, error = %e, "Failed to seed placeholder");
                }
            }
        }
        tracing::debug!(fanned_out = changed, "Supervisor fan-out");
        if changed {
            self.publish_snapshot(state).await;
        }
    }

    async fn publish_snapshot(&self, state: &ActivationState) {
        let event = BusEvent::new(
            BusPayload::ActivationChanged(state.graph.snapshot()),
            "activation_controller",
        );
        if let Err(e) = publish_event(&state.event_bus, event).await {
            tracing::warn!(error = %e, "Failed to publish activation change");
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

pub async fn get_snapshot(
    controller: &ActorRef<ActivationMsg>,
) -> Result<ActivationSnapshot, ractor::RactorErr<ActivationMsg>> {
    ractor::call!(controller, |reply| ActivationMsg::GetSnapshot { reply })
}

pub async fn select_node(
    controller: &ActorRef<ActivationMsg>,
    node: AgentNodeId,
) -> Result<Option<TraceGroup>, ractor::RactorErr<ActivationMsg>> {
    ractor::call!(controller, |reply| ActivationMsg::Select {
        node,
        reply: Some(reply),
    })
}

pub async fn reset_activation(
    controller: &ActorRef<ActivationMsg>,
) -> Result<(), ractor::RactorErr<ActivationMsg>> {
    ractor::call!(controller, |reply| ActivationMsg::Reset { reply })
}
