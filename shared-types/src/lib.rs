//! Shared types between the trace engine and the flow view
//!
//! These types are used by both:
//! - the trace-engine actors (native Rust)
//! - the external flow view, through the generated TypeScript bindings
//!
//! Serializable with serde; field names follow the camelCase layout the
//! durable trace cache has always used.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ts_rs::TS;

// ============================================================================
// Graph Nodes
// ============================================================================

/// Canonical node of the agent flow graph.
///
/// Every free-form agent label resolves to exactly one of these.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, TS,
)]
#[serde(rename_all = "kebab-case")]
#[ts(export, export_to = "flow-view.ts")]
pub enum AgentNodeId {
    Supervisor,
    RoutingClassifier,
    OrderMgmt,
    ProductRec,
    Personalization,
    Troubleshoot,
    Customer,
}

impl AgentNodeId {
    pub const ALL: [AgentNodeId; 7] = [
        AgentNodeId::Supervisor,
        AgentNodeId::RoutingClassifier,
        AgentNodeId::OrderMgmt,
        AgentNodeId::ProductRec,
        AgentNodeId::Personalization,
        AgentNodeId::Troubleshoot,
        AgentNodeId::Customer,
    ];

    /// Specialist agents the supervisor delegates to directly.
    pub const SUB_AGENTS: [AgentNodeId; 4] = [
        AgentNodeId::OrderMgmt,
        AgentNodeId::ProductRec,
        AgentNodeId::Personalization,
        AgentNodeId::Troubleshoot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentNodeId::Supervisor => "supervisor",
            AgentNodeId::RoutingClassifier => "routing-classifier",
            AgentNodeId::OrderMgmt => "order-mgmt",
            AgentNodeId::ProductRec => "product-rec",
            AgentNodeId::Personalization => "personalization",
            AgentNodeId::Troubleshoot => "troubleshoot",
            AgentNodeId::Customer => "customer",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            AgentNodeId::Supervisor => "Supervisor Agent",
            AgentNodeId::RoutingClassifier => "Routing Classifier",
            AgentNodeId::OrderMgmt => "Order Management",
            AgentNodeId::ProductRec => "Product Recommendation",
            AgentNodeId::Personalization => "Personalization",
            AgentNodeId::Troubleshoot => "Troubleshooting",
            AgentNodeId::Customer => "Customer",
        }
    }

    pub fn is_sub_agent(&self) -> bool {
        Self::SUB_AGENTS.contains(self)
    }
}

impl fmt::Display for AgentNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownNodeId(pub String);

impl fmt::Display for UnknownNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown agent node id: {}", self.0)
    }
}

impl std::error::Error for UnknownNodeId {}

impl FromStr for AgentNodeId {
    type Err = UnknownNodeId;

    /// Parses the literal node-id string used as the durable cache key.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentNodeId::ALL
            .into_iter()
            .find(|node| node.as_str() == s)
            .ok_or_else(|| UnknownNodeId(s.to_string()))
    }
}

// ============================================================================
// Graph Edges
// ============================================================================

/// Fixed edges of the flow graph. Ids match the ones the flow view renders.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, TS,
)]
#[ts(export, export_to = "flow-view.ts")]
pub enum EdgeId {
    #[serde(rename = "e-customer-supervisor")]
    CustomerSupervisor,
    #[serde(rename = "e-routing-classifier-supervisor")]
    RoutingClassifierSupervisor,
    #[serde(rename = "e-supervisor-sa1")]
    SupervisorOrderMgmt,
    #[serde(rename = "e-supervisor-sa2")]
    SupervisorProductRec,
    #[serde(rename = "e-supervisor-sa3")]
    SupervisorPersonalization,
    #[serde(rename = "e-supervisor-sa4")]
    SupervisorTroubleshoot,
}

impl EdgeId {
    pub const ALL: [EdgeId; 6] = [
        EdgeId::CustomerSupervisor,
        EdgeId::RoutingClassifierSupervisor,
        EdgeId::SupervisorOrderMgmt,
        EdgeId::SupervisorProductRec,
        EdgeId::SupervisorPersonalization,
        EdgeId::SupervisorTroubleshoot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeId::CustomerSupervisor => "e-customer-supervisor",
            EdgeId::RoutingClassifierSupervisor => "e-routing-classifier-supervisor",
            EdgeId::SupervisorOrderMgmt => "e-supervisor-sa1",
            EdgeId::SupervisorProductRec => "e-supervisor-sa2",
            EdgeId::SupervisorPersonalization => "e-supervisor-sa3",
            EdgeId::SupervisorTroubleshoot => "e-supervisor-sa4",
        }
    }

    pub fn endpoints(&self) -> (AgentNodeId, AgentNodeId) {
        match self {
            EdgeId::CustomerSupervisor => (AgentNodeId::Customer, AgentNodeId::Supervisor),
            EdgeId::RoutingClassifierSupervisor => {
                (AgentNodeId::RoutingClassifier, AgentNodeId::Supervisor)
            }
            EdgeId::SupervisorOrderMgmt => (AgentNodeId::Supervisor, AgentNodeId::OrderMgmt),
            EdgeId::SupervisorProductRec => (AgentNodeId::Supervisor, AgentNodeId::ProductRec),
            EdgeId::SupervisorPersonalization => {
                (AgentNodeId::Supervisor, AgentNodeId::Personalization)
            }
            EdgeId::SupervisorTroubleshoot => {
                (AgentNodeId::Supervisor, AgentNodeId::Troubleshoot)
            }
        }
    }

    pub fn touches(&self, node: AgentNodeId) -> bool {
        let (a, b) = self.endpoints();
        a == node || b == node
    }

    /// All edges with `node` as one endpoint.
    pub fn touching(node: AgentNodeId) -> impl Iterator<Item = EdgeId> {
        Self::ALL.into_iter().filter(move |edge| edge.touches(node))
    }

    /// The supervisor edge leading to a specialist agent.
    pub fn for_sub_agent(node: AgentNodeId) -> Option<EdgeId> {
        match node {
            AgentNodeId::OrderMgmt => Some(EdgeId::SupervisorOrderMgmt),
            AgentNodeId::ProductRec => Some(EdgeId::SupervisorProductRec),
            AgentNodeId::Personalization => Some(EdgeId::SupervisorPersonalization),
            AgentNodeId::Troubleshoot => Some(EdgeId::SupervisorTroubleshoot),
            _ => None,
        }
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Trace Fragments
// ============================================================================

/// Kind of upstream execution step a fragment describes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum StepKind {
    ModelInput,
    ModelOutput,
    Rationale,
    KnowledgeBaseQuery,
    KnowledgeBaseResult,
    ActionGroupInput,
    ActionGroupOutput,
    FinalResponse,
    #[default]
    Unknown,
}

/// One raw, possibly partial unit of trace data from the upstream pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TraceFragment {
    /// Free-form agent label; empty when the upstream omitted it
    #[serde(default)]
    pub agent_identifier: String,

    #[serde(default)]
    pub step_kind: StepKind,

    /// Text or structured payload
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Milliseconds since the Unix epoch
    pub timestamp: i64,

    #[serde(default)]
    pub explicit_complete: bool,

    /// Upstream-supplied step title, e.g. "Step 1 (1.2 seconds)"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_number: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Full upstream JSON the fragment was extracted from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl TraceFragment {
    pub fn new(
        agent_identifier: impl Into<String>,
        step_kind: StepKind,
        payload: impl Into<serde_json::Value>,
        timestamp: i64,
    ) -> Self {
        Self {
            agent_identifier: agent_identifier.into(),
            step_kind,
            payload: payload.into(),
            timestamp,
            explicit_complete: false,
            title: None,
            step_number: None,
            session_id: None,
            raw: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_step_number(mut self, step_number: u32) -> Self {
        self.step_number = Some(step_number);
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn completed(mut self) -> Self {
        self.explicit_complete = true;
        self
    }
}

// ============================================================================
// Trace Groups
// ============================================================================

/// Nested step inside a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "flow-view.ts")]
pub struct SubTask {
    pub title: String,
    #[ts(type = "unknown")]
    pub content: serde_json::Value,
    pub timestamp: i64,
}

/// Normalized step within a trace group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "flow-view.ts")]
pub struct Task {
    /// 1-based ordinal; 0 means unordered
    pub step_number: u32,
    pub title: String,
    #[ts(type = "unknown")]
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(type = "unknown")]
    pub raw_payload: Option<serde_json::Value>,
    pub timestamp: i64,
    #[serde(default)]
    pub sub_tasks: Vec<SubTask>,
}

/// Accumulated execution history of one graph node within a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "flow-view.ts")]
pub struct TraceGroup {
    pub id: String,
    pub agent_id: AgentNodeId,
    /// Last free-form label seen for this node
    pub original_agent_type: String,
    pub tasks: Vec<Task>,
    pub start_time: i64,
    pub last_update_time: i64,
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_elapsed_time: Option<String>,
}

impl TraceGroup {
    pub fn new(agent_id: AgentNodeId, original_agent_type: impl Into<String>, now_ms: i64) -> Self {
        Self {
            id: format!("trace-{}-{}", agent_id, ulid::Ulid::new()),
            agent_id,
            original_agent_type: original_agent_type.into(),
            tasks: Vec::new(),
            start_time: now_ms,
            last_update_time: now_ms,
            is_complete: false,
            final_elapsed_time: None,
        }
    }

    pub fn task(&self, title: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.title == title)
    }
}

/// Value stored in the durable tier under the literal node-id key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedTrace {
    pub trace_group: TraceGroup,
    pub last_updated: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub is_complete: bool,
}

// ============================================================================
// Activation State
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "flow-view.ts")]
pub enum NodeState {
    Idle,
    Processing,
    Complete,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "flow-view.ts")]
pub enum EdgeState {
    Inactive,
    Active,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "flow-view.ts")]
pub struct NodeActivation {
    pub node: AgentNodeId,
    pub state: NodeState,
    /// Trace group that drove the latest transition
    pub trace_group_id: Option<String>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "flow-view.ts")]
pub struct EdgeActivation {
    pub edge: EdgeId,
    pub state: EdgeState,
    /// Never decreases, not even across conversation resets
    pub call_count: u32,
    pub last_activated_at: Option<i64>,
}

/// Everything the flow view needs to draw the graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "flow-view.ts")]
pub struct ActivationSnapshot {
    pub nodes: Vec<NodeActivation>,
    pub edges: Vec<EdgeActivation>,
    pub conversation_complete: bool,
}

impl ActivationSnapshot {
    pub fn node_state(&self, node: AgentNodeId) -> NodeState {
        self.nodes
            .iter()
            .find(|n| n.node == node)
            .map(|n| n.state)
            .unwrap_or(NodeState::Idle)
    }

    pub fn edge(&self, edge: EdgeId) -> Option<&EdgeActivation> {
        self.edges.iter().find(|e| e.edge == edge)
    }

    pub fn processing_nodes(&self) -> Vec<AgentNodeId> {
        self.nodes
            .iter()
            .filter(|n| n.state == NodeState::Processing)
            .map(|n| n.node)
            .collect()
    }

    pub fn active_edges(&self) -> Vec<EdgeId> {
        self.edges
            .iter()
            .filter(|e| e.state == EdgeState::Active)
            .map(|e| e.edge)
            .collect()
    }
}

/// Marks a write the activation controller caused itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct SuppressionKey {
    pub node_id: AgentNodeId,
    pub trace_group_id: String,
}

impl SuppressionKey {
    pub fn new(node_id: AgentNodeId, trace_group_id: impl Into<String>) -> Self {
        Self {
            node_id,
            trace_group_id: trace_group_id.into(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_serialization() {
        let json = serde_json::to_string(&AgentNodeId::RoutingClassifier).unwrap();
        assert_eq!(json, "\"routing-classifier\"");
        let parsed: AgentNodeId = serde_json::from_str("\"order-mgmt\"").unwrap();
        assert_eq!(parsed, AgentNodeId::OrderMgmt);
    }

    #[test]
    fn test_node_id_from_str_matches_as_str() {
        for node in AgentNodeId::ALL {
            assert_eq!(node.as_str().parse::<AgentNodeId>().unwrap(), node);
        }
        assert!("ts-agent".parse::<AgentNodeId>().is_err());
    }

    #[test]
    fn test_sub_agent_edges() {
        for node in AgentNodeId::SUB_AGENTS {
            let edge = EdgeId::for_sub_agent(node).unwrap();
            assert_eq!(edge.endpoints(), (AgentNodeId::Supervisor, node));
        }
        assert_eq!(EdgeId::for_sub_agent(AgentNodeId::Customer), None);
        assert_eq!(EdgeId::touching(AgentNodeId::Supervisor).count(), 6);
        assert_eq!(EdgeId::touching(AgentNodeId::Troubleshoot).count(), 1);
    }

    #[test]
    fn test_edge_id_serialization() {
        let json = serde_json::to_string(&EdgeId::SupervisorTroubleshoot).unwrap();
        assert_eq!(json, "\"e-supervisor-sa4\"");
    }

    #[test]
    fn test_persisted_trace_layout() {
        let group = TraceGroup::new(AgentNodeId::Troubleshoot, "Troubleshoot", 1_000);
        let record = PersistedTrace {
            trace_group: group,
            last_updated: 2_000,
            session_id: Some("session-1".to_string()),
            is_complete: false,
        };

        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("traceGroup").is_some());
        assert_eq!(value["lastUpdated"], 2_000);
        assert_eq!(value["sessionId"], "session-1");
        assert_eq!(value["isComplete"], false);
        assert_eq!(value["traceGroup"]["agentId"], "troubleshoot");
    }

    #[test]
    fn test_fragment_defaults() {
        let fragment: TraceFragment =
            serde_json::from_str(r#"{"timestamp": 5, "payload": "hi"}"#).unwrap();
        assert_eq!(fragment.agent_identifier, "");
        assert_eq!(fragment.step_kind, StepKind::Unknown);
        assert!(!fragment.explicit_complete);
    }
}
