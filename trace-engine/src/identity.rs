//! Identity resolution: free-form agent labels to canonical graph nodes.
//!
//! Upstream traces name agents inconsistently ("OrderManagementAgent",
//! "ORDER_MGMT", "order-mgmt-collaborator", ...). Resolution is total: a label
//! that matches nothing lands on the supervisor node.

use shared_types::AgentNodeId;

const ROUTING_CLASSIFIER_LABELS: [&str; 3] =
    ["ROUTING_CLASSIFIER", "routing_classifier", "RoutingClassifier"];

const SUPERVISOR_LABELS: [&str; 4] = ["Supervisor", "SupervisorAgent", "SUPERVISOR", "Unknown"];

/// Substring rules, checked in order. The classifier rule must stay ahead of
/// the supervisor rule so "SuperClassifier" lands on the classifier.
const SUBSTRING_RULES: [(&[&str], AgentNodeId); 6] = [
    (&["order"], AgentNodeId::OrderMgmt),
    (&["product"], AgentNodeId::ProductRec),
    (&["personal"], AgentNodeId::Personalization),
    (&["trouble"], AgentNodeId::Troubleshoot),
    (&["rout", "class"], AgentNodeId::RoutingClassifier),
    (&["super"], AgentNodeId::Supervisor),
];

/// Resolve a free-form agent label to its graph node.
pub fn resolve(identifier: &str) -> AgentNodeId {
    if ROUTING_CLASSIFIER_LABELS.contains(&identifier) {
        return AgentNodeId::RoutingClassifier;
    }
    if SUPERVISOR_LABELS.contains(&identifier) {
        return AgentNodeId::Supervisor;
    }

    let lowered = identifier.to_lowercase();
    SUBSTRING_RULES
        .iter()
        .find(|(needles, _)| needles.iter().any(|needle| lowered.contains(needle)))
        .map(|(_, node)| *node)
        .unwrap_or(AgentNodeId::Supervisor)
}

/// Resolve an optional label; a missing label is the supervisor.
pub fn resolve_opt(identifier: Option<&str>) -> AgentNodeId {
    identifier.map(resolve).unwrap_or(AgentNodeId::Supervisor)
}
