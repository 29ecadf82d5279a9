//! TraceIngestActor - the single merge entry point
//!
//! Push deliveries, socket frames and direct calls all land here. The actor
//! handles one message at a time, so fragments for a node are merged in arrival
//! order and every merge sees the result of the previous one.

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde_json::Value;
use shared_types::{AgentNodeId, SuppressionKey, TraceFragment, TraceGroup};

use crate::actors::trace_store::{read_trace, write_trace, TraceStoreMsg};
use crate::envelope;
use crate::error::EngineError;
use crate::merger::TraceMerger;

/// What one fragment did to its node's group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub node_id: AgentNodeId,
    pub trace_group_id: String,
    pub created: bool,
    pub changed: bool,
    pub completed_now: bool,
    /// The store announced the write
    pub notified: bool,
}

#[derive(Debug)]
pub enum TraceIngestMsg {
    Fragment {
        fragment: TraceFragment,
        reply: Option<RpcReplyPort<Result<IngestReport, EngineError>>>,
    },
    /// Raw envelope from a transport handler
    Envelope {
        envelope: Value,
        reply: Option<RpcReplyPort<Result<Vec<IngestReport>, EngineError>>>,
    },
    /// Store a placeholder group unless the node already has one
    Seed {
        group: TraceGroup,
        origin: SuppressionKey,
    },
}

pub struct TraceIngestArguments {
    pub store: ActorRef<TraceStoreMsg>,
    pub merger: TraceMerger,
    /// Attached to writes whose fragment carries no session id
    pub session_id: Option<String>,
}

pub struct TraceIngestState {
    store: ActorRef<TraceStoreMsg>,
    merger: TraceMerger,
    session_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct TraceIngestActor;

#[async_trait]
impl Actor for TraceIngestActor {
    type Msg = TraceIngestMsg;
    type State = TraceIngestState;
    type Arguments = TraceIngestArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(actor_id = %myself.get_id(), "TraceIngestActor starting");
        Ok(TraceIngestState {
            store: args.store,
            merger: args.merger,
            session_id: args.session_id,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            TraceIngestMsg::Fragment { fragment, reply } => {
                let result = self.ingest_fragment(fragment, state).await;
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "Fragment ingest failed");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            TraceIngestMsg::Envelope { envelope, reply } => {
                let result = self.ingest_envelope(&envelope, state).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            TraceIngestMsg::Seed { group, origin } => {
                self.seed(group, origin, state).await;
            }
        }
        Ok(())
    }
}

impl TraceIngestActor {
    async fn ingest_fragment(
        &self,
        fragment: TraceFragment,
        state: &mut TraceIngestState,
    ) -> Result<IngestReport, EngineError> {
        let node = state.merger.node_for(&fragment);
        let existing = read_trace(&state.store, node).await?;
        let outcome = state
            .merger
            .merge(existing, &fragment, chrono::Utc::now().timestamp_millis());

        let mut report = IngestReport {
            node_id: outcome.node_id,
            trace_group_id: outcome.group.id.clone(),
            created: outcome.created,
            changed: outcome.changed,
            completed_now: outcome.completed_now,
            notified: false,
        };

        if !outcome.changed {
            tracing::debug!(node_id = %node, "Fragment already merged; nothing to write");
            return Ok(report);
        }

        let session_id = fragment.session_id.clone().or_else(|| state.session_id.clone());
        let written = write_trace(&state.store, outcome.group, session_id, None).await?;
        report.notified = written.notified;

        tracing::debug!(
            node_id = %node,
            label = %fragment.agent_identifier,
            step_kind = ?fragment.step_kind,
            created = report.created,
            completed = report.completed_now,
            "Fragment merged"
        );
        Ok(report)
    }

    async fn ingest_envelope(
        &self,
        envelope: &Value,
        state: &mut TraceIngestState,
    ) -> Result<Vec<IngestReport>, EngineError> {
        let fragments = match envelope::parse_envelope(envelope, chrono::Utc::now().timestamp_millis())
        {
            Ok(fragments) => fragments,
            Err(e) => {
                // Discarded whole: nothing of a malformed envelope is merged.
                tracing::warn!(error = %e, "Discarding malformed envelope");
                return Err(EngineError::Envelope(e));
            }
        };

        let mut reports = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            match self.ingest_fragment(fragment, state).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::warn!(error = %e, "Fragment ingest failed");
                    return Err(e);
                }
            }
        }
        Ok(reports)
    }

    async fn seed(&self, group: TraceGroup, origin: SuppressionKey, state: &mut TraceIngestState) {
        let node = group.agent_id;
        match read_trace(&state.store, node).await {
            Ok(Some(_)) => {
                tracing::debug!(node_id = %node, "Node already has a trace group; seed skipped");
            }
            Ok(None) => {
                let session_id = state.session_id.clone();
                if let Err(e) = write_trace(&state.store, group, session_id, Some(origin)).await {
                    tracing::warn!(node_id = %node, error = %e, "Seed write failed");
                }
            }
            Err(e) => tracing::warn!(node_id = %node, error = %e, "Seed read failed"),
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Convenience function to merge one fragment and wait for the write
pub async fn ingest_fragment(
    ingest: &ActorRef<TraceIngestMsg>,
    fragment: TraceFragment,
) -> Result<IngestReport, EngineError> {
    ractor::call!(ingest, |reply| TraceIngestMsg::Fragment {
        fragment,
        reply: Some(reply),
    })?
}

/// Convenience function to merge every fragment of an envelope
pub async fn ingest_envelope(
    ingest: &ActorRef<TraceIngestMsg>,
    envelope: Value,
) -> Result<Vec<IngestReport>, EngineError> {
    ractor::call!(ingest, |reply| TraceIngestMsg::Envelope {
        envelope,
        reply: Some(reply),
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::event_bus::{EventBusActor, EventBusArguments};
    use crate::actors::trace_store::{
        read_trace, DurableTierArgs, MemoryTier, TraceStoreActor, TraceStoreArguments,
    };
    use serde_json::json;
    use shared_types::StepKind;

    async fn setup() -> (ActorRef<TraceIngestMsg>, ActorRef<TraceStoreMsg>) {
        let (bus, _) = Actor::spawn(None, EventBusActor, EventBusArguments::default())
            .await
            .unwrap();
        let (store, _) = Actor::spawn(
            None,
            TraceStoreActor,
            TraceStoreArguments {
                event_bus: bus,
                durable: DurableTierArgs::Memory(MemoryTier::new()),
            },
        )
        .await
        .unwrap();
        let (ingest, _) = Actor::spawn(
            None,
            TraceIngestActor,
            TraceIngestArguments {
                store: store.clone(),
                merger: TraceMerger::default(),
                session_id: Some("session-1".into()),
            },
        )
        .await
        .unwrap();
        (ingest, store)
    }

    #[tokio::test]
    async fn test_duplicate_fragment_is_not_rewritten() {
        let (ingest, _store) = setup().await;
        let fragment = TraceFragment::new("ProductRecommendation", StepKind::Rationale, json!("why"), 10);

        let first = ingest_fragment(&ingest, fragment.clone()).await.unwrap();
        let second = ingest_fragment(&ingest, fragment).await.unwrap();

        assert_eq!(first.node_id, AgentNodeId::ProductRec);
        assert!(first.created && first.changed && first.notified);
        assert!(!second.created);
        assert!(!second.changed);
        assert!(!second.notified);
        assert_eq!(first.trace_group_id, second.trace_group_id);
    }

    #[tokio::test]
    async fn test_malformed_envelope_changes_nothing() {
        let (ingest, store) = setup().await;
        let result = ingest_envelope(&ingest, json!({"onUpdateChat": {"trace": "{broken"}})).await;
        assert!(matches!(result, Err(EngineError::Envelope(_))));
        for node in AgentNodeId::ALL {
            assert_eq!(read_trace(&store, node).await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_seed_only_fills_empty_nodes() {
        let (ingest, store) = setup().await;
        let real = ingest_fragment(
            &ingest,
            TraceFragment::new("OrderManagement", StepKind::Rationale, json!("r"), 1),
        )
        .await
        .unwrap();

        for node in [AgentNodeId::OrderMgmt, AgentNodeId::Troubleshoot] {
            let placeholder = TraceGroup::new(node, node.display_name(), 5);
            let key = SuppressionKey::new(node, placeholder.id.clone());
            ractor::cast!(ingest, TraceIngestMsg::Seed { group: placeholder, origin: key }).unwrap();
        }
        // queued behind the seeds
        let again = ingest_fragment(
            &ingest,
            TraceFragment::new("OrderManagement", StepKind::Rationale, json!("r"), 1),
        )
        .await
        .unwrap();
        assert!(!again.changed);

        let order = read_trace(&store, AgentNodeId::OrderMgmt).await.unwrap().unwrap();
        assert_eq!(order.id, real.trace_group_id);
        assert!(read_trace(&store, AgentNodeId::Troubleshoot).await.unwrap().is_some());
    }
}
