//! TraceStoreActor - two-tier per-node trace cache with change notification
//!
//! Tier 1 is an in-process map and answers every read it can. Tier 2 is a
//! [`DurableTier`] that only has to survive an in-session [`reload`]; it is
//! wiped when the actor starts.
//!
//! Writes go through both tiers. A write whose fingerprint
//! `sha256(node | group id | lastUpdateTime)` equals the last one announced for
//! that node is stored but not announced again. Announcements are `cast` to the
//! event bus and so always run after the write has returned.
//!
//! If the durable tier fails, the write still lands in tier 1 and the store
//! carries on in degraded, memory-only mode.

pub mod durable;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use sha2::{Digest, Sha256};
use shared_types::{AgentNodeId, PersistedTrace, SuppressionKey, TraceGroup};
use thiserror::Error;

use crate::actors::event_bus::{
    publish_event, subscribe, unsubscribe, BusEvent, BusPayload, EventBusMsg, Topic, TraceUpdate,
};
pub use durable::{DurableTier, DurableTierError, MemoryTier, SqliteTier};

#[derive(Debug, Error)]
pub enum TraceStoreError {
    #[error(transparent)]
    Durable(#[from] DurableTierError),

    #[error("durable tier task failed: {0}")]
    Join(String),

    #[error("trace store unavailable: {0}")]
    Unavailable(String),
}

/// Content fingerprint of a group as seen by change notification.
pub fn fingerprint(node: AgentNodeId, group: &TraceGroup) -> String {
    let mut hasher = Sha256::new();
    hasher.update(node.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(group.id.as_bytes());
    hasher.update(b"|");
    hasher.update(group.last_update_time.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearScope {
    Node(AgentNodeId),
    All,
    /// Records written with this session id
    Session(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub fingerprint: String,
    /// False when the fingerprint matched the last announcement
    pub notified: bool,
    /// False when the durable tier rejected the write
    pub durable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStatus {
    pub degraded: bool,
    pub cached_nodes: Vec<AgentNodeId>,
}

/// Messages handled by TraceStoreActor
#[derive(Debug)]
pub enum TraceStoreMsg {
    Write {
        group: TraceGroup,
        session_id: Option<String>,
        /// Set when the activation controller caused this write
        origin: Option<SuppressionKey>,
        reply: RpcReplyPort<WriteOutcome>,
    },
    Read {
        node: AgentNodeId,
        reply: RpcReplyPort<Option<TraceGroup>>,
    },
    ReadAll {
        reply: RpcReplyPort<BTreeMap<AgentNodeId, TraceGroup>>,
    },
    /// Raw durable records, bypassing tier 1 (poll fallback)
    ReadDurable {
        reply: RpcReplyPort<Result<Vec<PersistedTrace>, TraceStoreError>>,
    },
    /// Refresh tier 1 from a durable record that is newer than the cached
    /// group. Never announced.
    Backfill { record: PersistedTrace },
    Clear {
        scope: ClearScope,
        reply: RpcReplyPort<()>,
    },
    /// Drop tier 1; later reads backfill from tier 2
    Reload { reply: RpcReplyPort<()> },
    GetStatus { reply: RpcReplyPort<StoreStatus> },
}

// ============================================================================
// Actor
// ============================================================================

/// Which durable tier to open
pub enum DurableTierArgs {
    /// SQLite file path, or `":memory:"`
    Sqlite(String),
    Memory(MemoryTier),
    Custom(Box<dyn DurableTier>),
}

pub struct TraceStoreArguments {
    pub event_bus: ActorRef<EventBusMsg>,
    pub durable: DurableTierArgs,
}

#[derive(Debug, Clone)]
struct CachedTrace {
    group: TraceGroup,
    session_id: Option<String>,
}

pub struct TraceStoreState {
    event_bus: ActorRef<EventBusMsg>,
    volatile: HashMap<AgentNodeId, CachedTrace>,
    /// Thread-safe handle shared with `spawn_blocking` closures.
    durable: Arc<Mutex<Box<dyn DurableTier>>>,
    last_announced: HashMap<AgentNodeId, String>,
    degraded: bool,
}

#[derive(Debug, Default)]
pub struct TraceStoreActor;

#[async_trait]
impl Actor for TraceStoreActor {
    type Msg = TraceStoreMsg;
    type State = TraceStoreState;
    type Arguments = TraceStoreArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let tier_name = match &args.durable {
            DurableTierArgs::Sqlite(path) => format!("sqlite:{path}"),
            DurableTierArgs::Memory(_) => "memory".to_string(),
            DurableTierArgs::Custom(_) => "custom".to_string(),
        };

        let mut degraded = false;
        let durable: Box<dyn DurableTier> = match args.durable {
            DurableTierArgs::Sqlite(path) => {
                let opened = tokio::task::spawn_blocking(move || SqliteTier::open(&path))
                    .await
                    .map_err(|e| format!("spawn_blocking panicked: {e}"))?;
                match opened {
                    Ok(tier) => Box::new(tier),
                    Err(e) => {
                        tracing::warn!(durable = %tier_name, error = %e, "Durable tier unavailable; running memory-only");
                        degraded = true;
                        Box::new(MemoryTier::new())
                    }
                }
            }
            DurableTierArgs::Memory(tier) => Box::new(tier),
            DurableTierArgs::Custom(tier) => tier,
        };

        let mut state = TraceStoreState {
            event_bus: args.event_bus,
            volatile: HashMap::new(),
            durable: Arc::new(Mutex::new(durable)),
            last_announced: HashMap::new(),
            degraded,
        };

        // Per-conversation cache: nothing from an earlier process survives.
        if let Err(e) = with_durable(&state.durable, |tier| tier.clear()).await {
            tracing::warn!(error = %e, "Durable tier could not be wiped; running memory-only");
            state.degraded = true;
        }

        tracing::info!(
            actor_id = %myself.get_id(),
            durable = %tier_name,
            "TraceStoreActor started"
        );
        Ok(state)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            TraceStoreMsg::Write {
                group,
                session_id,
                origin,
                reply,
            } => {
                let outcome = self.handle_write(group, session_id, origin, state).await;
                let _ = reply.send(outcome);
            }
            TraceStoreMsg::Read { node, reply } => {
                let group = self.read_through(node, state).await;
                let _ = reply.send(group);
            }
            TraceStoreMsg::ReadAll { reply } => {
                let mut all = BTreeMap::new();
                for node in AgentNodeId::ALL {
                    if let Some(group) = self.read_through(node, state).await {
                        all.insert(node, group);
                    }
                }
                let _ = reply.send(all);
            }
            TraceStoreMsg::ReadDurable { reply } => {
                let records = with_durable(&state.durable, |tier| tier.load_all()).await;
                if records.is_err() {
                    state.degraded = true;
                }
                let _ = reply.send(records);
            }
            TraceStoreMsg::Backfill { record } => {
                let node = record.trace_group.agent_id;
                let newer = state
                    .volatile
                    .get(&node)
                    .map(|cached| {
                        cached.group.id != record.trace_group.id
                            || cached.group.last_update_time < record.trace_group.last_update_time
                    })
                    .unwrap_or(true);
                if newer {
                    tracing::debug!(node_id = %node, "Backfilling tier 1 from durable record");
                    state.volatile.insert(
                        node,
                        CachedTrace {
                            group: record.trace_group,
                            session_id: record.session_id,
                        },
                    );
                }
            }
            TraceStoreMsg::Clear { scope, reply } => {
                self.handle_clear(scope, state).await;
                let _ = reply.send(());
            }
            TraceStoreMsg::Reload { reply } => {
                tracing::info!(cached = state.volatile.len(), "Dropping tier 1");
                state.volatile.clear();
                let _ = reply.send(());
            }
            TraceStoreMsg::GetStatus { reply } => {
                let mut cached_nodes: Vec<_> = state.volatile.keys().copied().collect();
                cached_nodes.sort();
                let _ = reply.send(StoreStatus {
                    degraded: state.degraded,
                    cached_nodes,
                });
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            degraded = state.degraded,
            "TraceStoreActor stopped"
        );
        Ok(())
    }
}

impl TraceStoreActor {
    async fn handle_write(
        &self,
        group: TraceGroup,
        session_id: Option<String>,
        origin: Option<SuppressionKey>,
        state: &mut TraceStoreState,
    ) -> WriteOutcome {
        let node = group.agent_id;
        let fingerprint = fingerprint(node, &group);

        state.volatile.insert(
            node,
            CachedTrace {
                group: group.clone(),
                session_id: session_id.clone(),
            },
        );

        let record = PersistedTrace {
            trace_group: group.clone(),
            last_updated: chrono::Utc::now().timestamp_millis(),
            session_id,
            is_complete: group.is_complete,
        };
        let durable = match with_durable(&state.durable, move |tier| tier.put(&record)).await {
            Ok(()) => true,
            Err(e) => {
                if !state.degraded {
                    tracing::warn!(
                        node_id = %node,
                        error = %e,
                        "Durable tier write failed; continuing memory-only"
                    );
                }
                state.degraded = true;
                false
            }
        };

        if state.last_announced.get(&node) == Some(&fingerprint) {
            tracing::debug!(
                node_id = %node,
                fingerprint = %fingerprint,
                "Duplicate write; notification suppressed"
            );
            return WriteOutcome {
                fingerprint,
                notified: false,
                durable,
            };
        }
        state.last_announced.insert(node, fingerprint.clone());

        let event = BusEvent::new(
            BusPayload::TraceUpdated(TraceUpdate {
                node_id: node,
                trace_group: group,
                fingerprint: fingerprint.clone(),
            }),
            "trace_store",
        )
        .with_suppression(origin);

        let notified = match publish_event(&state.event_bus, event).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(node_id = %node, error = %e, "Failed to publish trace update");
                false
            }
        };

        tracing::debug!(
            node_id = %node,
            fingerprint = %fingerprint,
            durable,
            "Trace group written"
        );

        WriteOutcome {
            fingerprint,
            notified,
            durable,
        }
    }

    async fn read_through(
        &self,
        node: AgentNodeId,
        state: &mut TraceStoreState,
    ) -> Option<TraceGroup> {
        if let Some(cached) = state.volatile.get(&node) {
            return Some(cached.group.clone());
        }

        match with_durable(&state.durable, move |tier| tier.get(node)).await {
            Ok(Some(record)) => {
                tracing::debug!(node_id = %node, "Tier 1 miss; backfilled from durable tier");
                let group = record.trace_group.clone();
                state.volatile.insert(
                    node,
                    CachedTrace {
                        group: record.trace_group,
                        session_id: record.session_id,
                    },
                );
                Some(group)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(node_id = %node, error = %e, "Durable tier read failed");
                state.degraded = true;
                None
            }
        }
    }

    async fn handle_clear(&self, scope: ClearScope, state: &mut TraceStoreState) {
        let nodes: Vec<AgentNodeId> = match &scope {
            ClearScope::Node(node) => vec![*node],
            ClearScope::All => AgentNodeId::ALL.to_vec(),
            ClearScope::Session(session_id) => {
                let mut nodes: Vec<AgentNodeId> = state
                    .volatile
                    .iter()
                    .filter(|(_, cached)| cached.session_id.as_deref() == Some(session_id))
                    .map(|(node, _)| *node)
                    .collect();
                match with_durable(&state.durable, |tier| tier.load_all()).await {
                    Ok(records) => nodes.extend(
                        records
                            .into_iter()
                            .filter(|r| r.session_id.as_deref() == Some(session_id))
                            .map(|r| r.trace_group.agent_id),
                    ),
                    Err(e) => {
                        tracing::warn!(error = %e, "Durable tier scan failed during clear");
                        state.degraded = true;
                    }
                }
                nodes.sort();
                nodes.dedup();
                nodes
            }
        };

        for node in &nodes {
            state.volatile.remove(node);
            state.last_announced.remove(node);
        }

        let result = match scope {
            ClearScope::All => with_durable(&state.durable, |tier| tier.clear()).await,
            _ => {
                with_durable(&state.durable, move |tier| {
                    nodes.iter().try_for_each(|node| tier.remove(*node))
                })
                .await
            }
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "Durable tier clear failed");
            state.degraded = true;
        }
    }
}

/// Run a closure against the durable tier on the blocking pool.
async fn with_durable<T, F>(
    durable: &Arc<Mutex<Box<dyn DurableTier>>>,
    f: F,
) -> Result<T, TraceStoreError>
where
    T: Send + 'static,
    F: FnOnce(&mut (dyn DurableTier + 'static)) -> Result<T, DurableTierError> + Send + 'static,
{
    let durable = durable.clone();
    tokio::task::spawn_blocking(move || {
        let mut guard = durable
            .lock()
            .map_err(|e| TraceStoreError::Unavailable(e.to_string()))?;
        f(&mut **guard).map_err(TraceStoreError::from)
    })
    .await
    .map_err(|e| TraceStoreError::Join(e.to_string()))?
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Convenience function to write a group
pub async fn write_trace(
    store: &ActorRef<TraceStoreMsg>,
    group: TraceGroup,
    session_id: Option<String>,
    origin: Option<SuppressionKey>,
) -> Result<WriteOutcome, ractor::RactorErr<TraceStoreMsg>> {
    ractor::call!(store, |reply| TraceStoreMsg::Write {
        group,
        session_id,
        origin,
        reply,
    })
}

/// Convenience function to read one node's group
pub async fn read_trace(
    store: &ActorRef<TraceStoreMsg>,
    node: AgentNodeId,
) -> Result<Option<TraceGroup>, ractor::RactorErr<TraceStoreMsg>> {
    ractor::call!(store, |reply| TraceStoreMsg::Read { node, reply })
}

/// Convenience function to read every node's group
pub async fn read_all_traces(
    store: &ActorRef<TraceStoreMsg>,
) -> Result<BTreeMap<AgentNodeId, TraceGroup>, ractor::RactorErr<TraceStoreMsg>> {
    ractor::call!(store, |reply| TraceStoreMsg::ReadAll { reply })
}

/// Convenience function to read the durable tier directly
pub async fn read_durable(
    store: &ActorRef<TraceStoreMsg>,
) -> Result<Result<Vec<PersistedTrace>, TraceStoreError>, ractor::RactorErr<TraceStoreMsg>> {
    ractor::call!(store, |reply| TraceStoreMsg::ReadDurable { reply })
}

/// Convenience function to clear part of the store
pub async fn clear_traces(
    store: &ActorRef<TraceStoreMsg>,
    scope: ClearScope,
) -> Result<(), ractor::RactorErr<TraceStoreMsg>> {
    ractor::call!(store, |reply| TraceStoreMsg::Clear { scope, reply })
}

/// Convenience function to drop tier 1
pub async fn reload(store: &ActorRef<TraceStoreMsg>) -> Result<(), ractor::RactorErr<TraceStoreMsg>> {
    ractor::call!(store, |reply| TraceStoreMsg::Reload { reply })
}

pub async fn store_status(
    store: &ActorRef<TraceStoreMsg>,
) -> Result<StoreStatus, ractor::RactorErr<TraceStoreMsg>> {
    ractor::call!(store, |reply| TraceStoreMsg::GetStatus { reply })
}

/// Register a change listener. Undo with [`off_change`].
pub async fn on_change(
    event_bus: &ActorRef<EventBusMsg>,
    listener: ActorRef<BusEvent>,
) -> Result<(), ractor::RactorErr<EventBusMsg>> {
    subscribe(event_bus, Topic::TraceUpdated, listener).await
}

pub async fn off_change(
    event_bus: &ActorRef<EventBusMsg>,
    listener: ActorRef<BusEvent>,
) -> Result<(), ractor::RactorErr<EventBusMsg>> {
    unsubscribe(event_bus, Topic::TraceUpdated, listener).await
}

// ============================================================================
// Tests
// ============================================================================
