//! TraceEngine - explicit construction and teardown of the actor graph
//!
//! ```text
//! transport ──► ConnectionManager ──► TraceIngest ──► TraceStore ──► EventBus
//!                                         ▲               │              │
//!                         fan-out seeds ──┘               │              ▼
//!                                              TracePoller ┴──► ActivationController
//! ```
//!
//! Every component receives the refs it needs at spawn time; nothing is
//! looked up globally. `shutdown` stops the actors in reverse order.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use serde_json::Value;
use shared_types::{ActivationSnapshot, AgentNodeId, TraceFragment, TraceGroup};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::actors::activation::{
    self, ActivationArguments, ActivationControllerActor, ActivationMsg,
};
use crate::actors::connection::{
    self, ConnectionHandle, ConnectionManagerActor, ConnectionManagerArguments,
    ConnectionManagerMsg, HandlerId, InboundMessage, SessionKey, Transport, WebSocketTransport,
    ANY_MESSAGE,
};
use crate::actors::event_bus::{
    self, BusEvent, EventBusActor, EventBusArguments, EventBusMsg, Topic,
};
use crate::actors::ingest::{
    self, IngestReport, TraceIngestActor, TraceIngestArguments, TraceIngestMsg,
};
use crate::actors::poller::{self, TracePollerActor, TracePollerArguments, TracePollerMsg};
use crate::actors::trace_store::{
    self, ClearScope, DurableTierArgs, StoreStatus, TraceStoreActor, TraceStoreArguments,
    TraceStoreMsg,
};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::merger::{CompletionHeuristic, TraceMerger};

pub struct TraceEngine {
    config: EngineConfig,
    event_bus: ActorRef<EventBusMsg>,
    store: ActorRef<TraceStoreMsg>,
    ingest: ActorRef<TraceIngestMsg>,
    controller: ActorRef<ActivationMsg>,
    poller: ActorRef<TracePollerMsg>,
    connections: ActorRef<ConnectionManagerMsg>,
    join_handles: Mutex<Vec<JoinHandle<()>>>,
    envelope_handlers: Mutex<HashMap<String, HandlerId>>,
    watchers: Mutex<Vec<ActorRef<BusEvent>>>,
}

impl TraceEngine {
    /// Start with the durable tier and websocket transport named by `config`.
    pub async fn start(config: EngineConfig) -> Result<Self, EngineError> {
        let durable = DurableTierArgs::Sqlite(config.durable_path.clone());
        let transport = Arc::new(WebSocketTransport::new(config.ws_base_url.clone()));
        Self::start_with(config, durable, transport).await
    }

    pub async fn start_with(
        config: EngineConfig,
        durable: DurableTierArgs,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, EngineError> {
        let mut join_handles = Vec::new();

        let (event_bus, handle) =
            Actor::spawn(None, EventBusActor, EventBusArguments::default()).await?;
        join_handles.push(handle);

        let (store, handle) = Actor::spawn(
            None,
            TraceStoreActor,
            TraceStoreArguments {
                event_bus: event_bus.clone(),
                durable,
            },
        )
        .await?;
        join_handles.push(handle);

        let merger = TraceMerger::new(CompletionHeuristic {
            length_threshold: config.completion_length_threshold,
        });
        let (ingest, handle) = Actor::spawn(
            None,
            TraceIngestActor,
            TraceIngestArguments {
                store: store.clone(),
                merger,
                session_id: config.session_id.clone(),
            },
        )
        .await?;
        join_handles.push(handle);

        let (controller, handle) = Actor::spawn(
            None,
            ActivationControllerActor,
            ActivationArguments {
                event_bus: event_bus.clone(),
                store: store.clone(),
                ingest: ingest.clone(),
                suppression_timeout: config.suppression_timeout,
            },
        )
        .await?;
        join_handles.push(handle);

        let (poller, handle) = Actor::spawn(
            None,
            TracePollerActor,
            TracePollerArguments {
                event_bus: event_bus.clone(),
                store: store.clone(),
                controller: controller.clone(),
                config: config.polling.clone(),
            },
        )
        .await?;
        join_handles.push(handle);

        let (connections, handle) = Actor::spawn(
            None,
            ConnectionManagerActor,
            ConnectionManagerArguments {
                transport,
                config: config.connection.clone(),
            },
        )
        .await?;
        join_handles.push(handle);

        tracing::info!(
            session_id = config.session_id.as_deref().unwrap_or("-"),
            durable = %config.durable_path,
            "Trace engine started"
        );

        Ok(Self {
            config,
            event_bus,
            store,
            ingest,
            controller,
            poller,
            connections,
            join_handles: Mutex::new(join_handles),
            envelope_handlers: Mutex::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &ActorRef<EventBusMsg> {
        &self.event_bus
    }

    pub fn store(&self) -> &ActorRef<TraceStoreMsg> {
        &self.store
    }

    pub fn controller(&self) -> &ActorRef<ActivationMsg> {
        &self.controller
    }

    pub async fn ingest_fragment(&self, fragment: TraceFragment) -> Result<IngestReport, EngineError> {
        ingest::ingest_fragment(&self.ingest, fragment).await
    }

    pub async fn ingest_envelope(&self, envelope: Value) -> Result<Vec<IngestReport>, EngineError> {
        ingest::ingest_envelope(&self.ingest, envelope).await
    }

    /// Connect the session and route its inbound envelopes into ingest.
    ///
    /// Idempotent: repeated calls reuse the open (or opening) connection and
    /// the envelope handler is registered once per connection id.
    pub async fn connect(&self, key: SessionKey) -> Result<ConnectionHandle, EngineError> {
        {
            let mut handlers = self.envelope_handlers.lock().await;
            let connection_id = key.connection_id();
            if !handlers.contains_key(&connection_id) {
                let ingest = self.ingest.clone();
                let handler: connection::MessageHandler = Arc::new(move |message: &InboundMessage| {
                    let msg = TraceIngestMsg::Envelope {
                        envelope: message.payload.clone(),
                        reply: None,
                    };
                    if let Err(e) = ingest.cast(msg) {
                        tracing::warn!(error = %e, "Dropping inbound envelope; ingest unavailable");
                    }
                });
                let id =
                    connection::register_handler(&self.connections, key.clone(), ANY_MESSAGE, handler)
                        .await?;
                handlers.insert(connection_id, id);
            }
        }

        Ok(connection::connect(&self.connections, key).await??)
    }

    pub async fn disconnect(&self, key: SessionKey) -> Result<(), EngineError> {
        if let Some(id) = self.envelope_handlers.lock().await.remove(&key.connection_id()) {
            connection::unregister_handler(&self.connections, key.clone(), id).await?;
        }
        connection::disconnect(&self.connections, key).await?;
        Ok(())
    }

    pub async fn register_handler(
        &self,
        key: SessionKey,
        message_type: &str,
        handler: connection::MessageHandler,
    ) -> Result<HandlerId, EngineError> {
        Ok(connection::register_handler(&self.connections, key, message_type, handler).await?)
    }

    pub async fn unregister_handler(&self, key: SessionKey, id: HandlerId) -> Result<bool, EngineError> {
        Ok(connection::unregister_handler(&self.connections, key, id).await?)
    }

    pub async fn snapshot(&self) -> Result<ActivationSnapshot, EngineError> {
        Ok(activation::get_snapshot(&self.controller).await?)
    }

    /// Re-deliver a node's trace group (display-ordered) without touching state.
    pub async fn select(&self, node: AgentNodeId) -> Result<Option<TraceGroup>, EngineError> {
        Ok(activation::select_node(&self.controller, node).await?)
    }

    pub async fn trace(&self, node: AgentNodeId) -> Result<Option<TraceGroup>, EngineError> {
        Ok(trace_store::read_trace(&self.store, node).await?)
    }

    /// Start a new conversation: pending connection attempts and the poll
    /// ticker are cancelled, the store is cleared, every node goes idle.
    pub async fn reset(&self) -> Result<(), EngineError> {
        poller::stop_polling(&self.poller).await?;
        let cancelled = connection::cancel_pending(&self.connections).await?;
        trace_store::clear_traces(&self.store, ClearScope::All).await?;
        activation::reset_activation(&self.controller).await?;
        poller::start_polling(&self.poller).await?;
        tracing::info!(cancelled_attempts = cancelled, "Engine reset");
        Ok(())
    }

    pub async fn clear_session(&self, session_id: impl Into<String>) -> Result<(), EngineError> {
        trace_store::clear_traces(&self.store, ClearScope::Session(session_id.into())).await?;
        Ok(())
    }

    /// Drop the in-memory tier; later reads fall back to the durable tier.
    pub async fn reload(&self) -> Result<(), EngineError> {
        Ok(trace_store::reload(&self.store).await?)
    }

    pub async fn store_status(&self) -> Result<StoreStatus, EngineError> {
        Ok(trace_store::store_status(&self.store).await?)
    }

    /// Run one poll cycle immediately; returns the number of durable records read.
    pub async fn poll_now(&self) -> Result<usize, EngineError> {
        Ok(poller::poll_now(&self.poller).await?)
    }

    pub async fn poller_status(&self) -> Result<poller::PollerStatus, EngineError> {
        Ok(poller::poller_status(&self.poller).await?)
    }

    /// Subscribe an actor to a bus topic.
    pub async fn subscribe(&self, topic: Topic, subscriber: ActorRef<BusEvent>) -> Result<(), EngineError> {
        Ok(event_bus::subscribe(&self.event_bus, topic, subscriber).await?)
    }

    /// Stream bus events for `topics` into a channel.
    pub async fn watch(&self, topics: &[Topic]) -> Result<mpsc::UnboundedReceiver<BusEvent>, EngineError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (watcher, _) = Actor::spawn(None, ChannelSink, tx).await?;
        for topic in topics {
            event_bus::subscribe(&self.event_bus, *topic, watcher.clone()).await?;
        }
        self.watchers.lock().await.push(watcher);
        Ok(rx)
    }

    pub async fn shutdown(self) {
        if let Err(e) = connection::disconnect_all(&self.connections).await {
            tracing::warn!(error = %e, "Failed to close connections cleanly");
        }
        for watcher in self.watchers.lock().await.drain(..) {
            watcher.stop(None);
        }

        self.connections.stop(None);
        self.poller.stop(None);
        self.controller.stop(None);
        self.ingest.stop(None);
        self.store.stop(None);
        self.event_bus.stop(None);

        for handle in self.join_handles.lock().await.drain(..) {
            let _ = handle.await;
        }
        tracing::info!("Trace engine stopped");
    }
}

/// Forwards bus events into an unbounded channel.
struct ChannelSink;

#[async_trait]
impl Actor for ChannelSink {
    type Msg = BusEvent;
    type State = mpsc::UnboundedSender<BusEvent>;
    type Arguments = mpsc::UnboundedSender<BusEvent>;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        tx: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(tx)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        event: Self::Msg,
        tx: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if tx.send(event).is_err() {
            // receiver gone
            myself.stop(None);
        }
        Ok(())
    }
}
