//! ConnectionManagerActor - one live transport per session
//!
//! `connect` is idempotent per connection id: an open link is returned as is
//! and callers arriving while an attempt is in flight wait on that attempt.
//! Opening retries a bounded number of times, each attempt under a timeout.
//! When the bound is exhausted the manager gives up quietly and the engine
//! keeps running on the poll fallback.
//!
//! Inbound frames are parsed as JSON and dispatched to handlers registered for
//! the frame's `type`, for `"*"`, or for `"trace"` when the frame carries
//! `onUpdateChat.trace`.

pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ConnectionConfig;
pub use transport::{Transport, TransportError, TransportLink, WebSocketTransport};

/// Handler type matching every inbound message
pub const ANY_MESSAGE: &str = "*";
/// Handler type matching messages that carry a trace envelope
pub const TRACE_MESSAGE: &str = "trace";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub session_id: String,
    pub model_id: Option<String>,
}

impl SessionKey {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            model_id: None,
        }
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    /// `sessionId` or `sessionId-modelId`
    pub fn connection_id(&self) -> String {
        match &self.model_id {
            Some(model) => format!("{}-{}", self.session_id, model),
            None => self.session_id.clone(),
        }
    }
}

/// One parsed inbound frame
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub connection_id: String,
    pub message_type: Option<String>,
    pub payload: Value,
}

impl InboundMessage {
    pub fn carries_trace(&self) -> bool {
        self.payload.pointer("/onUpdateChat/trace").is_some()
    }

    fn matches(&self, handler_type: &str) -> bool {
        handler_type == ANY_MESSAGE
            || self.message_type.as_deref() == Some(handler_type)
            || (handler_type == TRACE_MESSAGE && self.carries_trace())
    }
}

pub type MessageHandler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

/// Sending half of an open connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub connection_id: String,
    outbound: mpsc::UnboundedSender<String>,
}

impl ConnectionHandle {
    pub fn send(&self, message: &Value) -> Result<(), ConnectionError> {
        self.outbound
            .send(message.to_string())
            .map_err(|_| ConnectionError::Transport(TransportError::Closed))
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Open,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("gave up on {connection_id} after {attempts} attempts")]
    GaveUp { connection_id: String, attempts: u32 },

    #[error("connection attempt cancelled")]
    Cancelled,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub enum ConnectionManagerMsg {
    Connect {
        key: SessionKey,
        reply: RpcReplyPort<Result<ConnectionHandle, ConnectionError>>,
    },
    AttemptFinished {
        connection_id: String,
        generation: u64,
        result: Result<TransportLink, ConnectionError>,
    },
    Inbound {
        connection_id: String,
        generation: u64,
        text: String,
    },
    Closed {
        connection_id: String,
        generation: u64,
    },
    RegisterHandler {
        key: SessionKey,
        message_type: String,
        handler: MessageHandler,
        reply: RpcReplyPort<HandlerId>,
    },
    UnregisterHandler {
        key: SessionKey,
        handler_id: HandlerId,
        reply: RpcReplyPort<bool>,
    },
    Disconnect {
        key: SessionKey,
        reply: RpcReplyPort<()>,
    },
    /// Cancel in-flight attempts; open links stay up
    CancelPending { reply: RpcReplyPort<usize> },
    /// Cancel pending retries and close every link
    DisconnectAll { reply: RpcReplyPort<()> },
    GetStatus {
        key: SessionKey,
        reply: RpcReplyPort<Option<ConnectionStatus>>,
    },
}

pub struct ConnectionManagerArguments {
    pub transport: Arc<dyn Transport>,
    pub config: ConnectionConfig,
}

enum ConnectionEntry {
    Connecting {
        generation: u64,
        waiters: Vec<RpcReplyPort<Result<ConnectionHandle, ConnectionError>>>,
        attempts: JoinHandle<()>,
    },
    Open {
        generation: u64,
        handle: ConnectionHandle,
        reader: JoinHandle<()>,
    },
}

impl ConnectionEntry {
    fn generation(&self) -> u64 {
        match self {
            ConnectionEntry::Connecting { generation, .. } | ConnectionEntry::Open { generation, .. } => {
                *generation
            }
        }
    }

    fn status(&self) -> ConnectionStatus {
        match self {
            ConnectionEntry::Connecting { .. } => ConnectionStatus::Connecting,
            ConnectionEntry::Open { .. } => ConnectionStatus::Open,
        }
    }

    fn cancel(self) {
        match self {
            ConnectionEntry::Connecting {
                waiters, attempts, ..
            } => {
                attempts.abort();
                for waiter in waiters {
                    let _ = waiter.send(Err(ConnectionError::Cancelled));
                }
            }
            ConnectionEntry::Open { reader, .. } => reader.abort(),
        }
    }
}

struct RegisteredHandler {
    id: HandlerId,
    message_type: String,
    handler: MessageHandler,
}

pub struct ConnectionManagerState {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    connections: HashMap<String, ConnectionEntry>,
    handlers: HashMap<String, Vec<RegisteredHandler>>,
    next_generation: u64,
    next_handler_id: u64,
}

#[derive(Debug, Default)]
pub struct ConnectionManagerActor;

#[async_trait]
impl Actor for ConnectionManagerActor {
    type Msg = ConnectionManagerMsg;
    type State = ConnectionManagerState;
    type Arguments = ConnectionManagerArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            max_attempts = args.config.max_attempts,
            "ConnectionManagerActor starting"
        );
        Ok(ConnectionManagerState {
            transport: args.transport,
            config: args.config,
            connections: HashMap::new(),
            handlers: HashMap::new(),
            next_generation: 0,
            next_handler_id: 0,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ConnectionManagerMsg::Connect { key, reply } => {
                self.handle_connect(&myself, key, reply, state);
            }
            ConnectionManagerMsg::AttemptFinished {
                connection_id,
                generation,
                result,
            } => {
                self.handle_attempt_finished(&myself, connection_id, generation, result, state);
            }
            ConnectionManagerMsg::Inbound {
                connection_id,
                generation,
                text,
            } => {
                let current = state.connections.get(&connection_id).map(ConnectionEntry::generation);
                if current == Some(generation) {
                    dispatch(state, &connection_id, &text);
                }
            }
            ConnectionManagerMsg::Closed {
                connection_id,
                generation,
            } => {
                let current = state.connections.get(&connection_id).map(ConnectionEntry::generation);
                if current == Some(generation) {
                    state.connections.remove(&connection_id);
                    tracing::warn!(%connection_id, "Connection closed by peer");
                }
            }
            ConnectionManagerMsg::RegisterHandler {
                key,
                message_type,
                handler,
                reply,
            } => {
                state.next_handler_id += 1;
                let id = HandlerId(state.next_handler_id);
                let connection_id = key.connection_id();
                tracing::debug!(%connection_id, %message_type, "Handler registered");
                state
                    .handlers
                    .entry(connection_id)
                    .or_default()
                    .push(RegisteredHandler {
                        id,
                        message_type,
                        handler,
                    });
                let _ = reply.send(id);
            }
            ConnectionManagerMsg::UnregisterHandler {
                key,
                handler_id,
                reply,
            } => {
                let connection_id = key.connection_id();
                let mut removed = false;
                if let Some(list) = state.handlers.get_mut(&connection_id) {
                    let before = list.len();
                    list.retain(|h| h.id != handler_id);
                    removed = list.len() != before;
                    if list.is_empty() {
                        state.handlers.remove(&connection_id);
                    }
                }
                let _ = reply.send(removed);
            }
            ConnectionManagerMsg::Disconnect { key, reply } => {
                let connection_id = key.connection_id();
                if let Some(entry) = state.connections.remove(&connection_id) {
                    tracing::info!(%connection_id, "Disconnecting");
                    entry.cancel();
                }
                let _ = reply.send(());
            }
            ConnectionManagerMsg::CancelPending { reply } => {
                let pending: Vec<String> = state
                    .connections
                    .iter()
                    .filter(|(_, entry)| entry.status() == ConnectionStatus::Connecting)
                    .map(|(id, _)| id.clone())
                    .collect();
                for connection_id in &pending {
                    if let Some(entry) = state.connections.remove(connection_id) {
                        tracing::info!(%connection_id, "Pending connection attempt cancelled");
                        entry.cancel();
                    }
                }
                let _ = reply.send(pending.len());
            }
            ConnectionManagerMsg::DisconnectAll { reply } => {
                for (_, entry) in state.connections.drain() {
                    entry.cancel();
                }
                let _ = reply.send(());
            }
            ConnectionManagerMsg::GetStatus { key, reply } => {
                let status = state
                    .connections
                    .get(&key.connection_id())
                    .map(ConnectionEntry::status);
                let _ = reply.send(status);
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        for (_, entry) in state.connections.drain() {
            entry.cancel();
        }
        tracing::info!(actor_id = %myself.get_id(), "ConnectionManagerActor stopped");
        Ok(())
    }
}

impl ConnectionManagerActor {
    fn handle_connect(
        &self,
        myself: &ActorRef<ConnectionManagerMsg>,
        key: SessionKey,
        reply: RpcReplyPort<Result<ConnectionHandle, ConnectionError>>,
        state: &mut ConnectionManagerState,
    ) {
        let connection_id = key.connection_id();

        if let Some(ConnectionEntry::Open { handle, .. }) = state.connections.get(&connection_id) {
            if !handle.is_closed() {
                let _ = reply.send(Ok(handle.clone()));
                return;
            }
        }
        if let Some(ConnectionEntry::Connecting { waiters, .. }) =
            state.connections.get_mut(&connection_id)
        {
            tracing::debug!(%connection_id, "Joining in-flight connection attempt");
            waiters.push(reply);
            return;
        }
        if let Some(stale) = state.connections.remove(&connection_id) {
            stale.cancel();
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let attempts = spawn_attempts(
            myself.clone(),
            state.transport.clone(),
            state.config.clone(),
            key,
            generation,
        );
        tracing::info!(%connection_id, generation, "Connecting");
        state.connections.insert(
            connection_id,
            ConnectionEntry::Connecting {
                generation,
                waiters: vec![reply],
                attempts,
            },
        );
    }

    fn handle_attempt_finished(
        &self,
        myself: &ActorRef<ConnectionManagerMsg>,
        connection_id: String,
        generation: u64,
        result: Result<TransportLink, ConnectionError>,
        state: &mut ConnectionManagerState,
    ) {
        let waiters = match state.connections.remove(&connection_id) {
            Some(ConnectionEntry::Connecting {
                generation: current,
                waiters,
                ..
            }) if current == generation => waiters,
            Some(other) => {
                // superseded attempt; the dropped link closes itself
                state.connections.insert(connection_id, other);
                return;
            }
            None => return,
        };

        match result {
            Ok(link) => {
                let handle = ConnectionHandle {
                    connection_id: connection_id.clone(),
                    outbound: link.outbound,
                };
                let reader = spawn_reader(myself.clone(), connection_id.clone(), generation, link.inbound);
                tracing::info!(%connection_id, "Connection open");
                for waiter in waiters {
                    let _ = waiter.send(Ok(handle.clone()));
                }
                state.connections.insert(
                    connection_id,
                    ConnectionEntry::Open {
                        generation,
                        handle,
                        reader,
                    },
                );
            }
            Err(e) => {
                tracing::warn!(%connection_id, error = %e, "Giving up on connection; polling continues");
                for waiter in waiters {
                    let _ = waiter.send(Err(e.clone()));
                }
            }
        }
    }
}

fn connect_message(key: &SessionKey) -> Value {
    json!({
        "type": "connect",
        "sessionId": key.session_id,
        "modelId": key.model_id,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

fn spawn_attempts(
    manager: ActorRef<ConnectionManagerMsg>,
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    key: SessionKey,
    generation: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let connection_id = key.connection_id();
        let max_attempts = config.max_attempts.max(1);
        let mut result = Err(ConnectionError::GaveUp {
            connection_id: connection_id.clone(),
            attempts: max_attempts,
        });

        for attempt in 1..=max_attempts {
            match tokio::time::timeout(config.connect_timeout, transport.open(&key)).await {
                Ok(Ok(link)) => {
                    if link.outbound.send(connect_message(&key).to_string()).is_err() {
                        tracing::warn!(%connection_id, attempt, "Link closed before connect message");
                    } else {
                        result = Ok(link);
                        break;
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(%connection_id, attempt, error = %e, "Connect attempt failed");
                }
                Err(_) => {
                    tracing::warn!(
                        %connection_id,
                        attempt,
                        timeout_ms = config.connect_timeout.as_millis() as u64,
                        "Connect attempt timed out"
                    );
                }
            }
            if attempt < max_attempts {
                tokio::time::sleep(config.retry_delay).await;
            }
        }

        let _ = manager.cast(ConnectionManagerMsg::AttemptFinished {
            connection_id,
            generation,
            result,
        });
    })
}

fn spawn_reader(
    manager: ActorRef<ConnectionManagerMsg>,
    connection_id: String,
    generation: u64,
    mut inbound: mpsc::UnboundedReceiver<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(text) = inbound.recv().await {
            let msg = ConnectionManagerMsg::Inbound {
                connection_id: connection_id.clone(),
                generation,
                text,
            };
            if manager.cast(msg).is_err() {
                return;
            }
        }
        let _ = manager.cast(ConnectionManagerMsg::Closed {
            connection_id,
            generation,
        });
    })
}

fn dispatch(state: &ConnectionManagerState, connection_id: &str, text: &str) {
    let payload: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(%connection_id, error = %e, "Discarding non-JSON frame");
            return;
        }
    };
    let message = InboundMessage {
        connection_id: connection_id.to_string(),
        message_type: payload
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string),
        payload,
    };

    let Some(handlers) = state.handlers.get(connection_id) else {
        tracing::debug!(%connection_id, "No handlers for inbound frame");
        return;
    };
    for registered in handlers.iter().filter(|h| message.matches(&h.message_type)) {
        (registered.handler)(&message);
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

pub async fn connect(
    manager: &ActorRef<ConnectionManagerMsg>,
    key: SessionKey,
) -> Result<Result<ConnectionHandle, ConnectionError>, ractor::RactorErr<ConnectionManagerMsg>> {
    ractor::call!(manager, |reply| ConnectionManagerMsg::Connect { key, reply })
}

pub async fn register_handler(
    manager: &ActorRef<ConnectionManagerMsg>,
    key: SessionKey,
    message_type: impl Into<String>,
    handler: MessageHandler,
) -> Result<HandlerId, ractor::RactorErr<ConnectionManagerMsg>> {
    let message_type = message_type.into();
    ractor::call!(manager, |reply| ConnectionManagerMsg::RegisterHandler {
        key,
        message_type,
        handler,
        reply,
    })
}

pub async fn unregister_handler(
    manager: &ActorRef<ConnectionManagerMsg>,
    key: SessionKey,
    handler_id: HandlerId,
) -> Result<bool, ractor::RactorErr<ConnectionManagerMsg>> {
    ractor::call!(manager, |reply| ConnectionManagerMsg::UnregisterHandler {
        key,
        handler_id,
        reply,
    })
}

pub async fn disconnect(
    manager: &ActorRef<ConnectionManagerMsg>,
    key: SessionKey,
) -> Result<(), ractor::RactorErr<ConnectionManagerMsg>> {
    ractor::call!(manager, |reply| ConnectionManagerMsg::Disconnect { key, reply })
}

pub async fn cancel_pending(
    manager: &ActorRef<ConnectionManagerMsg>,
) -> Result<usize, ractor::RactorErr<ConnectionManagerMsg>> {
    ractor::call!(manager, |reply| ConnectionManagerMsg::CancelPending { reply })
}

pub async fn disconnect_all(
    manager: &ActorRef<ConnectionManagerMsg>,
) -> Result<(), ractor::RactorErr<ConnectionManagerMsg>> {
    ractor::call!(manager, |reply| ConnectionManagerMsg::DisconnectAll { reply })
}

pub async fn connection_status(
    manager: &ActorRef<ConnectionManagerMsg>,
    key: SessionKey,
) -> Result<Option<ConnectionStatus>, ractor::RactorErr<ConnectionManagerMsg>> {
    ractor::call!(manager, |reply| ConnectionManagerMsg::GetStatus { key, reply })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_includes_model_when_present() {
        assert_eq!(SessionKey::new("s1").connection_id(), "s1");
        assert_eq!(SessionKey::new("s1").with_model("m2").connection_id(), "s1-m2");
    }

    #[test]
    fn test_handler_matching() {
        let message = InboundMessage {
            connection_id: "s1".into(),
            message_type: Some("chat".into()),
            payload: json!({"type": "chat", "onUpdateChat": {"trace": {}}}),
        };
        assert!(message.matches("*"));
        assert!(message.matches("chat"));
        assert!(message.matches("trace"));
        assert!(!message.matches("status"));

        let plain = InboundMessage {
            connection_id: "s1".into(),
            message_type: None,
            payload: json!({"onUpdateChat": {"assistant": "hi"}}),
        };
        assert!(!plain.matches("trace"));
        assert!(plain.matches("*"));
    }

    #[test]
    fn test_connect_message_shape() {
        let message = connect_message(&SessionKey::new("s1").with_model("m"));
        assert_eq!(message["type"], "connect");
        assert_eq!(message["sessionId"], "s1");
        assert_eq!(message["modelId"], "m");
        assert!(message["timestamp"].is_string());
    }
}
