//! EventBusActor - typed topic pub/sub using ractor Process Groups
//!
//! Every engine owns one bus. Topics are fixed (`trace-updated`,
//! `activation-changed`, `node-selected`, `reset`) and a subscriber to `*`
//! receives all of them.
//!
//! # Architecture
//!
//! - Uses `ractor::pg` for membership; group names are prefixed with a
//!   per-bus scope so two engines in one process never see each other's events
//! - Delivery is always a `cast!`, so a subscriber reacting to an event can
//!   never re-enter the publisher's call stack
//! - Events caused by the engine's own writes carry a [`SuppressionKey`]
//!
//! # Example
//!
//! ```rust,ignore
//! subscribe(&bus, Topic::TraceUpdated, collector.clone()).await?;
//! publish_event(&bus, BusEvent::new(BusPayload::Reset, "engine")).await?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ractor::{cast, Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde::{Deserialize, Serialize};
use shared_types::{ActivationSnapshot, AgentNodeId, SuppressionKey, TraceGroup};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

// ============================================================================
// Data Types
// ============================================================================

/// Named channel of the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    TraceUpdated,
    ActivationChanged,
    NodeSelected,
    Reset,
    /// Receives every topic
    #[serde(rename = "*")]
    All,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::TraceUpdated => "trace-updated",
            Topic::ActivationChanged => "activation-changed",
            Topic::NodeSelected => "node-selected",
            Topic::Reset => "reset",
            Topic::All => "*",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A trace group as it was after an accepted store write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TraceUpdate {
    pub node_id: AgentNodeId,
    pub trace_group: TraceGroup,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "data", rename_all = "kebab-case")]
pub enum BusPayload {
    TraceUpdated(TraceUpdate),
    ActivationChanged(ActivationSnapshot),
    NodeSelected {
        node_id: AgentNodeId,
        trace_group: Option<TraceGroup>,
    },
    Reset,
}

impl BusPayload {
    pub fn topic(&self) -> Topic {
        match self {
            BusPayload::TraceUpdated(_) => Topic::TraceUpdated,
            BusPayload::ActivationChanged(_) => Topic::ActivationChanged,
            BusPayload::NodeSelected { .. } => Topic::NodeSelected,
            BusPayload::Reset => Topic::Reset,
        }
    }
}

/// Event delivered to bus subscribers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusEvent {
    /// Unique event identifier (ULID)
    pub id: String,

    pub topic: Topic,

    pub payload: BusPayload,

    pub timestamp: DateTime<Utc>,

    /// Publishing actor
    pub source: String,

    /// Present when the engine caused this event itself
    pub suppression: Option<SuppressionKey>,
}

impl BusEvent {
    pub fn new(payload: BusPayload, source: impl Into<String>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            topic: payload.topic(),
            payload,
            timestamp: Utc::now(),
            source: source.into(),
            suppression: None,
        }
    }

    /// Tag the event with the key of the write that caused it (builder pattern)
    pub fn with_suppression(mut self, key: Option<SuppressionKey>) -> Self {
        self.suppression = key;
        self
    }

    pub fn matches_topic(&self, topic: Topic) -> bool {
        topic == Topic::All || self.topic == topic
    }
}

// ============================================================================
// EventBusActor
// ============================================================================

/// Messages handled by EventBusActor
#[derive(Debug)]
pub enum EventBusMsg {
    /// Publish an event to its topic
    Publish { event: BusEvent },

    /// Subscribe an actor to a topic
    Subscribe {
        topic: Topic,
        subscriber: ActorRef<BusEvent>,
    },

    /// Unsubscribe an actor from a topic
    Unsubscribe {
        topic: Topic,
        subscriber: ActorRef<BusEvent>,
    },

    /// Get list of subscribers for a topic (for debugging)
    GetSubscribers {
        topic: Topic,
        reply: RpcReplyPort<Vec<ractor::ActorId>>,
    },
}

/// Arguments for spawning EventBusActor
#[derive(Debug, Clone, Default)]
pub struct EventBusArguments {
    /// Group name prefix; a fresh ULID when absent
    pub scope: Option<String>,
}

/// State for EventBusActor
pub struct EventBusState {
    scope: String,

    /// Cache of topic -> subscriber count (for debugging)
    subscription_stats: HashMap<Topic, usize>,
}

impl EventBusState {
    fn group(&self, topic: Topic) -> String {
        format!("{}:{}", self.scope, topic)
    }
}

/// Actor that provides pub/sub event distribution
#[derive(Debug, Default)]
pub struct EventBusActor;

#[async_trait]
impl Actor for EventBusActor {
    type Msg = EventBusMsg;
    type State = EventBusState;
    type Arguments = EventBusArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let scope = args
            .scope
            .unwrap_or_else(|| format!("trace-bus-{}", ulid::Ulid::new()));

        tracing::info!(
            actor_id = %myself.get_id(),
            scope = %scope,
            "EventBusActor starting"
        );

        Ok(EventBusState {
            scope,
            subscription_stats: HashMap::new(),
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            EventBusMsg::Publish { event } => self.handle_publish(event, state),
            EventBusMsg::Subscribe { topic, subscriber } => {
                self.handle_subscribe(topic, subscriber, state)
            }
            EventBusMsg::Unsubscribe { topic, subscriber } => {
                self.handle_unsubscribe(topic, subscriber, state)
            }
            EventBusMsg::GetSubscribers { topic, reply } => {
                let members = ractor::pg::get_members(&state.group(topic));
                let actor_ids = members.iter().map(|cell| cell.get_id()).collect();
                // Caller may have timed out
                let _ = reply.send(actor_ids);
                Ok(())
            }
        }
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            scope = %state.scope,
            "EventBusActor stopped"
        );
        Ok(())
    }
}

impl EventBusActor {
    fn handle_publish(
        &self,
        event: BusEvent,
        state: &mut EventBusState,
    ) -> Result<(), ActorProcessingErr> {
        tracing::debug!(
            event_id = %event.id,
            topic = %event.topic,
            source = %event.source,
            suppressed = event.suppression.is_some(),
            "Publishing event"
        );

        self.broadcast(&state.group(event.topic), &event);
        if event.topic != Topic::All {
            self.broadcast(&state.group(Topic::All), &event);
        }
        Ok(())
    }

    fn handle_subscribe(
        &self,
        topic: Topic,
        subscriber: ActorRef<BusEvent>,
        state: &mut EventBusState,
    ) -> Result<(), ActorProcessingErr> {
        ractor::pg::join(state.group(topic), vec![subscriber.get_cell()]);
        *state.subscription_stats.entry(topic).or_insert(0) += 1;

        tracing::debug!(
            topic = %topic,
            subscriber = %subscriber.get_id(),
            "Actor subscribed to topic"
        );
        Ok(())
    }

    fn handle_unsubscribe(
        &self,
        topic: Topic,
        subscriber: ActorRef<BusEvent>,
        state: &mut EventBusState,
    ) -> Result<(), ActorProcessingErr> {
        ractor::pg::leave(state.group(topic), vec![subscriber.get_cell()]);

        if let Some(count) = state.subscription_stats.get_mut(&topic) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.subscription_stats.remove(&topic);
            }
        }

        tracing::debug!(
            topic = %topic,
            subscriber = %subscriber.get_id(),
            "Actor unsubscribed from topic"
        );
        Ok(())
    }

    fn broadcast(&self, group: &str, event: &BusEvent) {
        for member in ractor::pg::get_members(&group.to_string()) {
            let actor_id = member.get_id();
            let actor_ref: ActorRef<BusEvent> = member.into();
            if let Err(e) = actor_ref.cast(event.clone()) {
                tracing::warn!(
                    group = %group,
                    actor_id = %actor_id,
                    error = %e,
                    "Failed to send event to subscriber"
                );
            }
        }
    }
}

// ============================================================================
// BusRelay
// ============================================================================

/// Converts bus events into another actor's message type.
pub type RelayFn<M> = fn(BusEvent) -> Option<M>;

/// Forwards bus events to an actor whose `Msg` is not [`BusEvent`].
///
/// Process group members must accept `BusEvent` directly, so actors with a
/// richer mailbox subscribe through a relay linked to them.
pub struct BusRelay<M> {
    _marker: PhantomData<fn() -> M>,
}

impl<M> Default for BusRelay<M> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

pub struct BusRelayArguments<M: ractor::Message> {
    pub target: ActorRef<M>,
    pub convert: RelayFn<M>,
}

#[async_trait]
impl<M: ractor::Message> Actor for BusRelay<M> {
    type Msg = BusEvent;
    type State = BusRelayArguments<M>;
    type Arguments = BusRelayArguments<M>;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(args)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(converted) = (state.convert)(message) {
            if let Err(e) = state.target.cast(converted) {
                tracing::debug!(error = %e, "Relay target is gone");
            }
        }
        Ok(())
    }
}

/// Subscribe `target` to `topics` through a relay linked to it. The relay stops
/// together with its target.
pub async fn subscribe_relay<M: ractor::Message>(
    event_bus: &ActorRef<EventBusMsg>,
    topics: &[Topic],
    target: &ActorRef<M>,
    convert: RelayFn<M>,
) -> Result<ActorRef<BusEvent>, ActorProcessingErr> {
    let (relay, _handle) = Actor::spawn_linked(
        None,
        BusRelay::<M>::default(),
        BusRelayArguments {
            target: target.clone(),
            convert,
        },
        target.get_cell(),
    )
    .await?;

    for topic in topics {
        subscribe(event_bus, *topic, relay.clone())
            .await
            .map_err(|e| ActorProcessingErr::from(e.to_string()))?;
    }
    Ok(relay)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Convenience function to publish an event
pub async fn publish_event(
    event_bus: &ActorRef<EventBusMsg>,
    event: BusEvent,
) -> Result<(), ractor::RactorErr<EventBusMsg>> {
    cast!(event_bus, EventBusMsg::Publish { event })
}

/// Convenience function to subscribe to a topic
pub async fn subscribe(
    event_bus: &ActorRef<EventBusMsg>,
    topic: Topic,
    subscriber: ActorRef<BusEvent>,
) -> Result<(), ractor::RactorErr<EventBusMsg>> {
    cast!(event_bus, EventBusMsg::Subscribe { topic, subscriber })
}

/// Convenience function to unsubscribe from a topic
pub async fn unsubscribe(
    event_bus: &ActorRef<EventBusMsg>,
    topic: Topic,
    subscriber: ActorRef<BusEvent>,
) -> Result<(), ractor::RactorErr<EventBusMsg>> {
    cast!(event_bus, EventBusMsg::Unsubscribe { topic, subscriber })
}

/// Convenience function to list subscribers of a topic
pub async fn get_subscribers(
    event_bus: &ActorRef<EventBusMsg>,
    topic: Topic,
) -> Result<Vec<ractor::ActorId>, ractor::RactorErr<EventBusMsg>> {
    ractor::call!(event_bus, |reply| EventBusMsg::GetSubscribers { topic, reply })
}

// ============================================================================
// Tests
// ============================================================================
