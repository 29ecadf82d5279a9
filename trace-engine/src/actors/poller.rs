//! TracePollerActor - polling fallback over the durable tier
//!
//! Push notifications can be dropped. On every tick the poller reads the
//! durable records directly and hands them to the activation controller, which
//! ignores anything whose fingerprint it has already seen.
//!
//! The tick interval is short while the conversation runs and longer (or
//! zero ticks at all) once it is complete. Each ticker carries a generation;
//! ticks from a cancelled ticker are ignored.

use std::time::Duration;

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use tokio::task::JoinHandle;

use crate::actors::activation::ActivationMsg;
use crate::actors::event_bus::{subscribe_relay, BusEvent, BusPayload, EventBusMsg, Topic};
use crate::actors::trace_store::{read_durable, TraceStoreMsg};
use crate::config::PollingConfig;

#[derive(Debug)]
pub enum TracePollerMsg {
    Tick { generation: u64 },
    /// Conversation completion as last published by the controller
    ConversationState { complete: bool },
    /// Cancel the ticker
    Stop { reply: RpcReplyPort<()> },
    /// (Re)start ticking at the active interval
    Start { reply: RpcReplyPort<()> },
    /// Poll once right now
    PollNow { reply: RpcReplyPort<usize> },
    GetStatus { reply: RpcReplyPort<PollerStatus> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerStatus {
    pub running: bool,
    pub interval: Option<Duration>,
    pub generation: u64,
}

pub struct TracePollerArguments {
    pub event_bus: ActorRef<EventBusMsg>,
    pub store: ActorRef<TraceStoreMsg>,
    pub controller: ActorRef<ActivationMsg>,
    pub config: PollingConfig,
}

pub struct TracePollerState {
    event_bus: ActorRef<EventBusMsg>,
    store: ActorRef<TraceStoreMsg>,
    controller: ActorRef<ActivationMsg>,
    config: PollingConfig,
    generation: u64,
    ticker: Option<JoinHandle<()>>,
    interval: Option<Duration>,
    conversation_complete: bool,
}

impl TracePollerState {
    fn cancel(&mut self) {
        self.generation += 1;
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        self.interval = None;
    }

    /// Restart the ticker if the interval it should run at has changed.
    fn retune(&mut self, myself: &ActorRef<TracePollerMsg>) {
        let desired = interval_for(&self.config, self.conversation_complete);
        if desired == self.interval && (desired.is_none() || self.ticker.is_some()) {
            return;
        }
        self.cancel();
        let Some(period) = desired else {
            tracing::info!("Conversation complete; polling stopped");
            return;
        };

        let generation = self.generation;
        let tick_ref = myself.clone();
        self.ticker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if tick_ref.cast(TracePollerMsg::Tick { generation }).is_err() {
                    break;
                }
            }
        }));
        self.interval = Some(period);
        tracing::debug!(interval_ms = period.as_millis() as u64, generation, "Poll ticker started");
    }
}

/// Tick period for the given conversation state; `None` means stop ticking.
fn interval_for(config: &PollingConfig, conversation_complete: bool) -> Option<Duration> {
    match (conversation_complete, config.stop_when_complete) {
        (false, _) => Some(config.active_interval),
        (true, false) => Some(config.complete_interval),
        (true, true) => None,
    }
}

fn relay_activation(event: BusEvent) -> Option<TracePollerMsg> {
    match event.payload {
        BusPayload::ActivationChanged(snapshot) => Some(TracePollerMsg::ConversationState {
            complete: snapshot.conversation_complete,
        }),
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct TracePollerActor;

#[async_trait]
impl Actor for TracePollerActor {
    type Msg = TracePollerMsg;
    type State = TracePollerState;
    type Arguments = TracePollerArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            active_ms = args.config.active_interval.as_millis() as u64,
            complete_ms = args.config.complete_interval.as_millis() as u64,
            "TracePollerActor starting"
        );

        Ok(TracePollerState {
            event_bus: args.event_bus,
            store: args.store,
            controller: args.controller,
            config: args.config,
            generation: 0,
            ticker: None,
            interval: None,
            conversation_complete: false,
        })
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        subscribe_relay(
            &state.event_bus,
            &[Topic::ActivationChanged],
            &myself,
            relay_activation,
        )
        .await?;
        state.retune(&myself);
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            TracePollerMsg::Tick { generation } => {
                if generation != state.generation || state.ticker.is_none() {
                    tracing::debug!(generation, "Ignoring tick from cancelled ticker");
                    return Ok(());
                }
                self.poll_once(state).await;
            }
            TracePollerMsg::ConversationState { complete } => {
                if complete != state.conversation_complete {
                    state.conversation_complete = complete;
                    if state.ticker.is_some() || !complete {
                        state.retune(&myself);
                    }
                }
            }
            TracePollerMsg::Stop { reply } => {
                state.cancel();
                tracing::info!("Polling cancelled");
                let _ = reply.send(());
            }
            TracePollerMsg::Start { reply } => {
                state.conversation_complete = false;
                state.cancel();
                state.retune(&myself);
                let _ = reply.send(());
            }
            TracePollerMsg::PollNow { reply } => {
                let seen = self.poll_once(state).await;
                let _ = reply.send(seen);
            }
            TracePollerMsg::GetStatus { reply } => {
                let _ = reply.send(PollerStatus {
                    running: state.ticker.is_some(),
                    interval: state.interval,
                    generation: state.generation,
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
        state.cancel();
        tracing::info!(actor_id = %myself.get_id(), "TracePollerActor stopped");
        Ok(())
    }
}

impl TracePollerActor {
    /// Returns how many durable records were handed to the controller.
    async fn poll_once(&self, state: &mut TracePollerState) -> usize {
        let records = match read_durable(&state.store).await {
            Ok(Ok(records)) => records,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Poll could not read the durable tier");
                return 0;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Poll could not reach the trace store");
                return 0;
            }
        };

        let count = records.len();
        if count > 0 {
            if let Err(e) = state.controller.cast(ActivationMsg::Reconcile { records }) {
                tracing::warn!(error = %e, "Failed to hand poll results to the controller");
            }
        }
        count
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

pub async fn stop_polling(
    poller: &ActorRef<TracePollerMsg>,
) -> Result<(), ractor::RactorErr<TracePollerMsg>> {
    ractor::call!(poller, |reply| TracePollerMsg::Stop { reply })
}

pub async fn start_polling(
    poller: &ActorRef<TracePollerMsg>,
) -> Result<(), ractor::RactorErr<TracePollerMsg>> {
    ractor::call!(poller, |reply| TracePollerMsg::Start { reply })
}

pub async fn poll_now(
    poller: &ActorRef<TracePollerMsg>,
) -> Result<usize, ractor::RactorErr<TracePollerMsg>> {
    ractor::call!(poller, |reply| TracePollerMsg::PollNow { reply })
}

pub async fn poller_status(
    poller: &ActorRef<TracePollerMsg>,
) -> Result<PollerStatus, ractor::RactorErr<TracePollerMsg>> {
    ractor::call!(poller, |reply| TracePollerMsg::GetStatus { reply })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(stop_when_complete: bool) -> PollingConfig {
        PollingConfig {
            active_interval: Duration::from_millis(500),
            complete_interval: Duration::from_millis(1000),
            stop_when_complete,
        }
    }

    #[test]
    fn test_active_conversation_polls_fast() {
        assert_eq!(interval_for(&config(false), false), Some(Duration::from_millis(500)));
        assert_eq!(interval_for(&config(true), false), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_complete_conversation_slows_or_stops() {
        assert_eq!(interval_for(&config(false), true), Some(Duration::from_millis(1000)));
        assert_eq!(interval_for(&config(true), true), None);
    }
}
