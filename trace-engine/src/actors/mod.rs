pub mod activation;
pub mod connection;
pub mod event_bus;
pub mod ingest;
pub mod poller;
pub mod trace_store;

pub use activation::{ActivationControllerActor, ActivationGraph, ActivationMsg};
pub use connection::{ConnectionManagerActor, ConnectionManagerMsg, SessionKey};
pub use event_bus::{BusEvent, BusPayload, EventBusActor, EventBusMsg, Topic};
pub use ingest::{IngestReport, TraceIngestActor, TraceIngestMsg};
pub use poller::{TracePollerActor, TracePollerMsg};
pub use trace_store::{TraceStoreActor, TraceStoreMsg};
