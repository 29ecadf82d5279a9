use thiserror::Error;

use crate::actors::connection::ConnectionError;
use crate::actors::trace_store::TraceStoreError;
use crate::envelope::EnvelopeError;

/// Errors surfaced by the engine's public operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("envelope rejected: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("trace store error: {0}")]
    Store(#[from] TraceStoreError),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("actor spawn failed: {0}")]
    Spawn(String),

    #[error("actor call failed: {0}")]
    Actor(String),
}

impl From<ractor::SpawnErr> for EngineError {
    fn from(e: ractor::SpawnErr) -> Self {
        EngineError::Spawn(e.to_string())
    }
}

impl<T> From<ractor::RactorErr<T>> for EngineError {
    fn from(e: ractor::RactorErr<T>) -> Self {
        EngineError::Actor(e.to_string())
    }
}
