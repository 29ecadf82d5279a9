//! Trace engine - correlates streamed agent trace fragments into per-agent
//! trace groups and drives the activation state of a fixed agent flow graph.
//!
//! Fragments arrive over a session transport (or are pushed directly), are
//! merged per node by the [`merger`], kept in a two-tier store and observed by
//! the activation controller. All stateful parts are actors wired together by
//! [`engine::TraceEngine`].

pub mod actors;
pub mod config;
pub mod display;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod merger;

pub use config::EngineConfig;
pub use engine::TraceEngine;
pub use error::EngineError;
