//! Bandstand: a three-level agent orchestrator for prompt-driven music
//! composition.
//!
//! A coordinator fans out parallel per-instrument agents, each of which
//! dispatches per-section children, all coordinated through sealed
//! contracts ([`lineage`]), cross-instrument signalling, a transactional
//! state store, and a circuit-breaker-guarded generator client. Progress
//! streams to the client as ordered, numbered NDJSON events.

pub mod agents;
pub mod emotion;
pub mod executor;
pub mod generator;
pub mod gm;
pub mod llm;
pub mod prompt;
pub mod server;
pub mod store;
pub mod stream;
pub mod styling;

pub use agents::TraceContext;
pub use store::{SharedStore, StateStore};
