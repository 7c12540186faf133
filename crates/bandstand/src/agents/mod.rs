//! The three-level agent scheduler.
//!
//! Level 1 ([`coordinator`]) runs deterministic setup, fans out one
//! instrument agent per role, and finishes with a mixing pass. Level 2
//! ([`instrument`]) drives a multi-turn LLM loop for one instrument and
//! dispatches its sections. Level 3 ([`section`]) executes one sealed
//! `(region, generate)` pipeline. Contracts flow down, events flow up
//! through the shared queue, and nothing re-interprets a layer above it.

pub mod coordinator;
pub mod dispatch;
pub mod instrument;
pub mod plan;
pub mod section;
pub mod signals;
pub mod summary;
pub mod telemetry;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use bandconf::OrchestrationSettings;

use crate::emotion::EmotionVector;
use crate::generator::GeneratorClient;
use crate::store::SharedStore;
use signals::SectionSignals;
use telemetry::TelemetryStore;

/// Per-request trace identity; stamped into execution hashes.
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub trace_id: String,
}

impl TraceContext {
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_id(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
        }
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.trace_id[..self.trace_id.len().min(8)]
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Frozen bag of dynamic state that travels alongside contracts.
///
/// Carries data the contracts cannot (raw prompt text, the derived
/// affect profile, quality preset, cross-instrument telemetry) but
/// never structural decisions. Adding drum telemetry produces a new
/// value via [`with_drum_telemetry`]; the original is never mutated.
///
/// [`with_drum_telemetry`]: RuntimeContext::with_drum_telemetry
#[derive(Debug, Clone, Default)]
pub struct RuntimeContext {
    pub raw_prompt: String,
    /// Affect profile derived from the prompt; decomposed onto the
    /// generator's tone/energy/complexity wire fields.
    pub emotion_vector: Option<EmotionVector>,
    pub quality_preset: String,
    /// Drum telemetry injected for the bass section child.
    pub drum_telemetry: Option<Value>,
    /// `section_id → drum section spec hash`, built by the coordinator
    /// when a drums role exists. Bass waits on these keys.
    pub drum_section_hashes: HashMap<String, String>,
}

impl RuntimeContext {
    pub fn with_drum_telemetry(&self, telemetry: Value) -> Self {
        Self {
            drum_telemetry: Some(telemetry),
            ..self.clone()
        }
    }
}

/// Mutable coordination primitives shared by every agent in a request.
#[derive(Clone)]
pub struct ExecutionServices {
    pub store: SharedStore,
    pub generator: Arc<GeneratorClient>,
    pub signals: Arc<SectionSignals>,
    pub telemetry: Arc<TelemetryStore>,
    pub settings: OrchestrationSettings,
}
