//! bandproto - Protocol types for the Bandstand composition orchestrator.
//!
//! This crate defines the shapes exchanged at Bandstand's boundaries:
//! the newline-delimited JSON event stream the client consumes, the
//! internal tool vocabulary, the musical value types, and the wire
//! format of the external generator service.

pub mod events;
pub mod generator;
pub mod notes;
pub mod tools;

pub use events::{
    CompositionSummary, PlanStep, SequencedEvent, StepStatus, StreamEvent, TrackSummary,
};
pub use generator::{
    GeneratorResult, JobStatus, JobWaitResponse, RawJobResult, RawToolCall, SubmitRequest,
    SubmitResponse,
};
pub use notes::{Aftertouch, AutomationPoint, ControllerEvent, EffectRef, Note, PitchBend};
pub use tools::{phase_for_tool, Phase, ToolCall};
