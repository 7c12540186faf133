//! Outbound stream events.
//!
//! Every record the client sees is one of these, serialized as a JSON
//! object with a `type` tag. The multiplexer wraps events in
//! [`SequencedEvent`] to stamp the per-connection `seq` at drain time;
//! producers never assign sequence numbers themselves.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::Phase;

/// Lifecycle of an externally-visible plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Skipped,
}

/// One predicted unit of progress in the up-front plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub step_id: String,
    pub label: String,
    pub status: StepStatus,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
}

/// Aggregate counts for the end-of-run summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionSummary {
    pub tracks_created: Vec<TrackSummary>,
    pub tracks_reused: Vec<TrackSummary>,
    pub regions_created: usize,
    pub notes_generated: usize,
    pub effect_count: usize,
    pub style: String,
    pub tempo: f64,
    pub key: String,
}

/// One track line in the summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSummary {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_id: Option<String>,
}

/// All event records on the outbound stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "plan", rename_all = "camelCase")]
    Plan {
        plan_id: String,
        title: String,
        steps: Vec<PlanStep>,
    },

    #[serde(rename = "planStepUpdate", rename_all = "camelCase")]
    PlanStepUpdate {
        step_id: String,
        status: StepStatus,
        phase: Phase,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
    },

    #[serde(rename = "preflight", rename_all = "camelCase")]
    Preflight {
        step_id: String,
        agent_id: String,
        agent_role: String,
        label: String,
        track_color: String,
    },

    #[serde(rename = "toolStart", rename_all = "camelCase")]
    ToolStart {
        name: String,
        label: String,
        phase: Phase,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        section_name: Option<String>,
    },

    #[serde(rename = "toolCall", rename_all = "camelCase")]
    ToolCall {
        id: String,
        name: String,
        label: String,
        phase: Phase,
        params: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        section_name: Option<String>,
    },

    #[serde(rename = "toolError", rename_all = "camelCase")]
    ToolError {
        name: String,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        section_name: Option<String>,
    },

    #[serde(rename = "generatorStart", rename_all = "camelCase")]
    GeneratorStart {
        role: String,
        agent_id: String,
        style: String,
        bars: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        start_beat: Option<f64>,
    },

    #[serde(rename = "generatorComplete", rename_all = "camelCase")]
    GeneratorComplete {
        role: String,
        agent_id: String,
        note_count: usize,
        duration_ms: u64,
    },

    #[serde(rename = "reasoning", rename_all = "camelCase")]
    Reasoning {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        section_name: Option<String>,
    },

    #[serde(rename = "reasoningEnd", rename_all = "camelCase")]
    ReasoningEnd {
        agent_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        section_name: Option<String>,
    },

    #[serde(rename = "status", rename_all = "camelCase")]
    Status {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        section_name: Option<String>,
    },

    #[serde(rename = "agentComplete", rename_all = "camelCase")]
    AgentComplete { agent_id: String, success: bool },

    #[serde(rename = "summary", rename_all = "camelCase")]
    Summary {
        tracks: Vec<String>,
        regions: usize,
        notes: usize,
        effects: usize,
    },

    #[serde(rename = "summary.final", rename_all = "camelCase")]
    SummaryFinal {
        trace_id: String,
        #[serde(flatten)]
        summary: CompositionSummary,
    },

    #[serde(rename = "complete", rename_all = "camelCase")]
    Complete {
        success: bool,
        tool_calls: Vec<Value>,
        state_version: u64,
        trace_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Value>,
    },

    #[serde(rename = "error", rename_all = "camelCase")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl StreamEvent {
    /// True for events that carry agent scoping when emitted from within
    /// an agent's frame.
    pub fn is_agent_scoped(&self) -> bool {
        matches!(
            self,
            StreamEvent::ToolStart { .. }
                | StreamEvent::ToolCall { .. }
                | StreamEvent::ToolError { .. }
                | StreamEvent::GeneratorStart { .. }
                | StreamEvent::GeneratorComplete { .. }
                | StreamEvent::Reasoning { .. }
                | StreamEvent::ReasoningEnd { .. }
                | StreamEvent::Status { .. }
                | StreamEvent::AgentComplete { .. }
        )
    }

    /// Stamp `agentId` (and optionally `sectionName`) onto an
    /// agent-scoped event, leaving other events untouched. Generator
    /// events keep their own `agentId = role` tagging.
    pub fn tagged(mut self, agent: &str, section: Option<&str>) -> StreamEvent {
        match &mut self {
            StreamEvent::ToolStart {
                agent_id,
                section_name,
                ..
            }
            | StreamEvent::ToolCall {
                agent_id,
                section_name,
                ..
            }
            | StreamEvent::ToolError {
                agent_id,
                section_name,
                ..
            }
            | StreamEvent::Reasoning {
                agent_id,
                section_name,
                ..
            }
            | StreamEvent::Status {
                agent_id,
                section_name,
                ..
            } => {
                *agent_id = Some(agent.to_string());
                if let Some(sec) = section {
                    *section_name = Some(sec.to_string());
                }
            }
            _ => {}
        }
        self
    }
}

/// An event with its per-connection sequence number stamped on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub seq: u64,
    #[serde(flatten)]
    pub event: StreamEvent,
}
