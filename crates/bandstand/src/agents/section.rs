//! Section child: Level 3 of the agent architecture.
//!
//! Executes one pre-planned `(region, generate)` pair for one musical
//! section of one instrument. No LLM call is needed for the core
//! pipeline; the parent already decided everything and sealed it into
//! the [`SectionContract`]. The child never re-interprets the section
//! name, beat range, or role.
//!
//! For drums, the child signals completion (success or failure) so the
//! matching bass child can stop waiting. For bass, the child first
//! waits on the drum signal and injects drum telemetry into a derived
//! runtime context.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use bandproto::events::StreamEvent;
use bandproto::notes::Note;
use bandproto::tools::{self, ToolCall};
use lineage::SectionContract;

use crate::executor::{self, AddNotesFailures, CompositionContext};
use crate::llm::{ChatChunk, ChatMessage, ChatRequest, ReasoningBuffer, ToolCallingLlm};
use crate::stream::EventSender;

use super::signals::SignalError;
use super::telemetry::{compute_section_telemetry, telemetry_key};
use super::{ExecutionServices, RuntimeContext, TraceContext};

/// Prompt markers that trigger the expressive-refinement pass.
const EXPRESSIVENESS_MARKERS: &[&str] = &[
    "midiexpressiveness:",
    "automation:",
    "cc_curves:",
    "pitch_bend:",
    "sustain_pedal",
];

/// Outcome of a section child's execution, attested by the execution
/// hash binding it to both the contract and this trace.
#[derive(Debug, Default)]
pub struct SectionResult {
    pub success: bool,
    pub section_id: String,
    pub section_name: String,
    pub contract_hash: String,
    pub execution_hash: String,
    pub region_id: Option<String>,
    pub notes_generated: usize,
    pub generated_notes: Vec<Note>,
    /// `{tool, params}` records for the summary.
    pub tool_records: Vec<Value>,
    /// Tool-role replies for the parent's conversation history.
    pub tool_result_msgs: Vec<ChatMessage>,
    pub error: Option<String>,
}

impl SectionResult {
    fn for_contract(contract: &SectionContract, trace: &TraceContext) -> Self {
        Self {
            section_id: contract.section_id().to_string(),
            section_name: contract.section_name().to_string(),
            contract_hash: contract.contract_hash.clone(),
            execution_hash: contract.execution_hash(&trace.trace_id),
            ..Default::default()
        }
    }
}

/// Run one section's `(region, generate, optional refinement)` pipeline.
#[allow(clippy::too_many_arguments)]
pub async fn run_section_child(
    contract: &SectionContract,
    runtime: &RuntimeContext,
    services: &ExecutionServices,
    agent_id: &str,
    allow_set: &[&str],
    previous_notes: Option<Vec<Note>>,
    region_tc_id: &str,
    generate_tc_id: &str,
    llm: Option<Arc<dyn ToolCallingLlm>>,
    emit: &EventSender,
    trace: &TraceContext,
) -> SectionResult {
    let mut result = SectionResult::for_contract(contract, trace);
    let section_name = contract.section_name().to_string();
    let section_id = contract.section_id().to_string();
    let mut failures = AddNotesFailures::new();

    info!(
        trace = trace.short(),
        instrument = %contract.instrument_name,
        section = %section_name,
        start_beat = contract.start_beat(),
        duration_beats = contract.duration_beats(),
        "section child starting"
    );

    emit.send(StreamEvent::Status {
        message: format!("Starting {} / {}", contract.instrument_name, section_name),
        agent_id: Some(agent_id.to_string()),
        section_name: Some(section_name.clone()),
    });

    // ── Bass: wait for the matching drum section, then read telemetry ──
    let mut runtime = runtime.clone();
    if contract.is_bass() {
        if let Some(drum_hash) = runtime.drum_section_hashes.get(&section_id).cloned() {
            let timeout = Duration::from_secs(services.settings.bass_signal_wait_secs);
            match services
                .signals
                .wait_for(&section_id, &drum_hash, timeout)
                .await
            {
                Ok(Some(signal)) if signal.success => {
                    info!(
                        trace = trace.short(),
                        section = %section_name,
                        drum_notes = signal.drum_notes.as_ref().map(Vec::len).unwrap_or(0),
                        "drum section ready"
                    );
                    let key = telemetry_key("Drums", &section_id);
                    if let Some(telemetry) = services.telemetry.get(&key).await {
                        match serde_json::to_value(&telemetry) {
                            Ok(value) => {
                                runtime = runtime.with_drum_telemetry(value);
                                info!(
                                    trace = trace.short(),
                                    section = %section_name,
                                    energy = telemetry.energy_level,
                                    density = telemetry.density_score,
                                    "drum telemetry injected"
                                );
                            }
                            Err(e) => warn!(error = %e, "failed to encode drum telemetry"),
                        }
                    }
                }
                Ok(Some(_)) => {
                    warn!(
                        trace = trace.short(),
                        section = %section_name,
                        "drum section failed; bass proceeds without spine"
                    );
                }
                Ok(None) => {}
                Err(SignalError::Timeout { key }) => {
                    // Non-fatal: proceed without the drum spine.
                    error!(
                        trace = trace.short(),
                        key = %key,
                        "bass wait timed out; drum section never signalled"
                    );
                }
                Err(e @ SignalError::ProtocolViolation { .. }) => {
                    error!(
                        trace = trace.short(),
                        section = %section_name,
                        error = %e,
                        "signal protocol violation"
                    );
                    result.error = Some(e.to_string());
                    return result;
                }
            }
        }
    }

    // ── Region creation, exclusively from the contract ──
    let region_name = if contract.region_name.is_empty() {
        format!("{} {}", contract.instrument_name, section_name)
    } else {
        contract.region_name.clone()
    };
    let region_params = json!({
        "trackId": contract.track_id,
        "startBeat": contract.start_beat(),
        "durationBeats": contract.duration_beats(),
        "name": region_name,
    });
    let region_outcome = executor::apply_tool_call(
        region_tc_id,
        tools::ADD_MIDI_REGION,
        region_params,
        allow_set,
        &services.store,
        Some(&services.generator),
        None,
        &mut failures,
        true,
    )
    .await;
    emit.send_all(
        region_outcome
            .events
            .iter()
            .cloned()
            .map(|e| e.tagged(agent_id, Some(&section_name))),
    );
    result
        .tool_records
        .push(region_outcome.record(tools::ADD_MIDI_REGION));
    result.tool_result_msgs.push(region_outcome.msg_result.clone());

    let region_id = region_outcome
        .enriched_params
        .get("regionId")
        .and_then(Value::as_str)
        .map(str::to_string);
    let Some(region_id) = region_id else {
        result.error = Some(format!("Region creation failed for {section_name}"));
        warn!(trace = trace.short(), section = %section_name, "region creation failed");
        if contract.is_drum() {
            services
                .signals
                .signal_complete(&section_id, &contract.section.contract_hash, false, None);
        }
        return result;
    };
    result.region_id = Some(region_id.clone());

    // ── Generation, parameters from the contract ──
    let context = CompositionContext {
        style: contract.style.clone(),
        tempo: contract.tempo as u32,
        bars: contract.bars(),
        key: contract.key.clone(),
        quality_preset: runtime.quality_preset.clone(),
        composition_id: Some(contract.contract_hash.clone()),
        emotion_vector: runtime.emotion_vector,
        previous_notes,
        drum_telemetry: runtime.drum_telemetry.clone(),
    };
    let gen_params = json!({
        "role": contract.role,
        "style": contract.style,
        "tempo": contract.tempo,
        "bars": contract.bars(),
        "key": contract.key,
        "trackId": contract.track_id,
        "regionId": region_id,
        "startBeat": contract.start_beat(),
    });
    let gen_outcome = executor::apply_tool_call(
        generate_tc_id,
        tools::GENERATE_MIDI,
        gen_params,
        allow_set,
        &services.store,
        Some(&services.generator),
        Some(&context),
        &mut failures,
        true,
    )
    .await;
    emit.send_all(
        gen_outcome
            .events
            .iter()
            .cloned()
            .map(|e| e.tagged(agent_id, Some(&section_name))),
    );
    result
        .tool_records
        .push(gen_outcome.record(tools::GENERATE_MIDI));
    result.tool_result_msgs.push(gen_outcome.msg_result.clone());

    if gen_outcome.skipped {
        let message = match &gen_outcome.tool_result {
            executor::ToolResult::Error { error, .. } => error.clone(),
            _ => "Generation failed".to_string(),
        };
        warn!(
            trace = trace.short(),
            section = %section_name,
            error = %message,
            "generation failed"
        );
        result.error = Some(message);
        if contract.is_drum() {
            services
                .signals
                .signal_complete(&section_id, &contract.section.contract_hash, false, None);
        }
        return result;
    }

    result.generated_notes = gen_outcome.generated_notes.clone();
    result.notes_generated = result.generated_notes.len();
    result.success = true;

    // ── Telemetry, then drum signal (store-before-signal ordering) ──
    if !result.generated_notes.is_empty() {
        let telemetry = compute_section_telemetry(
            &result.generated_notes,
            contract.tempo,
            &contract.instrument_name,
            &section_id,
            contract.duration_beats() as f64,
        );
        services
            .telemetry
            .set(
                telemetry_key(&contract.instrument_name, &section_id),
                telemetry,
            )
            .await;
    }
    if contract.is_drum() {
        services.signals.signal_complete(
            &section_id,
            &contract.section.contract_hash,
            true,
            Some(result.generated_notes.clone()),
        );
        info!(
            trace = trace.short(),
            section = %section_name,
            notes = result.notes_generated,
            "drum section signalled"
        );
    }

    emit.send(StreamEvent::Status {
        message: format!(
            "{} / {}: {} notes generated",
            contract.instrument_name, section_name, result.notes_generated
        ),
        agent_id: Some(agent_id.to_string()),
        section_name: Some(section_name.clone()),
    });

    // ── Optional expressive refinement ──
    if let Some(llm) = llm {
        if wants_expressive_refinement(&runtime.raw_prompt) {
            refine_expression(
                contract,
                &runtime,
                services,
                agent_id,
                &region_id,
                llm.as_ref(),
                emit,
                trace,
                &mut result,
            )
            .await;
        }
    }

    info!(
        trace = trace.short(),
        section = %section_name,
        success = result.success,
        notes = result.notes_generated,
        "section child complete"
    );
    result
}

fn wants_expressive_refinement(raw_prompt: &str) -> bool {
    let lower = raw_prompt.to_lowercase();
    EXPRESSIVENESS_MARKERS.iter().any(|m| lower.contains(m))
}

/// Add CC curves and pitch bends via a small streamed LLM call limited
/// to the expressive tool set. Failures here are non-fatal.
#[allow(clippy::too_many_arguments)]
async fn refine_expression(
    contract: &SectionContract,
    runtime: &RuntimeContext,
    services: &ExecutionServices,
    agent_id: &str,
    region_id: &str,
    llm: &dyn ToolCallingLlm,
    emit: &EventSender,
    trace: &TraceContext,
    result: &mut SectionResult,
) {
    let section_name = contract.section_name();
    emit.send(StreamEvent::Status {
        message: format!(
            "Adding expression to {} / {}",
            contract.instrument_name, section_name
        ),
        agent_id: Some(agent_id.to_string()),
        section_name: Some(section_name.to_string()),
    });

    let system = format!(
        "You are a MIDI expression agent for the {} section of the {} track.\n\
         Context: {} | {} BPM | {}\n\
         Section: {} bars starting at beat {}, {} notes present.\n\
         trackId='{}', regionId='{}'.\n\
         The composer wrote:\n{}\n\
         Briefly explain what expression you'll add, then make 1-3 tool \
         calls for CC curves and/or pitch bends.",
        section_name.to_uppercase(),
        contract.instrument_name,
        contract.style,
        contract.tempo,
        contract.key,
        contract.bars(),
        contract.start_beat(),
        result.notes_generated,
        contract.track_id,
        region_id,
        runtime.raw_prompt,
    );
    let request = ChatRequest {
        messages: vec![
            ChatMessage::system(system),
            ChatMessage::user("Add expression now.".to_string()),
        ],
        tools: tools::REFINEMENT_TOOLS.iter().map(|t| t.to_string()).collect(),
        max_tokens: 1000,
        reasoning_fraction: services.settings.reasoning_fraction,
    };

    let mut stream = match llm.chat_stream(request).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                trace = trace.short(),
                section = %section_name,
                error = %e,
                "expression refinement failed (non-fatal)"
            );
            return;
        }
    };

    let mut buffer = ReasoningBuffer::new();
    let mut emitted_reasoning = false;
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            ChatChunk::ReasoningDelta(text) => {
                if let Some(words) = buffer.add(&text) {
                    emitted_reasoning = true;
                    emit.send(StreamEvent::Reasoning {
                        content: words,
                        agent_id: Some(agent_id.to_string()),
                        section_name: Some(section_name.to_string()),
                    });
                }
            }
            ChatChunk::ContentDelta(_) => {
                if let Some(rest) = buffer.flush() {
                    emitted_reasoning = true;
                    emit.send(StreamEvent::Reasoning {
                        content: rest,
                        agent_id: Some(agent_id.to_string()),
                        section_name: Some(section_name.to_string()),
                    });
                }
            }
            ChatChunk::Done { tool_calls: calls, .. } => {
                if let Some(rest) = buffer.flush() {
                    emitted_reasoning = true;
                    emit.send(StreamEvent::Reasoning {
                        content: rest,
                        agent_id: Some(agent_id.to_string()),
                        section_name: Some(section_name.to_string()),
                    });
                }
                tool_calls = calls;
            }
        }
    }
    if emitted_reasoning {
        emit.send(StreamEvent::ReasoningEnd {
            agent_id: agent_id.to_string(),
            section_name: Some(section_name.to_string()),
        });
    }

    let mut failures = AddNotesFailures::new();
    let applied = tool_calls.len();
    for tc in tool_calls {
        let mut params = tc.params.clone();
        if let Some(obj) = params.as_object_mut() {
            obj.insert("trackId".to_string(), Value::String(contract.track_id.clone()));
            obj.insert("regionId".to_string(), Value::String(region_id.to_string()));
        }
        let tc_id = if tc.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            tc.id.clone()
        };
        let outcome = executor::apply_tool_call(
            &tc_id,
            &tc.name,
            params,
            tools::REFINEMENT_TOOLS,
            &services.store,
            None,
            None,
            &mut failures,
            true,
        )
        .await;
        emit.send_all(
            outcome
                .events
                .iter()
                .cloned()
                .map(|e| e.tagged(agent_id, Some(section_name))),
        );
        if !outcome.skipped {
            result.tool_records.push(outcome.record(&tc.name));
        }
    }
    if applied > 0 {
        info!(
            trace = trace.short(),
            section = %section_name,
            calls = applied,
            "expression refinement applied"
        );
    }
}
