//! Instrument agent: Level 2 of the agent architecture.
//!
//! One independent multi-turn LLM session per instrument, running
//! concurrently with its siblings. The agent loops until every stage is
//! complete: track → one `(region, generate)` pair per section → one
//! effect. Stages are tracked by section name, never by count, so LLM
//! re-emissions cannot regenerate finished sections.
//!
//! Failure is isolated: an error marks only this agent's plan steps as
//! failed and never propagates to sibling agents.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{info, warn};

use bandproto::events::StreamEvent;
use bandproto::tools::{self, ToolCall};
use lineage::InstrumentContract;

use crate::executor::{self, resolve_variable_refs, AddNotesFailures};
use crate::llm::{ChatChunk, ChatMessage, ChatRequest, LlmError, ReasoningBuffer, ToolCallingLlm};
use crate::stream::EventSender;

use super::dispatch::{dispatch_section_children, sort_batch, split_batch};
use super::plan::PlanTracker;
use super::{ExecutionServices, RuntimeContext, TraceContext};

/// Everything one instrument agent needs to run.
pub struct InstrumentAgent {
    pub contract: InstrumentContract,
    pub runtime: RuntimeContext,
    pub services: ExecutionServices,
    pub llm: Arc<dyn ToolCallingLlm>,
    pub plan: Arc<StdMutex<PlanTracker>>,
    pub step_ids: Vec<String>,
    pub emit: EventSender,
    pub trace: TraceContext,
    /// Shared collection of `{tool, params}` records for the summary.
    pub records: Arc<StdMutex<Vec<Value>>>,
}

impl InstrumentAgent {
    pub fn agent_id(&self) -> String {
        self.contract.instrument_name.to_lowercase()
    }
}

/// Run one instrument agent to completion, emitting `agentComplete`
/// whatever happens.
pub async fn run_instrument_agent(agent: InstrumentAgent) {
    let agent_id = agent.agent_id();
    let success = match run_inner(&agent).await {
        Ok(success) => success,
        Err(e) => {
            warn!(
                trace = agent.trace.short(),
                instrument = %agent.contract.instrument_name,
                error = %e,
                "instrument agent failed"
            );
            fail_open_steps(&agent, &format!("Failed: {e}"));
            false
        }
    };
    if !success {
        fail_open_steps(&agent, "Instrument did not complete all sections");
    }
    agent.emit.send(StreamEvent::AgentComplete {
        agent_id,
        success,
    });
}

fn fail_open_steps(agent: &InstrumentAgent, reason: &str) {
    let Ok(mut plan) = agent.plan.lock() else {
        return;
    };
    for step_id in &agent.step_ids {
        if plan.is_unresolved(step_id) {
            if let Some(event) = plan.fail(step_id, reason.to_string(), Some(agent.agent_id())) {
                agent.emit.send(event);
            }
        }
    }
}

fn push_record(agent: &InstrumentAgent, record: Value) {
    if let Ok(mut records) = agent.records.lock() {
        records.push(record);
    }
}

async fn run_inner(agent: &InstrumentAgent) -> Result<bool, LlmError> {
    let contract = &agent.contract;
    let agent_id = agent.agent_id();
    let reusing = contract.reusing_track();
    let expected_sections = contract.sections.len();
    let max_turns = expected_sections.max(1) + 2;
    let max_turns = max_turns.max(3);

    // ── Stage tracking, by section name ──
    let mut stage_track = reusing;
    let mut stage_effect = false;
    let mut sections_with_region: HashSet<String> = HashSet::new();
    let mut sections_with_generate: HashSet<String> = HashSet::new();
    let mut track_id: Option<String> = contract.existing_track_id.clone();

    if let Some(step_id) = agent.step_ids.first() {
        if let Ok(mut plan) = agent.plan.lock() {
            if let Some(event) = plan.activate(step_id, Some(agent_id.clone())) {
                agent.emit.send(event);
            }
        }
    }
    if reusing {
        push_record(
            agent,
            json!({
                "tool": super::summary::REUSED_TRACK_RECORD,
                "params": {
                    "name": contract.instrument_name,
                    "trackId": contract.existing_track_id,
                },
            }),
        );
    }

    info!(
        trace = agent.trace.short(),
        instrument = %contract.instrument_name,
        role = %contract.role,
        sections = expected_sections,
        reusing,
        max_turns,
        "instrument agent starting"
    );

    let mut messages = vec![
        ChatMessage::system(system_prompt(contract)),
        ChatMessage::user(pipeline_message(contract, reusing)),
    ];
    let mut prior_results: Vec<Value> = Vec::new();
    let mut failures = AddNotesFailures::new();

    for turn in 0..max_turns {
        if turn > 0 {
            let missing = missing_stages(
                contract,
                reusing,
                stage_track,
                stage_effect,
                &sections_with_region,
                &sections_with_generate,
            );
            if missing.is_empty() {
                info!(
                    trace = agent.trace.short(),
                    instrument = %contract.instrument_name,
                    turn,
                    "all stages complete"
                );
                break;
            }
            let generate_missing = missing.iter().any(|m| m.contains(tools::GENERATE_MIDI));
            if generate_missing && agent.services.generator.circuit_open() {
                warn!(
                    trace = agent.trace.short(),
                    instrument = %contract.instrument_name,
                    "generator circuit open on retry turn, aborting"
                );
                break;
            }
            messages.push(ChatMessage::user(format!(
                "These stages are still missing; call the tools now, nothing else:\n{}",
                missing.join("\n"),
            )));
        }

        // ── LLM turn, streaming reasoning as it arrives ──
        let request = ChatRequest {
            messages: messages.clone(),
            tools: tools::INSTRUMENT_AGENT_TOOLS
                .iter()
                .map(|t| t.to_string())
                .collect(),
            max_tokens: 4000,
            reasoning_fraction: agent.services.settings.reasoning_fraction,
        };
        let mut stream = agent.llm.chat_stream(request).await?;
        let mut buffer = ReasoningBuffer::new();
        let mut emitted_reasoning = false;
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                ChatChunk::ReasoningDelta(text) => {
                    if let Some(words) = buffer.add(&text) {
                        emitted_reasoning = true;
                        agent.emit.send(StreamEvent::Reasoning {
                            content: words,
                            agent_id: Some(agent_id.clone()),
                            section_name: None,
                        });
                    }
                }
                ChatChunk::ContentDelta(_) => {}
                ChatChunk::Done { tool_calls: calls, .. } => {
                    if let Some(rest) = buffer.flush() {
                        emitted_reasoning = true;
                        agent.emit.send(StreamEvent::Reasoning {
                            content: rest,
                            agent_id: Some(agent_id.clone()),
                            section_name: None,
                        });
                    }
                    tool_calls = calls;
                }
            }
        }
        if emitted_reasoning {
            agent.emit.send(StreamEvent::ReasoningEnd {
                agent_id: agent_id.clone(),
                section_name: None,
            });
        }

        if tool_calls.is_empty() {
            info!(
                trace = agent.trace.short(),
                instrument = %contract.instrument_name,
                turn,
                "no tool calls returned, exiting loop"
            );
            break;
        }

        let sorted = sort_batch(tool_calls);
        messages.push(ChatMessage::assistant_tool_calls(sorted.clone()));
        let batch_ids: Vec<String> = sorted.iter().map(|tc| tc.id.clone()).collect();
        let mut split = split_batch(sorted);

        // ── Track creation: sequential, at most one per turn ──
        if let Some(track_tc) = split.track_calls.first() {
            if track_id.is_some() {
                prior_results.push(json!({ "trackId": track_id }));
            } else {
                let mut params = resolve_variable_refs(&track_tc.params, &prior_results);
                // The contract owns the track name; the LLM may not
                // rename the instrument.
                if let Some(obj) = params.as_object_mut() {
                    obj.insert(
                        "name".to_string(),
                        Value::String(contract.instrument_name.clone()),
                    );
                    if let Some(color) = &contract.assigned_color {
                        obj.insert("color".to_string(), Value::String(color.clone()));
                    }
                }
                let outcome = executor::apply_tool_call(
                    &track_tc.id,
                    &track_tc.name,
                    params,
                    tools::INSTRUMENT_AGENT_TOOLS,
                    &agent.services.store,
                    None,
                    None,
                    &mut failures,
                    true,
                )
                .await;
                agent
                    .emit
                    .send_all(outcome.events.iter().cloned().map(|e| e.tagged(&agent_id, None)));
                if !outcome.skipped {
                    track_id = outcome
                        .enriched_params
                        .get("trackId")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    stage_track = true;
                    push_record(agent, outcome.record(&track_tc.name));
                    for extra in &outcome.extra_records {
                        push_record(agent, extra.clone());
                    }
                }
                prior_results.push(outcome.tool_result.to_value());
            }
        }

        // ── Section children ──
        // Orphan generates still run as children: the contract rebuilds
        // the region params, and an existing region resolves
        // idempotently.
        let mut pairs = std::mem::take(&mut split.pairs);
        for generate_tc in std::mem::take(&mut split.orphan_generates) {
            pairs.push((
                ToolCall::new("", tools::ADD_MIDI_REGION, json!({})),
                generate_tc,
            ));
        }

        if !pairs.is_empty() {
            match &track_id {
                Some(track_id_value) => {
                    let stats = dispatch_section_children(
                        pairs,
                        contract,
                        track_id_value,
                        &agent.runtime,
                        &agent.services,
                        &agent_id,
                        tools::INSTRUMENT_AGENT_TOOLS,
                        Some(agent.llm.clone()),
                        &agent.emit,
                        &agent.trace,
                        &mut sections_with_region,
                        &mut sections_with_generate,
                    )
                    .await;
                    for record in &stats.records {
                        push_record(agent, record.clone());
                    }
                    for result in &stats.results {
                        prior_results.push(json!({
                            "regionId": result.region_id,
                            "sectionName": result.section_name,
                            "notesAdded": result.notes_generated,
                        }));
                    }
                }
                None => {
                    warn!(
                        trace = agent.trace.short(),
                        instrument = %contract.instrument_name,
                        "section pairs arrived before any track exists"
                    );
                }
            }
        }

        // ── Orphan regions, effects, and the rest: sequential ──
        for tc in split
            .orphan_regions
            .iter()
            .chain(split.effect_calls.iter())
            .chain(split.other_calls.iter())
        {
            let mut params = resolve_variable_refs(&tc.params, &prior_results);
            if let (Some(obj), Some(track_id_value)) = (params.as_object_mut(), &track_id) {
                obj.entry("trackId")
                    .or_insert(Value::String(track_id_value.clone()));
            }
            let outcome = executor::apply_tool_call(
                &tc.id,
                &tc.name,
                params,
                tools::INSTRUMENT_AGENT_TOOLS,
                &agent.services.store,
                None,
                None,
                &mut failures,
                true,
            )
            .await;
            agent
                .emit
                .send_all(outcome.events.iter().cloned().map(|e| e.tagged(&agent_id, None)));
            if !outcome.skipped {
                if tools::EFFECT_TOOLS.contains(&tc.name.as_str()) {
                    stage_effect = true;
                }
                if tc.name == tools::ADD_MIDI_REGION {
                    if let Some(spec) = contract
                        .sections
                        .iter()
                        .find(|s| !sections_with_region.contains(&s.name))
                    {
                        sections_with_region.insert(spec.name.clone());
                    }
                }
                push_record(agent, outcome.record(&tc.name));
            }
            prior_results.push(outcome.tool_result.to_value());
        }

        // ── Collapse child results: one summary plus short stubs ──
        // The LLM never sees raw child output, only this digest.
        for id in batch_ids {
            if id.is_empty() {
                continue;
            }
            messages.push(ChatMessage::tool_result(id, "{\"status\":\"dispatched\"}"));
        }
        messages.push(ChatMessage::assistant(progress_digest(
            contract,
            stage_track,
            stage_effect,
            &sections_with_region,
            &sections_with_generate,
        )));
    }

    // ── Success predicate ──
    let generates_completed = sections_with_generate.len();
    let success = generates_completed >= expected_sections && expected_sections > 0;

    if success {
        if let Some(step_id) = agent.step_ids.first() {
            if let Ok(mut plan) = agent.plan.lock() {
                if let Some(event) = plan.complete(
                    step_id,
                    Some(format!("{generates_completed} sections generated")),
                    Some(agent_id.clone()),
                ) {
                    agent.emit.send(event);
                }
            }
        }
    }

    info!(
        trace = agent.trace.short(),
        instrument = %contract.instrument_name,
        success,
        generates = generates_completed,
        expected = expected_sections,
        "instrument agent finished"
    );
    Ok(success)
}

fn system_prompt(contract: &InstrumentContract) -> String {
    let mut sections_text = String::new();
    for spec in &contract.sections {
        sections_text.push_str(&format!(
            "- {} [{}]: beats {}..{} ({} bars). {}",
            spec.name.to_uppercase(),
            spec.section_id,
            spec.start_beat,
            spec.start_beat + spec.duration_beats,
            spec.bars,
            spec.character,
        ));
        if !spec.role_brief.is_empty() {
            sections_text.push_str(&format!(" {} brief: {}", contract.role, spec.role_brief));
        }
        sections_text.push('\n');
    }
    let color_line = contract
        .assigned_color
        .as_deref()
        .map(|c| format!("Assigned track color: {c}.\n"))
        .unwrap_or_default();
    format!(
        "You are the {name} agent composing the {role} part of a {style} piece \
         at {tempo} BPM in {key}.\n\
         {gm}\n{color}\
         Section layout (immutable; use these exact beat values):\n{sections}\
         Rules: one add_midi_region then one generate_midi per section, in \
         order. Pass the regionId from the immediately preceding region call \
         to its generate call. Never change startBeat or durationBeats from \
         the layout above. Finish with exactly one add_insert_effect.",
        name = contract.instrument_name,
        role = contract.role,
        style = contract.style,
        tempo = contract.tempo,
        key = contract.key,
        gm = contract.gm_guidance,
        color = color_line,
        sections = sections_text,
    )
}

fn pipeline_message(contract: &InstrumentContract, reusing: bool) -> String {
    let track_step = if reusing {
        format!(
            "1. The {} track already exists (trackId='{}'); do NOT create it.",
            contract.instrument_name,
            contract.existing_track_id.as_deref().unwrap_or_default()
        )
    } else {
        format!("1. add_midi_track — create the {} track.", contract.instrument_name)
    };
    format!(
        "{track_step}\n\
         2. For each section in order: add_midi_region, then generate_midi.\n\
         3. add_insert_effect — one tasteful insert.\n\
         Batch as many tool calls as possible in a single response. No prose.",
    )
}

fn missing_stages(
    contract: &InstrumentContract,
    reusing: bool,
    stage_track: bool,
    stage_effect: bool,
    sections_with_region: &HashSet<String>,
    sections_with_generate: &HashSet<String>,
) -> Vec<String> {
    let mut missing = Vec::new();
    let track_ref = contract
        .existing_track_id
        .as_deref()
        .map(|id| format!("trackId='{id}'"))
        .unwrap_or_else(|| "$0.trackId".to_string());

    if !stage_track && !reusing {
        missing.push(format!(
            "{} — create the {} track",
            tools::ADD_MIDI_TRACK,
            contract.instrument_name
        ));
    }
    for spec in &contract.sections {
        if !sections_with_region.contains(&spec.name) {
            missing.push(format!(
                "{} — {track_ref}, startBeat={}, durationBeats={} [{}]",
                tools::ADD_MIDI_REGION,
                spec.start_beat,
                spec.duration_beats,
                spec.name.to_uppercase()
            ));
        }
        if !sections_with_generate.contains(&spec.name) {
            missing.push(format!(
                "{} — {track_ref}, role=\"{}\", bars={} [{}]",
                tools::GENERATE_MIDI,
                contract.role,
                spec.bars,
                spec.name.to_uppercase()
            ));
        }
    }
    if !stage_effect {
        missing.push(format!(
            "{} — {track_ref}, one insert effect",
            tools::ADD_INSERT_EFFECT
        ));
    }
    missing
}

fn progress_digest(
    contract: &InstrumentContract,
    stage_track: bool,
    stage_effect: bool,
    sections_with_region: &HashSet<String>,
    sections_with_generate: &HashSet<String>,
) -> String {
    let total = contract.sections.len();
    format!(
        "Progress: track {}, {}/{total} regions, {}/{total} generates, effect {}.",
        if stage_track { "done" } else { "missing" },
        sections_with_region.len(),
        sections_with_generate.len(),
        if stage_effect { "done" } else { "missing" },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract(section_names: &[&str]) -> InstrumentContract {
        let sections = section_names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                lineage::SectionSpec {
                    section_id: lineage::SectionSpec::make_id(i as u32, name),
                    name: name.to_string(),
                    index: i as u32,
                    start_beat: (i as u32) * 16,
                    duration_beats: 16,
                    bars: 4,
                    character: String::new(),
                    role_brief: String::new(),
                    contract_hash: String::new(),
                    parent_contract_hash: String::new(),
                }
                .seal()
                .unwrap()
            })
            .collect();
        InstrumentContract {
            instrument_name: "Drums".into(),
            role: "drums".into(),
            style: "house".into(),
            bars: 8,
            tempo: 124.0,
            key: "Am".into(),
            start_beat: 0,
            sections,
            existing_track_id: None,
            assigned_color: Some("#E85D75".into()),
            gm_guidance: String::new(),
            contract_hash: String::new(),
            parent_contract_hash: String::new(),
        }
        .seal("roothash")
        .unwrap()
    }

    #[test]
    fn test_missing_stages_lists_everything_initially() {
        let c = contract(&["intro", "verse"]);
        let missing = missing_stages(
            &c,
            false,
            false,
            false,
            &HashSet::new(),
            &HashSet::new(),
        );
        // track + 2 regions + 2 generates + effect
        assert_eq!(missing.len(), 6);
    }

    #[test]
    fn test_missing_stages_tracks_by_section_name() {
        let c = contract(&["intro", "verse"]);
        let mut regions = HashSet::new();
        regions.insert("intro".to_string());
        let mut generates = HashSet::new();
        generates.insert("intro".to_string());
        let missing = missing_stages(&c, false, true, true, &regions, &generates);
        assert_eq!(missing.len(), 2);
        assert!(missing.iter().all(|m| m.contains("VERSE")));
    }

    #[test]
    fn test_system_prompt_carries_immutable_layout() {
        let c = contract(&["intro", "verse"]);
        let prompt = system_prompt(&c);
        assert!(prompt.contains("beats 0..16"));
        assert!(prompt.contains("beats 16..32"));
        assert!(prompt.contains("Never change startBeat"));
    }
}
