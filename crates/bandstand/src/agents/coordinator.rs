//! Coordinator: Level 1 of the agent architecture.
//!
//! Three phases: deterministic setup (tempo/key, no LLM), parallel
//! instrument agents under sealed contracts, then a single mixing LLM
//! call with a restricted tool set. Drums run to completion before the
//! other instruments launch so drum telemetry exists before bass starts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use bandproto::events::StreamEvent;
use bandproto::tools;
use lineage::{CompositionContract, HashError, InstrumentContract};

use crate::emotion::emotion_vector_from_prompt;
use crate::executor::{self, resolve_variable_refs, AddNotesFailures};
use crate::llm::{ChatMessage, ChatRequest, LlmError, ToolCallingLlm};
use crate::prompt::{build_section_specs, specs_for_role, ParsedPrompt};
use crate::store::SharedStore;
use crate::stream::EventSender;
use crate::{gm, styling};

use super::instrument::{run_instrument_agent, InstrumentAgent};
use super::plan::{instrument_label, PlanTracker};
use super::signals::SectionSignals;
use super::summary::{build_summary, track_names};
use super::telemetry::TelemetryStore;
use super::{ExecutionServices, RuntimeContext, TraceContext};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Hash(#[from] HashError),

    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Inputs for one composition run.
pub struct CompositionRun {
    pub parsed: ParsedPrompt,
    pub raw_prompt: String,
    pub llm: Arc<dyn ToolCallingLlm>,
    pub store: SharedStore,
    pub generator: Arc<crate::generator::GeneratorClient>,
    pub settings: bandconf::OrchestrationSettings,
    pub emit: EventSender,
    pub trace: TraceContext,
}

/// Run a full composition. Any coordinator-level error becomes a final
/// `error` event; agent-level failures are already isolated below.
pub async fn run_composition(run: CompositionRun) {
    let emit = run.emit.clone();
    if let Err(e) = run_phases(run).await {
        error!(error = %e, "coordinator failed");
        emit.send(StreamEvent::Error {
            message: Some(e.to_string()),
            error: Some(e.to_string()),
        });
    }
}

async fn run_phases(run: CompositionRun) -> Result<(), CoordinatorError> {
    let CompositionRun {
        parsed,
        raw_prompt,
        llm,
        store,
        generator,
        settings,
        emit,
        trace,
    } = run;

    emit.send(StreamEvent::Status {
        message: "Preparing composition...".to_string(),
        agent_id: None,
        section_name: None,
    });

    let (project_tempo, project_key, existing_tracks) = {
        let guard = store.lock().await;
        let tracks: HashMap<String, (String, u32)> = guard
            .registry()
            .list_tracks()
            .iter()
            .map(|t| {
                let next_beat = guard
                    .registry()
                    .regions_for_track(&t.id)
                    .iter()
                    .map(|r| (r.start_beat + r.duration_beats) as u32)
                    .max()
                    .unwrap_or(0);
                (t.name.to_lowercase(), (t.id.clone(), next_beat))
            })
            .collect();
        (guard.tempo(), guard.key().to_string(), tracks)
    };

    let plan = Arc::new(StdMutex::new(PlanTracker::build_from_prompt(
        &parsed,
        project_tempo,
        &project_key,
    )));
    {
        let tracker = plan.lock().expect("plan lock");
        if !tracker.is_empty() {
            emit.send(tracker.to_plan_event());
        }
        // Preflight: one event per expected instrument step so the
        // client can pre-allocate rows before any agent produces
        // output. Colours are allocated by role index from the fixed
        // palette; the contracts sealed below carry the same values.
        for (i, role) in parsed.roles.iter().enumerate() {
            let name = instrument_label(role);
            for step_id in tracker.step_ids_for_instrument(&name) {
                if let Some(step) = tracker.steps().iter().find(|s| s.step_id == step_id) {
                    emit.send(StreamEvent::Preflight {
                        step_id: step.step_id.clone(),
                        agent_id: name.to_lowercase(),
                        agent_role: role.clone(),
                        label: step.label.clone(),
                        track_color: styling::color_for_index(i).to_string(),
                    });
                }
            }
        }
    }

    let records: Arc<StdMutex<Vec<Value>>> = Arc::new(StdMutex::new(Vec::new()));
    let mut failures = AddNotesFailures::new();

    // ── Phase 1: deterministic setup, no LLM ──
    if let Some(tempo) = parsed.tempo.filter(|t| *t != project_tempo) {
        apply_setup_tool(
            tools::SET_TEMPO,
            json!({ "tempo": tempo }),
            &plan,
            &store,
            &records,
            &mut failures,
            &emit,
        )
        .await;
    }
    if let Some(key) = parsed
        .key
        .clone()
        .filter(|k| !k.trim().eq_ignore_ascii_case(project_key.trim()))
    {
        apply_setup_tool(
            tools::SET_KEY,
            json!({ "key": key }),
            &plan,
            &store,
            &records,
            &mut failures,
            &emit,
        )
        .await;
    }

    // ── Phase 2: sealed contracts, then parallel instruments ──
    let style = if parsed.style.is_empty() {
        "default".to_string()
    } else {
        parsed.style.clone()
    };
    let bars = parsed.total_bars();
    let tempo = parsed.tempo.unwrap_or(project_tempo) as f64;
    let key = parsed.key.clone().unwrap_or(project_key);
    info!(
        trace = trace.short(),
        style = %style,
        bars,
        tempo,
        key = %key,
        roles = ?parsed.roles,
        "composition parameters"
    );

    let base_sections = build_section_specs(&parsed, bars)?;
    let composition = CompositionContract {
        composition_id: Uuid::new_v4().to_string(),
        sections: base_sections.clone(),
        style: style.clone(),
        tempo,
        key: key.clone(),
        contract_hash: String::new(),
        parent_contract_hash: String::new(),
    }
    .seal()?;

    let mut instrument_contracts: Vec<InstrumentContract> = Vec::new();
    for (i, role) in parsed.roles.iter().enumerate() {
        let name = instrument_label(role);
        let existing = existing_tracks.get(&name.to_lowercase());
        let contract = InstrumentContract {
            instrument_name: name.clone(),
            role: role.clone(),
            style: style.clone(),
            bars,
            tempo,
            key: key.clone(),
            start_beat: existing.map(|(_, beat)| *beat).unwrap_or(0),
            sections: specs_for_role(&base_sections, role)?,
            existing_track_id: existing.map(|(id, _)| id.clone()),
            assigned_color: Some(styling::color_for_index(i).to_string()),
            gm_guidance: gm::guidance_for_role(role),
            contract_hash: String::new(),
            parent_contract_hash: String::new(),
        }
        .seal(&composition.contract_hash)?;
        info!(
            trace = trace.short(),
            instrument = %contract.instrument_name,
            contract = %contract.contract_hash,
            reusing = contract.reusing_track(),
            "instrument contract sealed"
        );
        instrument_contracts.push(contract);
    }

    // Signal keys come from the drum instrument's sealed section specs;
    // bass receives the same hashes through the runtime context.
    let drum_contract = instrument_contracts.iter().find(|c| c.is_drum());
    let mut drum_section_hashes = HashMap::new();
    let signals = match drum_contract {
        Some(drums) => {
            let keys: Vec<(String, String)> = drums
                .sections
                .iter()
                .map(|s| (s.section_id.clone(), s.contract_hash.clone()))
                .collect();
            for (section_id, hash) in &keys {
                drum_section_hashes.insert(section_id.clone(), hash.clone());
            }
            Arc::new(SectionSignals::from_section_ids(&keys))
        }
        None => Arc::new(SectionSignals::default()),
    };

    // Affect derivation prefers the raw prompt (the composer's own
    // words); the parsed request text is the fallback for callers that
    // only send structured fields.
    let affect_source = if raw_prompt.is_empty() {
        parsed.request.as_str()
    } else {
        raw_prompt.as_str()
    };
    let emotion_vector = emotion_vector_from_prompt(affect_source);
    info!(
        trace = trace.short(),
        brightness = emotion_vector.tone_brightness,
        warmth = emotion_vector.tone_warmth,
        intensity = emotion_vector.energy_intensity,
        excitement = emotion_vector.energy_excitement,
        complexity = emotion_vector.complexity,
        "affect profile derived"
    );

    let runtime = RuntimeContext {
        raw_prompt,
        emotion_vector: Some(emotion_vector),
        quality_preset: parsed
            .quality_preset
            .clone()
            .unwrap_or_else(|| "quality".to_string()),
        drum_telemetry: None,
        drum_section_hashes,
    };
    let services = ExecutionServices {
        store: store.clone(),
        generator: generator.clone(),
        signals,
        telemetry: Arc::new(TelemetryStore::new()),
        settings,
    };

    let make_agent = |contract: InstrumentContract| -> InstrumentAgent {
        let step_ids = plan
            .lock()
            .expect("plan lock")
            .step_ids_for_instrument(&contract.instrument_name);
        InstrumentAgent {
            contract,
            runtime: runtime.clone(),
            services: services.clone(),
            llm: llm.clone(),
            plan: plan.clone(),
            step_ids,
            emit: emit.clone(),
            trace: trace.clone(),
            records: records.clone(),
        }
    };

    // ── Phase 2a: drums first, for bass coupling ──
    let mut remaining: Vec<InstrumentContract> = Vec::new();
    for contract in instrument_contracts {
        if contract.is_drum() {
            info!(trace = trace.short(), "running drums before siblings");
            run_instrument_agent(make_agent(contract)).await;
        } else {
            remaining.push(contract);
        }
    }

    // ── Phase 2b: remaining instruments in parallel ──
    let mut handles = Vec::new();
    for contract in remaining {
        let agent = make_agent(contract);
        let name = agent.contract.instrument_name.clone();
        handles.push((name, tokio::spawn(run_instrument_agent(agent))));
    }
    for (name, handle) in handles {
        if let Err(e) = handle.await {
            // A panicked agent bypassed its own failsafe; make sure no
            // plan step is left in limbo.
            error!(
                trace = trace.short(),
                instrument = %name,
                error = %e,
                "instrument agent task crashed"
            );
            let mut tracker = plan.lock().expect("plan lock");
            for step_id in tracker.step_ids_for_instrument(&name) {
                if tracker.is_unresolved(&step_id) {
                    if let Some(event) =
                        tracker.fail(&step_id, format!("Crashed: {e}"), Some(name.to_lowercase()))
                    {
                        emit.send(event);
                    }
                }
            }
        }
    }
    info!(trace = trace.short(), "all instrument agents complete");

    // ── Phase 3: mixing coordinator, one restricted LLM call ──
    let mixing_steps = plan.lock().expect("plan lock").pending_mixing_steps();
    if !mixing_steps.is_empty() {
        if let Err(e) = run_mixing_pass(
            &llm, &store, &plan, &mixing_steps, &records, &emit, &trace,
        )
        .await
        {
            warn!(trace = trace.short(), error = %e, "mixing pass failed");
        }
    }

    // ── Finalize ──
    for event in plan.lock().expect("plan lock").finalize_pending_as_skipped() {
        emit.send(event);
    }

    let collected = records.lock().expect("records lock").clone();
    let summary = build_summary(&collected, &style, tempo, &key);
    emit.send(StreamEvent::Summary {
        tracks: track_names(&summary),
        regions: summary.regions_created,
        notes: summary.notes_generated,
        effects: summary.effect_count,
    });
    emit.send(StreamEvent::SummaryFinal {
        trace_id: trace.trace_id.clone(),
        summary: summary.clone(),
    });

    // An attempted composition that produced zero notes is a failure;
    // a pure setup/mixing run (no regions) is not.
    let success = summary.notes_generated > 0 || summary.regions_created == 0;
    let state_version = store.lock().await.version();
    emit.send(StreamEvent::Complete {
        success,
        tool_calls: collected,
        state_version,
        trace_id: trace.trace_id.clone(),
        usage: None,
    });
    Ok(())
}

async fn apply_setup_tool(
    tool: &str,
    params: Value,
    plan: &Arc<StdMutex<PlanTracker>>,
    store: &SharedStore,
    records: &Arc<StdMutex<Vec<Value>>>,
    failures: &mut AddNotesFailures,
    emit: &EventSender,
) {
    let step_id = plan
        .lock()
        .expect("plan lock")
        .find_step(tool)
        .map(|s| s.step_id.clone());
    if let Some(step_id) = &step_id {
        if let Some(event) = plan.lock().expect("plan lock").activate(step_id, None) {
            emit.send(event);
        }
    }

    let outcome = executor::apply_tool_call(
        &Uuid::new_v4().to_string(),
        tool,
        params,
        tools::SETUP_TOOLS,
        store,
        None,
        None,
        failures,
        true,
    )
    .await;
    emit.send_all(outcome.events.iter().cloned());

    if !outcome.skipped {
        records
            .lock()
            .expect("records lock")
            .push(outcome.record(tool));
        if let Some(step_id) = &step_id {
            if let Some(event) = plan.lock().expect("plan lock").complete(step_id, None, None) {
                emit.send(event);
            }
        }
    }
}

/// Phase 3: one LLM call restricted to the mixing tool set, applied
/// sequentially with the usual variable-ref resolution.
async fn run_mixing_pass(
    llm: &Arc<dyn ToolCallingLlm>,
    store: &SharedStore,
    plan: &Arc<StdMutex<PlanTracker>>,
    mixing_steps: &[String],
    records: &Arc<StdMutex<Vec<Value>>>,
    emit: &EventSender,
    trace: &TraceContext,
) -> Result<(), LlmError> {
    let manifest = {
        let guard = store.lock().await;
        let tracks: Vec<Value> = guard
            .registry()
            .list_tracks()
            .iter()
            .map(|t| json!({ "name": t.name, "trackId": t.id }))
            .collect();
        json!({ "tracks": tracks })
    };

    let prompt = format!(
        "All instrument tracks have been created. Apply final mixing: \
         shared buses and sends where useful, then volume and pan for \
         balance.\n\nCurrent entity IDs:\n{manifest}\n\n\
         Batch ALL mixing tool calls in a single response. No text."
    );

    if let Some(step_id) = mixing_steps.first() {
        if let Some(event) = plan.lock().expect("plan lock").activate(step_id, None) {
            emit.send(event);
        }
    }

    let response = llm
        .chat(ChatRequest {
            messages: vec![
                ChatMessage::system("You are the mixing coordinator.".to_string()),
                ChatMessage::user(prompt),
            ],
            tools: tools::MIXING_COORDINATOR_TOOLS
                .iter()
                .map(|t| t.to_string())
                .collect(),
            max_tokens: 2000,
            reasoning_fraction: 0.0,
        })
        .await?;

    let mut prior_results: Vec<Value> = Vec::new();
    let mut failures = AddNotesFailures::new();
    let mut applied = 0usize;
    for tc in &response.tool_calls {
        let params = resolve_variable_refs(&tc.params, &prior_results);
        let outcome = executor::apply_tool_call(
            &tc.id,
            &tc.name,
            params,
            tools::MIXING_COORDINATOR_TOOLS,
            store,
            None,
            None,
            &mut failures,
            true,
        )
        .await;
        emit.send_all(outcome.events.iter().cloned());
        if !outcome.skipped {
            applied += 1;
            records
                .lock()
                .expect("records lock")
                .push(outcome.record(&tc.name));
        }
        prior_results.push(outcome.tool_result.to_value());
    }

    if let Some(step_id) = mixing_steps.first() {
        let mut tracker = plan.lock().expect("plan lock");
        let event = if applied > 0 {
            tracker.complete(step_id, Some(format!("{applied} mixing moves")), None)
        } else {
            tracker.fail(step_id, "No mixing calls applied".to_string(), None)
        };
        if let Some(event) = event {
            emit.send(event);
        }
    }
    info!(trace = trace.short(), applied, "mixing pass complete");
    Ok(())
}
