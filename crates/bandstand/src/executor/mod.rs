//! Tool executor: validates and applies one tool invocation.
//!
//! The executor is the only path between an agent's tool batch and the
//! state store. It validates arguments, resolves names to ids, creates
//! entities inside the ambient transaction, routes generator tools to
//! the external service, and returns everything the caller needs:
//! outbound events, LLM conversation messages, and a typed result.

pub mod refs;
pub mod validate;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use bandproto::events::StreamEvent;
use bandproto::generator::SubmitRequest;
use bandproto::notes::{ControllerEvent, Note, PitchBend};
use bandproto::tools::{self, phase_for_tool};

use crate::emotion::EmotionVector;
use crate::generator::GeneratorClient;
use crate::llm::ChatMessage;
use crate::store::SharedStore;
use crate::styling;

pub use refs::resolve_variable_refs;
pub use validate::{validate_tool_call, Validation};

/// Consecutive per-region `add_notes` failures tolerated before the
/// executor fails fast with an educational error.
const ADD_NOTES_FAILURE_LIMIT: u32 = 3;

/// Generation results with fewer notes than this are logged as probable
/// failures.
const MIN_NOTES_THRESHOLD: usize = 4;

/// Per-region consecutive `add_notes` failure counters.
pub type AddNotesFailures = HashMap<String, u32>;

/// Generation parameters threaded from the contracts to the generator.
#[derive(Debug, Clone, Default)]
pub struct CompositionContext {
    pub style: String,
    pub tempo: u32,
    pub bars: u32,
    pub key: String,
    pub quality_preset: String,
    pub composition_id: Option<String>,
    /// Affect profile from the prompt, decomposed onto the generator's
    /// tone/energy/complexity fields.
    pub emotion_vector: Option<EmotionVector>,
    /// Notes from the previous section of the same instrument, seeding
    /// musical continuity.
    pub previous_notes: Option<Vec<Note>>,
    /// Drum telemetry injected for bass coupling.
    pub drum_telemetry: Option<Value>,
}

/// Typed result of one tool call, serialized flat so `$N.field`
/// references resolve against its camelCase field names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResult {
    #[serde(rename_all = "camelCase")]
    TrackCreated {
        track_id: String,
        name: String,
        reused: bool,
    },
    #[serde(rename_all = "camelCase")]
    RegionCreated {
        region_id: String,
        track_id: String,
        idempotent: bool,
    },
    #[serde(rename_all = "camelCase")]
    RegionDuplicated {
        new_region_id: String,
        region_id: String,
    },
    #[serde(rename_all = "camelCase")]
    BusEnsured { bus_id: String, name: String },
    #[serde(rename_all = "camelCase")]
    NotesAdded {
        region_id: String,
        notes_added: usize,
    },
    #[serde(rename_all = "camelCase")]
    Generated {
        region_id: String,
        track_id: String,
        notes_added: usize,
        cc_events: usize,
        pitch_bends: usize,
    },
    #[serde(rename_all = "camelCase")]
    TempoSet { tempo: u32 },
    #[serde(rename_all = "camelCase")]
    KeySet { key: String },
    #[serde(rename_all = "camelCase")]
    EffectAdded {
        track_id: String,
        effect_type: String,
    },
    #[serde(rename_all = "camelCase")]
    SendAdded { track_id: String, bus_id: String },
    #[serde(rename_all = "camelCase")]
    Applied { tool: String },
    #[serde(rename_all = "camelCase")]
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        existing_region_id: Option<String>,
    },
}

impl ToolResult {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ToolResult::Error { .. })
    }
}

/// Everything produced by applying one tool call. Side-effect free
/// aside from store mutations: the caller decides where events go.
#[derive(Debug)]
pub struct ToolCallOutcome {
    pub enriched_params: Value,
    pub tool_result: ToolResult,
    pub events: Vec<StreamEvent>,
    pub msg_call: ChatMessage,
    pub msg_result: ChatMessage,
    /// Synthetic follow-up records (e.g. the inferred track icon).
    pub extra_records: Vec<Value>,
    /// Notes produced by a generator call, for telemetry and signalling.
    pub generated_notes: Vec<Note>,
    pub skipped: bool,
}

impl ToolCallOutcome {
    pub fn record(&self, tool: &str) -> Value {
        json!({ "tool": tool, "params": self.enriched_params })
    }
}

/// Human-readable label for a tool call; the `toolCall` event must reuse
/// the exact label of its preceding `toolStart`.
pub fn label_for_tool(name: &str, params: &Value) -> String {
    let str_param = |key: &str| params.get(key).and_then(Value::as_str).unwrap_or_default();
    match name {
        tools::SET_TEMPO => match params.get("tempo").and_then(Value::as_f64) {
            Some(t) => format!("Setting tempo to {t} BPM"),
            None => "Setting tempo".to_string(),
        },
        tools::SET_KEY => format!("Setting key to {}", str_param("key")),
        tools::ADD_MIDI_TRACK => format!("Creating {} track", str_param("name")),
        tools::ADD_MIDI_REGION => {
            let region = str_param("name");
            if region.is_empty() {
                "Creating a region".to_string()
            } else {
                format!("Creating region {region}")
            }
        }
        tools::ADD_NOTES => {
            let count = params
                .get("notes")
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0);
            format!("Writing {count} notes")
        }
        tools::DUPLICATE_REGION => "Duplicating region".to_string(),
        tools::ADD_INSERT_EFFECT => format!("Adding {}", str_param("type")),
        tools::ENSURE_BUS => format!("Creating {} bus", str_param("name")),
        tools::ADD_SEND => format!("Routing to {}", str_param("busName")),
        tools::ADD_MIDI_CC => "Shaping controller curves".to_string(),
        tools::ADD_PITCH_BEND => "Adding pitch bends".to_string(),
        tools::ADD_AUTOMATION => format!("Automating {}", str_param("parameter")),
        tools::SET_TRACK_VOLUME => "Balancing levels".to_string(),
        tools::SET_TRACK_PAN => "Setting stereo placement".to_string(),
        tools::MUTE_TRACK | tools::SOLO_TRACK => "Adjusting the mix".to_string(),
        tools::SET_TRACK_NAME => "Renaming track".to_string(),
        tools::SET_TRACK_COLOR => "Coloring track".to_string(),
        tools::SET_TRACK_ICON => "Setting track icon".to_string(),
        name if tools::GENERATOR_TOOLS.contains(&name) => {
            format!("Generating {}", role_for_generator(name, params))
        }
        other => format!("Running {other}"),
    }
}

fn role_for_generator(name: &str, params: &Value) -> String {
    if let Some(role) = params.get("role").and_then(Value::as_str) {
        if !role.is_empty() {
            return role.to_string();
        }
    }
    match name {
        tools::GENERATE_DRUMS => "drums",
        tools::GENERATE_BASS => "bass",
        tools::GENERATE_MELODY => "melody",
        tools::GENERATE_CHORDS => "chords",
        _ => "melody",
    }
    .to_string()
}

/// Validate, enrich, persist, and build results for one tool call.
#[allow(clippy::too_many_arguments)]
pub async fn apply_tool_call(
    tc_id: &str,
    tc_name: &str,
    resolved_args: Value,
    allow_set: &[&str],
    store: &SharedStore,
    generator: Option<&Arc<GeneratorClient>>,
    context: Option<&CompositionContext>,
    failures: &mut AddNotesFailures,
    emit_events: bool,
) -> ToolCallOutcome {
    // Per-region add_notes failure circuit: fail fast on the 4th
    // consecutive failure for the same region.
    if tc_name == tools::ADD_NOTES {
        let region_key = resolved_args
            .get("regionId")
            .and_then(Value::as_str)
            .unwrap_or("__unknown__")
            .to_string();
        let count = failures.get(&region_key).copied().unwrap_or(0);
        if count >= ADD_NOTES_FAILURE_LIMIT {
            let message = format!(
                "add_notes: region '{region_key}' has failed {count} times without valid \
                 notes being added. Stop retrying with shorthand params; provide a real \
                 'notes' array: [{{\"pitch\": 60, \"startBeat\": 0, \"durationBeats\": 1, \
                 \"velocity\": 80}}, ...]"
            );
            error!(region.id = %region_key, "add_notes failure circuit tripped");
            return error_outcome(tc_id, tc_name, resolved_args, message, None, emit_events);
        }
    }

    // ── Validation ──
    let validation = {
        let guard = store.lock().await;
        validate_tool_call(tc_name, &resolved_args, allow_set, guard.registry())
    };
    if !validation.valid {
        if tc_name == tools::ADD_NOTES {
            let region_key = resolved_args
                .get("regionId")
                .and_then(Value::as_str)
                .unwrap_or("__unknown__")
                .to_string();
            *failures.entry(region_key).or_insert(0) += 1;
        }
        warn!(
            tool = tc_name,
            errors = %validation.error_message(),
            "tool call failed validation"
        );
        let error_message = validation.error_message();
        return error_outcome(
            tc_id,
            tc_name,
            validation.resolved_params,
            error_message,
            None,
            emit_events,
        );
    }

    let mut enriched = validation.resolved_params;
    let mut extra_records: Vec<Value> = Vec::new();
    let mut pre_events: Vec<StreamEvent> = Vec::new();

    // ── Entity creation & persistence ──
    let tool_result: ToolResult = match tc_name {
        tools::ADD_MIDI_TRACK => {
            let mut guard = store.lock().await;
            let name = enriched
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("Track")
                .to_string();

            // An exact-name match reuses the existing track.
            let existing = guard.registry().resolve_track(&name, true).map(str::to_string);
            let (track_id, reused) = match existing {
                Some(id) => {
                    info!(track.id = %id, track.name = %name, "reusing existing track");
                    (id, true)
                }
                None => (guard.create_track(&name, None, None), false),
            };

            set_param(&mut enriched, "trackId", Value::String(track_id.clone()));
            styling::enrich_track_params(&mut enriched, &name, guard.registry().track_count());
            drop(guard);

            // Synthetic icon follow-up so the client styles the new row.
            if !reused && emit_events {
                if let Some(icon) = enriched.get("icon").and_then(Value::as_str) {
                    let icon_params = json!({ "trackId": track_id, "icon": icon });
                    let icon_label = format!("Setting icon for {name}");
                    let icon_phase = phase_for_tool(tools::SET_TRACK_ICON);
                    pre_events.push(StreamEvent::ToolStart {
                        name: tools::SET_TRACK_ICON.to_string(),
                        label: icon_label.clone(),
                        phase: icon_phase,
                        agent_id: None,
                        section_name: None,
                    });
                    pre_events.push(StreamEvent::ToolCall {
                        id: format!("{tc_id}-icon"),
                        name: tools::SET_TRACK_ICON.to_string(),
                        label: icon_label,
                        phase: icon_phase,
                        params: icon_params.clone(),
                        agent_id: None,
                        section_name: None,
                    });
                    extra_records
                        .push(json!({ "tool": tools::SET_TRACK_ICON, "params": icon_params }));
                }
            }

            ToolResult::TrackCreated {
                track_id,
                name,
                reused,
            }
        }

        tools::ADD_MIDI_REGION => {
            let mut guard = store.lock().await;
            let track_id = required_str(&enriched, "trackId");
            let name = enriched
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("Region")
                .to_string();
            let start = num_param(&enriched, "startBeat").unwrap_or(0.0);
            let duration = num_param(&enriched, "durationBeats").unwrap_or(16.0);

            // Idempotent creation: any overlap resolves to the existing
            // region, and no new entity is created.
            if let Some(existing) = guard
                .find_overlapping_region(&track_id, start, duration)
                .map(str::to_string)
            {
                info!(
                    region.id = %existing,
                    track.id = %track_id,
                    "region overlaps existing range, returning existing id"
                );
                set_param(&mut enriched, "regionId", Value::String(existing.clone()));
                ToolResult::RegionCreated {
                    region_id: existing,
                    track_id,
                    idempotent: true,
                }
            } else {
                match guard.create_region(&name, &track_id, start, duration) {
                    Ok(region_id) => {
                        set_param(&mut enriched, "regionId", Value::String(region_id.clone()));
                        ToolResult::RegionCreated {
                            region_id,
                            track_id,
                            idempotent: false,
                        }
                    }
                    Err(e) => {
                        drop(guard);
                        return error_outcome(
                            tc_id,
                            tc_name,
                            enriched,
                            format!("failed to create region: {e}"),
                            None,
                            emit_events,
                        );
                    }
                }
            }
        }

        tools::DUPLICATE_REGION => {
            let mut guard = store.lock().await;
            let source_id = required_str(&enriched, "regionId");
            let start = num_param(&enriched, "startBeat").unwrap_or(0.0);
            let source = guard.registry().get_region(&source_id).cloned();
            match source {
                Some(source) => {
                    let copy_name = format!("{} (copy)", source.name);
                    match guard.create_region(
                        &copy_name,
                        &source.track_id,
                        start,
                        source.duration_beats,
                    ) {
                        Ok(new_region_id) => {
                            if !source.notes.is_empty() {
                                let _ = guard.add_notes(&new_region_id, source.notes.clone());
                            }
                            set_param(
                                &mut enriched,
                                "newRegionId",
                                Value::String(new_region_id.clone()),
                            );
                            ToolResult::RegionDuplicated {
                                new_region_id,
                                region_id: source_id,
                            }
                        }
                        Err(e) => {
                            drop(guard);
                            return error_outcome(
                                tc_id,
                                tc_name,
                                enriched,
                                format!("failed to duplicate region: {e}"),
                                None,
                                emit_events,
                            );
                        }
                    }
                }
                None => {
                    drop(guard);
                    return error_outcome(
                        tc_id,
                        tc_name,
                        enriched,
                        format!("unknown region: {source_id}"),
                        None,
                        emit_events,
                    );
                }
            }
        }

        tools::ENSURE_BUS => {
            let mut guard = store.lock().await;
            let name = required_str(&enriched, "name");
            let bus_id = guard.get_or_create_bus(&name);
            set_param(&mut enriched, "busId", Value::String(bus_id.clone()));
            ToolResult::BusEnsured { bus_id, name }
        }

        tools::ADD_SEND => {
            let mut guard = store.lock().await;
            let track_id = required_str(&enriched, "trackId");
            let bus_name = required_str(&enriched, "busName");
            let bus_id = guard.get_or_create_bus(&bus_name);
            set_param(&mut enriched, "busId", Value::String(bus_id.clone()));
            ToolResult::SendAdded { track_id, bus_id }
        }

        tools::SET_TEMPO => {
            let tempo = num_param(&enriched, "tempo").unwrap_or(120.0) as u32;
            store.lock().await.set_tempo(tempo);
            ToolResult::TempoSet { tempo }
        }

        tools::SET_KEY => {
            let key = required_str(&enriched, "key");
            store.lock().await.set_key(&key);
            ToolResult::KeySet { key }
        }

        tools::ADD_NOTES => {
            let region_id = required_str(&enriched, "regionId");
            let notes: Vec<Note> = parse_list(enriched.get("notes"));
            let count = notes.len();
            let result = store.lock().await.add_notes(&region_id, notes);
            match result {
                Ok(()) => {
                    failures.remove(&region_id);
                    ToolResult::NotesAdded {
                        region_id,
                        notes_added: count,
                    }
                }
                Err(e) => {
                    *failures.entry(region_id).or_insert(0) += 1;
                    return error_outcome(
                        tc_id,
                        tc_name,
                        enriched,
                        e.to_string(),
                        None,
                        emit_events,
                    );
                }
            }
        }

        tools::ADD_INSERT_EFFECT => {
            let track_id = required_str(&enriched, "trackId");
            let effect_type = required_str(&enriched, "type");
            let result = store.lock().await.add_effect(&track_id, &effect_type);
            match result {
                Ok(()) => ToolResult::EffectAdded {
                    track_id,
                    effect_type,
                },
                Err(e) => {
                    return error_outcome(
                        tc_id,
                        tc_name,
                        enriched,
                        e.to_string(),
                        None,
                        emit_events,
                    )
                }
            }
        }

        tools::ADD_MIDI_CC => {
            let region_id = required_str(&enriched, "regionId");
            let cc = enriched.get("cc").and_then(Value::as_u64).unwrap_or(0) as u8;
            let events: Vec<ControllerEvent> = enriched
                .get("events")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .map(|e| ControllerEvent {
                            cc,
                            beat: e.get("beat").and_then(Value::as_f64).unwrap_or(0.0),
                            value: e.get("value").and_then(Value::as_u64).unwrap_or(0) as u8,
                        })
                        .collect()
                })
                .unwrap_or_default();
            match store.lock().await.add_cc(&region_id, events) {
                Ok(()) => ToolResult::Applied {
                    tool: tc_name.to_string(),
                },
                Err(e) => {
                    return error_outcome(
                        tc_id,
                        tc_name,
                        enriched,
                        e.to_string(),
                        None,
                        emit_events,
                    )
                }
            }
        }

        tools::ADD_PITCH_BEND => {
            let region_id = required_str(&enriched, "regionId");
            let bends: Vec<PitchBend> = parse_list(enriched.get("events"));
            match store.lock().await.add_pitch_bends(&region_id, bends) {
                Ok(()) => ToolResult::Applied {
                    tool: tc_name.to_string(),
                },
                Err(e) => {
                    return error_outcome(
                        tc_id,
                        tc_name,
                        enriched,
                        e.to_string(),
                        None,
                        emit_events,
                    )
                }
            }
        }

        name if tools::GENERATOR_TOOLS.contains(&name) => {
            match (generator, context) {
                (Some(client), Some(ctx)) => {
                    return execute_generator(
                        tc_id, tc_name, enriched, store, client, ctx, emit_events,
                    )
                    .await;
                }
                _ => {
                    // No generation context: acknowledge and pass through.
                    ToolResult::Applied {
                        tool: tc_name.to_string(),
                    }
                }
            }
        }

        // Mixing and styling tools are client-side instructions: the
        // store has nothing to record, the event stream carries them.
        _ => ToolResult::Applied {
            tool: tc_name.to_string(),
        },
    };

    let mut events = Vec::new();
    let phase = phase_for_tool(tc_name);
    if emit_events {
        let label = label_for_tool(tc_name, &enriched);
        events.push(StreamEvent::ToolStart {
            name: tc_name.to_string(),
            label: label.clone(),
            phase,
            agent_id: None,
            section_name: None,
        });
        events.push(StreamEvent::ToolCall {
            id: tc_id.to_string(),
            name: tc_name.to_string(),
            label,
            phase,
            params: enriched.clone(),
            agent_id: None,
            section_name: None,
        });
        events.extend(pre_events);
    }

    let result_value = tool_result.to_value();
    ToolCallOutcome {
        msg_call: ChatMessage::assistant_tool_calls(vec![bandproto::tools::ToolCall::new(
            tc_id,
            tc_name,
            enriched.clone(),
        )]),
        msg_result: ChatMessage::tool_result(tc_id, result_value.to_string()),
        enriched_params: enriched,
        tool_result,
        events,
        extra_records,
        generated_notes: Vec::new(),
        skipped: false,
    }
}

/// Route a generator tool call through the external service and persist
/// the result into the resolved region.
async fn execute_generator(
    tc_id: &str,
    tc_name: &str,
    mut enriched: Value,
    store: &SharedStore,
    client: &Arc<GeneratorClient>,
    ctx: &CompositionContext,
    emit_events: bool,
) -> ToolCallOutcome {
    let role = role_for_generator(tc_name, &enriched);
    let style = enriched
        .get("style")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(&ctx.style)
        .to_string();
    let tempo = num_param(&enriched, "tempo").map(|t| t as u32).unwrap_or(ctx.tempo);
    let bars = num_param(&enriched, "bars").map(|b| b as u32).unwrap_or(ctx.bars);
    let key = enriched
        .get("key")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            if ctx.key.is_empty() {
                None
            } else {
                Some(ctx.key.clone())
            }
        });
    let start_beat = num_param(&enriched, "startBeat")
        .or_else(|| num_param(&enriched, "start_beat"))
        .unwrap_or(0.0);

    // Prefer explicit ids from the contract path; fall back to registry.
    let (track_id, region_id) = {
        let guard = store.lock().await;
        let mut track_id = enriched
            .get("trackId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if track_id.is_empty() {
            let track_name = enriched
                .get("trackName")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| capitalize(&role));
            track_id = guard
                .registry()
                .resolve_track(&track_name, false)
                .unwrap_or_default()
                .to_string();
        }
        let mut region_id = enriched
            .get("regionId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if region_id.is_empty() && !track_id.is_empty() {
            region_id = guard
                .registry()
                .latest_region_for_track(&track_id)
                .unwrap_or_default()
                .to_string();
        }
        (track_id, region_id)
    };

    if region_id.is_empty() {
        let message = format!(
            "{tc_name}: no region found for track '{}' (role '{role}'). \
             add_midi_region must be called for this track before {tc_name}; \
             pass the regionId it returns.",
            if track_id.is_empty() { &role } else { &track_id }
        );
        error!(tool = tc_name, role = %role, "generator call without a region");
        return error_outcome(tc_id, tc_name, enriched, message, None, emit_events);
    }

    let label = format!("Generating {role}");
    let phase = phase_for_tool(tc_name);
    let mut events = Vec::new();
    if emit_events {
        events.push(StreamEvent::ToolStart {
            name: tc_name.to_string(),
            label: label.clone(),
            phase,
            agent_id: None,
            section_name: None,
        });
        events.push(StreamEvent::GeneratorStart {
            role: role.clone(),
            agent_id: role.clone(),
            style: style.clone(),
            bars,
            start_beat: Some(start_beat),
        });
    }

    // The prompt's affect profile decomposes onto the generator's wire
    // fields. Bass coupling: measured drum energy, when present,
    // overrides the prompt-derived intensity.
    let emotion = ctx.emotion_vector.unwrap_or_default();
    let energy_intensity = ctx
        .drum_telemetry
        .as_ref()
        .and_then(|t| t.get("energy_level"))
        .and_then(Value::as_f64)
        .unwrap_or(emotion.energy_intensity);

    let request = SubmitRequest {
        genre: style.clone(),
        tempo,
        instruments: vec![role.clone()],
        bars,
        key,
        musical_goals: None,
        tone_brightness: emotion.tone_brightness,
        tone_warmth: emotion.tone_warmth,
        energy_intensity,
        energy_excitement: emotion.energy_excitement,
        complexity: emotion.complexity,
        quality_preset: ctx.quality_preset.clone(),
        composition_id: ctx.composition_id.clone(),
        previous_notes: ctx.previous_notes.clone(),
    };

    let gen_start = Instant::now();
    let result = client.generate(request).await;
    let duration_ms = gen_start.elapsed().as_millis() as u64;

    if !result.success {
        let message = result
            .error
            .unwrap_or_else(|| "Generation failed".to_string());
        warn!(
            tool = tc_name,
            role = %role,
            duration_ms,
            error = %message,
            "generator returned failure"
        );
        let mut outcome = error_outcome(tc_id, tc_name, enriched, message, None, emit_events);
        outcome.events = {
            let mut all = events;
            all.append(&mut outcome.events);
            all
        };
        return outcome;
    }

    if result.notes.len() < MIN_NOTES_THRESHOLD {
        warn!(
            tool = tc_name,
            role = %role,
            notes = result.notes.len(),
            "generator returned suspiciously few notes"
        );
    } else {
        info!(
            tool = tc_name,
            role = %role,
            notes = result.notes.len(),
            cc = result.cc_events.len(),
            pitch_bends = result.pitch_bends.len(),
            duration_ms,
            retries = result.retry_count(),
            "generation complete"
        );
    }

    let notes_added = result.notes.len();
    let cc_count = result.cc_events.len();
    let bend_count = result.pitch_bends.len();
    {
        let mut guard = store.lock().await;
        if let Err(e) = guard.add_notes(&region_id, result.notes.clone()) {
            drop(guard);
            return error_outcome(tc_id, tc_name, enriched, e.to_string(), None, emit_events);
        }
        if !result.cc_events.is_empty() {
            let _ = guard.add_cc(&region_id, result.cc_events.clone());
        }
        if !result.pitch_bends.is_empty() {
            let _ = guard.add_pitch_bends(&region_id, result.pitch_bends.clone());
        }
        if !result.aftertouch.is_empty() {
            let _ = guard.add_aftertouch(&region_id, result.aftertouch.clone());
        }
    }

    set_param(&mut enriched, "regionId", Value::String(region_id.clone()));
    set_param(&mut enriched, "trackId", Value::String(track_id.clone()));
    set_param(&mut enriched, "_notesGenerated", Value::from(notes_added));

    if emit_events {
        events.push(StreamEvent::GeneratorComplete {
            role: role.clone(),
            agent_id: role.clone(),
            note_count: notes_added,
            duration_ms,
        });
        events.push(StreamEvent::ToolCall {
            id: tc_id.to_string(),
            name: tools::ADD_NOTES.to_string(),
            label,
            phase,
            params: json!({
                "trackId": track_id,
                "regionId": region_id,
                "notes": result.notes,
            }),
            agent_id: None,
            section_name: None,
        });
    }

    let tool_result = ToolResult::Generated {
        region_id,
        track_id,
        notes_added,
        cc_events: cc_count,
        pitch_bends: bend_count,
    };
    let result_value = tool_result.to_value();

    ToolCallOutcome {
        msg_call: ChatMessage::assistant_tool_calls(vec![bandproto::tools::ToolCall::new(
            tc_id,
            tc_name,
            enriched.clone(),
        )]),
        msg_result: ChatMessage::tool_result(tc_id, result_value.to_string()),
        enriched_params: enriched,
        tool_result,
        events,
        extra_records: Vec::new(),
        generated_notes: result.notes,
        skipped: false,
    }
}

fn error_outcome(
    tc_id: &str,
    tc_name: &str,
    params: Value,
    error: String,
    existing_region_id: Option<String>,
    emit_events: bool,
) -> ToolCallOutcome {
    let mut events = Vec::new();
    if emit_events {
        events.push(StreamEvent::ToolError {
            name: tc_name.to_string(),
            error: error.clone(),
            agent_id: None,
            section_name: None,
        });
    }
    let tool_result = ToolResult::Error {
        error,
        existing_region_id,
    };
    let result_value = tool_result.to_value();
    ToolCallOutcome {
        msg_call: ChatMessage::assistant_tool_calls(vec![bandproto::tools::ToolCall::new(
            tc_id,
            tc_name,
            params.clone(),
        )]),
        msg_result: ChatMessage::tool_result(tc_id, result_value.to_string()),
        enriched_params: params,
        tool_result,
        events,
        extra_records: Vec::new(),
        generated_notes: Vec::new(),
        skipped: true,
    }
}

fn set_param(params: &mut Value, key: &str, value: Value) {
    if let Some(obj) = params.as_object_mut() {
        obj.insert(key.to_string(), value);
    }
}

fn required_str(params: &Value, key: &str) -> String {
    params
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn num_param(params: &Value, key: &str) -> Option<f64> {
    params.get(key).and_then(Value::as_f64)
}

fn parse_list<T: serde::de::DeserializeOwned>(value: Option<&Value>) -> Vec<T> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StateStore;
    use bandproto::tools::INSTRUMENT_AGENT_TOOLS;

    async fn store_with_track() -> (SharedStore, String) {
        let store = StateStore::shared("conv");
        let track_id = store.lock().await.create_track("Drums", None, None);
        (store, track_id)
    }

    #[tokio::test]
    async fn test_region_creation_emits_paired_events() {
        let (store, track_id) = store_with_track().await;
        let mut failures = AddNotesFailures::new();
        let outcome = apply_tool_call(
            "tc-1",
            tools::ADD_MIDI_REGION,
            json!({"trackId": track_id, "startBeat": 0, "durationBeats": 16, "name": "Groove"}),
            INSTRUMENT_AGENT_TOOLS,
            &store,
            None,
            None,
            &mut failures,
            true,
        )
        .await;

        assert!(!outcome.skipped);
        let labels: Vec<_> = outcome
            .events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolStart { label, .. } => Some(("start", label.clone())),
                StreamEvent::ToolCall { label, .. } => Some(("call", label.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[0].1, labels[1].1);
    }

    #[tokio::test]
    async fn test_overlapping_region_is_idempotent() {
        let (store, track_id) = store_with_track().await;
        let mut failures = AddNotesFailures::new();
        let params = json!({"trackId": track_id, "startBeat": 0, "durationBeats": 16});

        let first = apply_tool_call(
            "tc-1",
            tools::ADD_MIDI_REGION,
            params.clone(),
            INSTRUMENT_AGENT_TOOLS,
            &store,
            None,
            None,
            &mut failures,
            false,
        )
        .await;
        let second = apply_tool_call(
            "tc-2",
            tools::ADD_MIDI_REGION,
            params,
            INSTRUMENT_AGENT_TOOLS,
            &store,
            None,
            None,
            &mut failures,
            false,
        )
        .await;

        let first_id = match &first.tool_result {
            ToolResult::RegionCreated { region_id, .. } => region_id.clone(),
            other => panic!("unexpected result {other:?}"),
        };
        match &second.tool_result {
            ToolResult::RegionCreated {
                region_id,
                idempotent,
                ..
            } => {
                assert_eq!(region_id, &first_id);
                assert!(idempotent);
            }
            other => panic!("unexpected result {other:?}"),
        }
        // Exactly one region.created in the log.
        let created = store
            .lock()
            .await
            .events()
            .iter()
            .filter(|e| e.event_type == crate::store::EventType::RegionCreated)
            .count();
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn test_exact_track_name_match_reuses_track() {
        let (store, track_id) = store_with_track().await;
        let mut failures = AddNotesFailures::new();
        let outcome = apply_tool_call(
            "tc-1",
            tools::ADD_MIDI_TRACK,
            json!({"name": "Drums"}),
            INSTRUMENT_AGENT_TOOLS,
            &store,
            None,
            None,
            &mut failures,
            false,
        )
        .await;
        match &outcome.tool_result {
            ToolResult::TrackCreated {
                track_id: id,
                reused,
                ..
            } => {
                assert_eq!(id, &track_id);
                assert!(reused);
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(store.lock().await.registry().track_count(), 1);
    }

    #[tokio::test]
    async fn test_add_notes_failure_circuit_trips_on_fourth_failure() {
        let (store, _) = store_with_track().await;
        let mut failures = AddNotesFailures::new();
        let bad = json!({"regionId": "ghost", "notes": [{"pitch": 60}]});

        for _ in 0..3 {
            let outcome = apply_tool_call(
                "tc",
                tools::ADD_NOTES,
                bad.clone(),
                INSTRUMENT_AGENT_TOOLS,
                &store,
                None,
                None,
                &mut failures,
                false,
            )
            .await;
            assert!(outcome.skipped);
        }
        assert_eq!(failures.get("ghost"), Some(&3));

        let fourth = apply_tool_call(
            "tc",
            tools::ADD_NOTES,
            bad,
            INSTRUMENT_AGENT_TOOLS,
            &store,
            None,
            None,
            &mut failures,
            false,
        )
        .await;
        assert!(fourth.skipped);
        match &fourth.tool_result {
            ToolResult::Error { error, .. } => {
                assert!(error.contains("Stop retrying"), "{error}");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_validation_failure_emits_tool_error() {
        let (store, _) = store_with_track().await;
        let mut failures = AddNotesFailures::new();
        let outcome = apply_tool_call(
            "tc-1",
            tools::SET_TEMPO,
            json!({}),
            &[tools::SET_TEMPO],
            &store,
            None,
            None,
            &mut failures,
            true,
        )
        .await;
        assert!(outcome.skipped);
        assert!(outcome
            .events
            .iter()
            .any(|e| matches!(e, StreamEvent::ToolError { error, .. } if !error.is_empty())));
    }
}
