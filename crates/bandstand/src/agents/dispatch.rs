//! Batch ordering and section-child dispatch for instrument agents.
//!
//! The LLM's tool batch is sorted deterministically (track creation
//! first, each region before its paired generate, effects last), split
//! into `(region, generate)` pairs, and each pair becomes one sealed
//! [`SectionContract`] executed by a section child. Children run
//! sequentially within one instrument so each section's notes seed the
//! next; failed sections are retried by the server without any LLM
//! involvement.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use bandproto::notes::Note;
use bandproto::tools::{self, ToolCall};
use lineage::{InstrumentContract, SectionContract, SectionSpec};

use crate::llm::ToolCallingLlm;
use crate::stream::EventSender;

use super::section::{run_section_child, SectionResult};
use super::{ExecutionServices, RuntimeContext, TraceContext};

/// A tool batch split into its dispatch classes.
#[derive(Debug, Default)]
pub struct BatchSplit {
    pub track_calls: Vec<ToolCall>,
    pub pairs: Vec<(ToolCall, ToolCall)>,
    pub orphan_regions: Vec<ToolCall>,
    pub orphan_generates: Vec<ToolCall>,
    pub effect_calls: Vec<ToolCall>,
    pub other_calls: Vec<ToolCall>,
}

/// Sort a batch so every `add_midi_region` precedes its paired
/// generate (pair index stable), track creation sorts first, and
/// effects sort last.
pub fn sort_batch(calls: Vec<ToolCall>) -> Vec<ToolCall> {
    let mut keyed: Vec<(u32, ToolCall)> = Vec::with_capacity(calls.len());
    let mut regions_seen = 0u32;
    let mut generates_seen = 0u32;
    for tc in calls {
        let key = if tools::TRACK_CREATION_TOOLS.contains(&tc.name.as_str()) {
            0
        } else if tc.name == tools::ADD_MIDI_REGION {
            regions_seen += 1;
            10 + (regions_seen - 1) * 20
        } else if tools::GENERATOR_TOOLS.contains(&tc.name.as_str()) {
            generates_seen += 1;
            11 + (generates_seen - 1) * 20
        } else if tools::EFFECT_TOOLS.contains(&tc.name.as_str()) {
            9999
        } else {
            50
        };
        keyed.push((key, tc));
    }
    keyed.sort_by_key(|(key, _)| *key);
    keyed.into_iter().map(|(_, tc)| tc).collect()
}

/// Split a sorted batch into dispatch classes, pairing the i-th region
/// with the i-th generate.
pub fn split_batch(calls: Vec<ToolCall>) -> BatchSplit {
    let mut split = BatchSplit::default();
    let mut regions: Vec<ToolCall> = Vec::new();
    let mut generates: Vec<ToolCall> = Vec::new();

    for tc in calls {
        if tools::TRACK_CREATION_TOOLS.contains(&tc.name.as_str()) {
            split.track_calls.push(tc);
        } else if tc.name == tools::ADD_MIDI_REGION {
            regions.push(tc);
        } else if tools::GENERATOR_TOOLS.contains(&tc.name.as_str()) {
            generates.push(tc);
        } else if tools::EFFECT_TOOLS.contains(&tc.name.as_str()) {
            split.effect_calls.push(tc);
        } else {
            split.other_calls.push(tc);
        }
    }

    let paired = regions.len().min(generates.len());
    let mut region_iter = regions.into_iter();
    let mut generate_iter = generates.into_iter();
    for _ in 0..paired {
        if let (Some(r), Some(g)) = (region_iter.next(), generate_iter.next()) {
            split.pairs.push((r, g));
        }
    }
    split.orphan_regions = region_iter.collect();
    split.orphan_generates = generate_iter.collect();
    split
}

/// Result of dispatching one batch of section children.
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub results: Vec<SectionResult>,
    /// `{tool, params}` records for the summary.
    pub records: Vec<Value>,
    /// Pairs that could not be scheduled, with the reason (the parent
    /// stubs their tool replies).
    pub unscheduled: Vec<(String, String)>,
}

/// Compare the LLM's region call against the contract's section layout
/// and warn on drift. The contract always overrides.
fn check_l2_drift(region_tc: &ToolCall, section: &SectionSpec, trace: &TraceContext) {
    let claimed_start = region_tc.param_f64("startBeat");
    let claimed_duration = region_tc.param_f64("durationBeats");
    let drifted = claimed_start.is_some_and(|s| s != section.start_beat as f64)
        || claimed_duration.is_some_and(|d| d != section.duration_beats as f64);
    if drifted {
        warn!(
            trace = trace.short(),
            section = %section.name,
            contract_start = section.start_beat,
            contract_duration = section.duration_beats,
            claimed_start = ?claimed_start,
            claimed_duration = ?claimed_duration,
            "L2 drift: region call disagrees with contract layout, contract wins"
        );
    }
}

/// Build the sealed L3 contract for one section of one instrument.
pub fn build_section_contract(
    instrument: &InstrumentContract,
    section: &SectionSpec,
    track_id: &str,
    generate_prompt: &str,
) -> Result<SectionContract, lineage::HashError> {
    SectionContract {
        section: section.clone(),
        track_id: track_id.to_string(),
        instrument_name: instrument.instrument_name.clone(),
        role: instrument.role.clone(),
        style: instrument.style.clone(),
        tempo: instrument.tempo,
        key: instrument.key.clone(),
        region_name: format!("{} {}", instrument.instrument_name, section.name),
        l2_generate_prompt: generate_prompt.to_string(),
        contract_hash: String::new(),
        parent_contract_hash: String::new(),
    }
    .seal(&instrument.contract_hash)
}

/// Dispatch `(region, generate)` pairs as section children.
///
/// Children run sequentially (musical continuity: each child's notes
/// seed the next via `previous_notes`). Sections already generated are
/// skipped, so LLM re-emissions never regenerate completed work.
/// Afterwards, failed sections get server-owned retries with delays,
/// skipped entirely while the generator circuit is open.
#[allow(clippy::too_many_arguments)]
pub async fn dispatch_section_children(
    pairs: Vec<(ToolCall, ToolCall)>,
    instrument: &InstrumentContract,
    track_id: &str,
    runtime: &RuntimeContext,
    services: &ExecutionServices,
    agent_id: &str,
    allow_set: &[&str],
    llm: Option<Arc<dyn ToolCallingLlm>>,
    emit: &EventSender,
    trace: &TraceContext,
    sections_with_region: &mut HashSet<String>,
    sections_with_generate: &mut HashSet<String>,
) -> DispatchStats {
    let mut stats = DispatchStats::default();

    // Sections still needing a generate, in plan order.
    let open_sections: Vec<&SectionSpec> = instrument
        .sections
        .iter()
        .filter(|s| !sections_with_generate.contains(&s.name))
        .collect();

    let mut scheduled: Vec<(SectionContract, String, String)> = Vec::new();
    for (i, (region_tc, generate_tc)) in pairs.iter().enumerate() {
        let Some(section) = open_sections.get(i) else {
            warn!(
                trace = trace.short(),
                instrument = %instrument.instrument_name,
                extra = pairs.len() - open_sections.len(),
                "more region/generate pairs than open sections, dropping extras"
            );
            break;
        };
        check_l2_drift(region_tc, section, trace);
        let prompt = generate_tc.param_str("prompt").unwrap_or_default();
        match build_section_contract(instrument, section, track_id, prompt) {
            Ok(contract) => scheduled.push((
                contract,
                or_uuid(&region_tc.id),
                or_uuid(&generate_tc.id),
            )),
            Err(e) => {
                warn!(
                    trace = trace.short(),
                    section = %section.name,
                    error = %e,
                    "failed to seal section contract"
                );
                stats
                    .unscheduled
                    .push((or_uuid(&region_tc.id), e.to_string()));
                stats
                    .unscheduled
                    .push((or_uuid(&generate_tc.id), e.to_string()));
            }
        }
    }

    let timeout = Duration::from_secs(services.settings.section_child_timeout_secs);
    let mut previous_notes: Option<Vec<Note>> = None;
    let mut failed: Vec<usize> = Vec::new();

    for (idx, (contract, region_tc_id, generate_tc_id)) in scheduled.iter().enumerate() {
        let result = run_with_timeout(
            contract,
            runtime,
            services,
            agent_id,
            allow_set,
            previous_notes.clone(),
            region_tc_id,
            generate_tc_id,
            llm.clone(),
            emit,
            trace,
            timeout,
        )
        .await;

        absorb_result(
            &result,
            sections_with_region,
            sections_with_generate,
            &mut previous_notes,
        );
        if !result.success {
            failed.push(idx);
        }
        stats.records.extend(result.tool_records.iter().cloned());
        stats.results.push(result);
    }

    // ── Server-owned retries: no LLM involvement ──
    let max_retries = services.settings.max_section_retries;
    let delays = &services.settings.section_retry_delays_secs;
    for round in 0..max_retries {
        if failed.is_empty() {
            break;
        }
        if services.generator.circuit_open() {
            warn!(
                trace = trace.short(),
                instrument = %instrument.instrument_name,
                "generator circuit open, aborting section retries"
            );
            break;
        }
        let delay = delays
            .get(round as usize)
            .copied()
            .or_else(|| delays.last().copied())
            .unwrap_or(0);
        info!(
            trace = trace.short(),
            instrument = %instrument.instrument_name,
            round = round + 1,
            sections = failed.len(),
            delay_secs = delay,
            "retrying failed sections"
        );
        tokio::time::sleep(Duration::from_secs(delay)).await;

        let mut still_failed = Vec::new();
        for idx in failed {
            let (contract, _, _) = &scheduled[idx];
            let result = run_with_timeout(
                contract,
                runtime,
                services,
                agent_id,
                allow_set,
                previous_notes.clone(),
                &Uuid::new_v4().to_string(),
                &Uuid::new_v4().to_string(),
                llm.clone(),
                emit,
                trace,
                timeout,
            )
            .await;
            absorb_result(
                &result,
                sections_with_region,
                sections_with_generate,
                &mut previous_notes,
            );
            if !result.success {
                still_failed.push(idx);
            }
            stats.records.extend(result.tool_records.iter().cloned());
            // Replace the failed attempt's result so callers see the
            // final state per section.
            if let Some(slot) = stats
                .results
                .iter_mut()
                .find(|r| r.section_id == result.section_id)
            {
                *slot = result;
            } else {
                stats.results.push(result);
            }
        }
        failed = still_failed;
    }

    stats
}

#[allow(clippy::too_many_arguments)]
async fn run_with_timeout(
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
    timeout: Duration,
) -> SectionResult {
    let child = run_section_child(
        contract,
        runtime,
        services,
        agent_id,
        allow_set,
        previous_notes,
        region_tc_id,
        generate_tc_id,
        llm,
        emit,
        trace,
    );
    match tokio::time::timeout(timeout, child).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                trace = trace.short(),
                section = %contract.section_name(),
                timeout_secs = timeout.as_secs(),
                "section child timed out"
            );
            // The cancelled child may not have signalled; release any
            // bass waiter now.
            if contract.is_drum() {
                services.signals.signal_complete(
                    contract.section_id(),
                    &contract.section.contract_hash,
                    false,
                    None,
                );
            }
            let mut result = SectionResult {
                section_id: contract.section_id().to_string(),
                section_name: contract.section_name().to_string(),
                contract_hash: contract.contract_hash.clone(),
                execution_hash: contract.execution_hash(&trace.trace_id),
                ..Default::default()
            };
            result.error = Some(format!(
                "section timed out after {}s",
                timeout.as_secs()
            ));
            result
        }
    }
}

fn absorb_result(
    result: &SectionResult,
    sections_with_region: &mut HashSet<String>,
    sections_with_generate: &mut HashSet<String>,
    previous_notes: &mut Option<Vec<Note>>,
) {
    if result.region_id.is_some() {
        sections_with_region.insert(result.section_name.clone());
    }
    if result.success {
        sections_with_generate.insert(result.section_name.clone());
        if !result.generated_notes.is_empty() {
            *previous_notes = Some(result.generated_notes.clone());
        }
    }
}

fn or_uuid(id: &str) -> String {
    if id.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tc(id: &str, name: &str, params: Value) -> ToolCall {
        ToolCall::new(id, name, params)
    }

    #[test]
    fn test_sort_puts_track_first_effects_last() {
        let sorted = sort_batch(vec![
            tc("1", tools::ADD_INSERT_EFFECT, json!({})),
            tc("2", tools::GENERATE_MIDI, json!({})),
            tc("3", tools::ADD_MIDI_REGION, json!({})),
            tc("4", tools::ADD_MIDI_TRACK, json!({})),
        ]);
        let names: Vec<_> = sorted.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                tools::ADD_MIDI_TRACK,
                tools::ADD_MIDI_REGION,
                tools::GENERATE_MIDI,
                tools::ADD_INSERT_EFFECT,
            ]
        );
    }

    #[test]
    fn test_sort_keeps_pairs_interleaved_by_index() {
        let sorted = sort_batch(vec![
            tc("r1", tools::ADD_MIDI_REGION, json!({"startBeat": 0})),
            tc("r2", tools::ADD_MIDI_REGION, json!({"startBeat": 16})),
            tc("g1", tools::GENERATE_MIDI, json!({})),
            tc("g2", tools::GENERATE_MIDI, json!({})),
        ]);
        let ids: Vec<_> = sorted.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "g1", "r2", "g2"]);
    }

    #[test]
    fn test_split_pairs_regions_with_generates() {
        let split = split_batch(vec![
            tc("t", tools::ADD_MIDI_TRACK, json!({})),
            tc("r1", tools::ADD_MIDI_REGION, json!({})),
            tc("g1", tools::GENERATE_MIDI, json!({})),
            tc("r2", tools::ADD_MIDI_REGION, json!({})),
            tc("e", tools::ADD_INSERT_EFFECT, json!({})),
        ]);
        assert_eq!(split.track_calls.len(), 1);
        assert_eq!(split.pairs.len(), 1);
        assert_eq!(split.orphan_regions.len(), 1);
        assert!(split.orphan_generates.is_empty());
        assert_eq!(split.effect_calls.len(), 1);
    }

    #[test]
    fn test_split_reports_orphan_generates() {
        let split = split_batch(vec![
            tc("g1", tools::GENERATE_DRUMS, json!({})),
            tc("g2", tools::GENERATE_MIDI, json!({})),
            tc("r1", tools::ADD_MIDI_REGION, json!({})),
        ]);
        assert_eq!(split.pairs.len(), 1);
        assert_eq!(split.orphan_generates.len(), 1);
    }
}
