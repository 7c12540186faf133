//! End-of-run summary aggregation.
//!
//! Scans the collected tool-call records and folds them into the
//! `summary` / `summary.final` payloads.

use serde_json::Value;

use bandproto::events::{CompositionSummary, TrackSummary};
use bandproto::tools;

/// Marker record for a track reused rather than created.
pub const REUSED_TRACK_RECORD: &str = "_reused_track";

/// Fold tool-call records (`{tool, params}` values) into the summary.
pub fn build_summary(
    records: &[Value],
    style: &str,
    tempo: f64,
    key: &str,
) -> CompositionSummary {
    let mut summary = CompositionSummary {
        style: style.to_string(),
        tempo,
        key: key.to_string(),
        ..Default::default()
    };

    for record in records {
        let tool = record.get("tool").and_then(Value::as_str).unwrap_or("");
        let params = record.get("params").cloned().unwrap_or(Value::Null);
        match tool {
            tools::ADD_MIDI_TRACK => {
                summary.tracks_created.push(TrackSummary {
                    name: params
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("Track")
                        .to_string(),
                    track_id: params
                        .get("trackId")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                });
            }
            REUSED_TRACK_RECORD => {
                summary.tracks_reused.push(TrackSummary {
                    name: params
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("Track")
                        .to_string(),
                    track_id: params
                        .get("trackId")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                });
            }
            tools::ADD_MIDI_REGION => summary.regions_created += 1,
            tools::ADD_NOTES => {
                summary.notes_generated += params
                    .get("notes")
                    .and_then(Value::as_array)
                    .map(Vec::len)
                    .unwrap_or(0);
            }
            tools::ADD_INSERT_EFFECT => summary.effect_count += 1,
            name if tools::GENERATOR_TOOLS.contains(&name) => {
                summary.notes_generated += params
                    .get("_notesGenerated")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as usize;
            }
            _ => {}
        }
    }

    summary
}

/// All track names for the compact `summary` event.
pub fn track_names(summary: &CompositionSummary) -> Vec<String> {
    summary
        .tracks_created
        .iter()
        .chain(summary.tracks_reused.iter())
        .map(|t| t.name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_summary_counts_all_record_kinds() {
        let records = vec![
            json!({"tool": "add_midi_track", "params": {"name": "Drums", "trackId": "t-1"}}),
            json!({"tool": "add_midi_region", "params": {"trackId": "t-1"}}),
            json!({"tool": "generate_midi", "params": {"_notesGenerated": 32}}),
            json!({"tool": "add_notes", "params": {"notes": [{}, {}]}}),
            json!({"tool": "add_insert_effect", "params": {"type": "reverb"}}),
            json!({"tool": "_reused_track", "params": {"name": "Bass", "trackId": "t-2"}}),
        ];
        let summary = build_summary(&records, "house", 124.0, "Am");
        assert_eq!(summary.tracks_created.len(), 1);
        assert_eq!(summary.tracks_reused.len(), 1);
        assert_eq!(summary.regions_created, 1);
        assert_eq!(summary.notes_generated, 34);
        assert_eq!(summary.effect_count, 1);
        assert_eq!(track_names(&summary), vec!["Drums", "Bass"]);
    }

    #[test]
    fn test_empty_records_produce_zeroed_summary() {
        let summary = build_summary(&[], "ambient", 90.0, "C");
        assert_eq!(summary.notes_generated, 0);
        assert_eq!(summary.regions_created, 0);
        assert!(summary.tracks_created.is_empty());
    }
}
