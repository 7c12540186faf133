//! Boundary adapter for generator responses.
//!
//! Some service responses pack musical data inside DAW-style tool calls
//! (`addNotes`, `addMidiCC`, `addPitchBend`, `addAftertouch`). This
//! module flattens those into typed lists so the service's private tool
//! vocabulary never leaks into the core.

use serde_json::Value;

use bandproto::generator::{GeneratorResult, RawJobResult};
use bandproto::notes::{Aftertouch, ControllerEvent, Note, PitchBend};

/// Flatten a raw job result into the typed [`GeneratorResult`] shape.
///
/// Notes from the top-level `notes` field and from `addNotes` tool calls
/// are merged; CC, pitch-bend, and aftertouch data only arrive through
/// tool calls.
pub fn flatten_job_result(raw: RawJobResult, retry_count: u32) -> GeneratorResult {
    let mut notes = raw.notes;
    let mut cc_events: Vec<ControllerEvent> = Vec::new();
    let mut pitch_bends: Vec<PitchBend> = Vec::new();
    let mut aftertouch: Vec<Aftertouch> = Vec::new();

    for tc in &raw.tool_calls {
        match tc.tool.as_str() {
            "addNotes" => {
                notes.extend(parse_array::<Note>(tc.params.get("notes")));
            }
            "addMidiCC" => {
                let cc = tc.params.get("cc").and_then(Value::as_u64).unwrap_or(0) as u8;
                for event in events_of(&tc.params) {
                    cc_events.push(ControllerEvent {
                        cc,
                        beat: event.get("beat").and_then(Value::as_f64).unwrap_or(0.0),
                        value: event.get("value").and_then(Value::as_u64).unwrap_or(0) as u8,
                    });
                }
            }
            "addPitchBend" => {
                for event in events_of(&tc.params) {
                    pitch_bends.push(PitchBend {
                        beat: event.get("beat").and_then(Value::as_f64).unwrap_or(0.0),
                        value: event.get("value").and_then(Value::as_i64).unwrap_or(0) as i32,
                    });
                }
            }
            "addAftertouch" => {
                for event in events_of(&tc.params) {
                    aftertouch.push(Aftertouch {
                        beat: event.get("beat").and_then(Value::as_f64).unwrap_or(0.0),
                        value: event.get("value").and_then(Value::as_u64).unwrap_or(0) as u8,
                        pitch: event
                            .get("pitch")
                            .and_then(Value::as_u64)
                            .map(|p| p as u8),
                    });
                }
            }
            _ => {}
        }
    }

    let mut metadata = raw.metadata;
    metadata.insert("retry_count".to_string(), Value::from(retry_count));

    GeneratorResult {
        success: raw.success,
        notes,
        cc_events,
        pitch_bends,
        aftertouch,
        tool_calls: raw.tool_calls,
        metadata,
        error: raw.error,
    }
}

fn events_of(params: &Value) -> Vec<&serde_json::Map<String, Value>> {
    params
        .get("events")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default()
}

fn parse_array<T: serde::de::DeserializeOwned>(value: Option<&Value>) -> Vec<T> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use bandproto::generator::RawToolCall;
    use serde_json::json;

    fn raw_with_tool_calls(tool_calls: Vec<RawToolCall>) -> RawJobResult {
        RawJobResult {
            success: true,
            notes: vec![],
            tool_calls,
            metadata: Default::default(),
            error: None,
        }
    }

    #[test]
    fn test_add_notes_tool_calls_are_flattened() {
        let raw = raw_with_tool_calls(vec![RawToolCall {
            tool: "addNotes".into(),
            params: json!({"notes": [
                {"pitch": 36, "startBeat": 0.0, "durationBeats": 0.5, "velocity": 110},
                {"pitch": 38, "startBeat": 1.0, "durationBeats": 0.5, "velocity": 95}
            ]}),
        }]);
        let flat = flatten_job_result(raw, 0);
        assert_eq!(flat.notes.len(), 2);
        assert_eq!(flat.notes[0].pitch, 36);
        assert_eq!(flat.notes[1].start_beat, 1.0);
    }

    #[test]
    fn test_cc_events_carry_controller_number() {
        let raw = raw_with_tool_calls(vec![RawToolCall {
            tool: "addMidiCC".into(),
            params: json!({"cc": 74, "events": [
                {"beat": 0.0, "value": 40},
                {"beat": 2.0, "value": 90}
            ]}),
        }]);
        let flat = flatten_job_result(raw, 0);
        assert_eq!(flat.cc_events.len(), 2);
        assert!(flat.cc_events.iter().all(|e| e.cc == 74));
    }

    #[test]
    fn test_aftertouch_keeps_optional_pitch() {
        let raw = raw_with_tool_calls(vec![RawToolCall {
            tool: "addAftertouch".into(),
            params: json!({"events": [
                {"beat": 0.5, "value": 64, "pitch": 60},
                {"beat": 1.5, "value": 30}
            ]}),
        }]);
        let flat = flatten_job_result(raw, 0);
        assert_eq!(flat.aftertouch[0].pitch, Some(60));
        assert_eq!(flat.aftertouch[1].pitch, None);
    }

    #[test]
    fn test_unknown_service_tools_are_ignored() {
        let raw = raw_with_tool_calls(vec![RawToolCall {
            tool: "renderWaveform".into(),
            params: json!({"whatever": true}),
        }]);
        let flat = flatten_job_result(raw, 0);
        assert!(flat.notes.is_empty());
        assert!(flat.cc_events.is_empty());
    }

    #[test]
    fn test_top_level_notes_merge_with_tool_call_notes() {
        let mut raw = raw_with_tool_calls(vec![RawToolCall {
            tool: "addNotes".into(),
            params: json!({"notes": [{"pitch": 40, "startBeat": 0.0}]}),
        }]);
        raw.notes = vec![Note {
            pitch: 36,
            start_beat: 0.0,
            duration_beats: 1.0,
            velocity: 100,
            channel: 0,
        }];
        let flat = flatten_job_result(raw, 2);
        assert_eq!(flat.notes.len(), 2);
        assert_eq!(flat.retry_count(), 2);
    }
}
