//! Tool-call validation and name→id resolution.
//!
//! Checks the tool against the allow-set, verifies required and typed
//! arguments, resolves `trackName`/`regionName` to ids through the
//! registry, and backfills conservative defaults for missing note and
//! event subfields.

use serde_json::Value;

use bandproto::tools;

use crate::store::EntityRegistry;

/// Outcome of validating one tool call.
#[derive(Debug)]
pub struct Validation {
    pub valid: bool,
    pub errors: Vec<String>,
    /// Params after name resolution and default backfill.
    pub resolved_params: Value,
}

impl Validation {
    pub fn error_message(&self) -> String {
        self.errors.join("; ")
    }

    fn failure(errors: Vec<String>, params: Value) -> Self {
        Self {
            valid: false,
            errors,
            resolved_params: params,
        }
    }
}

/// Validate one tool call and enrich its params.
pub fn validate_tool_call(
    name: &str,
    params: &Value,
    allow_set: &[&str],
    registry: &EntityRegistry,
) -> Validation {
    let mut errors: Vec<String> = Vec::new();
    let mut resolved = params.clone();
    if !resolved.is_object() {
        resolved = Value::Object(Default::default());
        errors.push("params must be a JSON object".to_string());
    }

    if !allow_set.contains(&name) {
        errors.push(format!("tool '{name}' is not allowed in this phase"));
        return Validation::failure(errors, resolved);
    }

    resolve_track_ref(&mut resolved, registry, &mut errors);
    resolve_region_ref(&mut resolved, registry, &mut errors);

    match name {
        tools::SET_TEMPO => {
            match resolved.get("tempo").and_then(Value::as_f64) {
                Some(t) if (20.0..=400.0).contains(&t) => {}
                Some(t) => errors.push(format!("tempo {t} outside supported range 20-400")),
                None => errors.push("set_tempo requires a numeric 'tempo'".to_string()),
            }
        }
        tools::SET_KEY => {
            if resolved.get("key").and_then(Value::as_str).is_none() {
                errors.push("set_key requires a string 'key'".to_string());
            }
        }
        tools::ADD_MIDI_TRACK => {
            if resolved.get("name").and_then(Value::as_str).is_none() {
                errors.push("add_midi_track requires a string 'name'".to_string());
            }
        }
        tools::ADD_MIDI_REGION => {
            require_track_id(&resolved, name, &mut errors);
            let duration = number_field(&resolved, "durationBeats", "duration_beats");
            match duration {
                Some(d) if d > 0.0 => {}
                Some(d) => errors.push(format!("durationBeats must be positive, got {d}")),
                None => errors.push("add_midi_region requires 'durationBeats'".to_string()),
            }
            if number_field(&resolved, "startBeat", "start_beat").is_some_and(|s| s < 0.0) {
                errors.push("startBeat must be non-negative".to_string());
            }
        }
        tools::ADD_NOTES => {
            require_region_id(&resolved, name, &mut errors);
            match resolved.get_mut("notes").and_then(Value::as_array_mut) {
                Some(notes) if !notes.is_empty() => {
                    for (i, note) in notes.iter_mut().enumerate() {
                        backfill_note(note);
                        validate_note(note, i, &mut errors);
                    }
                }
                _ => errors.push("add_notes requires a non-empty 'notes' array".to_string()),
            }
        }
        tools::ADD_INSERT_EFFECT => {
            require_track_id(&resolved, name, &mut errors);
            if resolved.get("type").and_then(Value::as_str).is_none() {
                errors.push("add_insert_effect requires a string 'type'".to_string());
            }
        }
        tools::ENSURE_BUS => {
            if resolved.get("name").and_then(Value::as_str).is_none() {
                errors.push("ensure_bus requires a string 'name'".to_string());
            }
        }
        tools::ADD_SEND => {
            require_track_id(&resolved, name, &mut errors);
            if resolved.get("busName").and_then(Value::as_str).is_none() {
                errors.push("add_send requires a string 'busName'".to_string());
            }
        }
        tools::ADD_MIDI_CC => {
            require_region_id(&resolved, name, &mut errors);
            match resolved.get("cc").and_then(Value::as_u64) {
                Some(cc) if cc <= 127 => {}
                Some(cc) => errors.push(format!("cc {cc} outside [0,127]")),
                None => errors.push("add_midi_cc requires a numeric 'cc'".to_string()),
            }
            backfill_events(&mut resolved, "events");
        }
        tools::ADD_PITCH_BEND => {
            require_region_id(&resolved, name, &mut errors);
            backfill_events(&mut resolved, "events");
        }
        tools::ADD_AUTOMATION => {
            require_track_id(&resolved, name, &mut errors);
            if resolved.get("parameter").and_then(Value::as_str).is_none() {
                errors.push("add_automation requires a string 'parameter'".to_string());
            }
            backfill_points(&mut resolved);
        }
        tools::DUPLICATE_REGION => {
            require_region_id(&resolved, name, &mut errors);
            if number_field(&resolved, "startBeat", "start_beat").is_none() {
                errors.push("duplicate_region requires 'startBeat'".to_string());
            }
        }
        tools::SET_TRACK_VOLUME => {
            require_track_id(&resolved, name, &mut errors);
            if resolved.get("volume").and_then(Value::as_f64).is_none() {
                errors.push("set_track_volume requires a numeric 'volume'".to_string());
            }
        }
        tools::SET_TRACK_PAN => {
            require_track_id(&resolved, name, &mut errors);
            if resolved.get("pan").and_then(Value::as_f64).is_none() {
                errors.push("set_track_pan requires a numeric 'pan'".to_string());
            }
        }
        tools::SET_TRACK_NAME => {
            require_track_id(&resolved, name, &mut errors);
            if resolved.get("name").and_then(Value::as_str).is_none() {
                errors.push("set_track_name requires a string 'name'".to_string());
            }
        }
        tools::SET_TRACK_COLOR | tools::SET_TRACK_ICON | tools::MUTE_TRACK
        | tools::SOLO_TRACK => {
            require_track_id(&resolved, name, &mut errors);
        }
        name if tools::GENERATOR_TOOLS.contains(&name) => {
            if number_field(&resolved, "bars", "bars").is_some_and(|b| b <= 0.0) {
                errors.push("bars must be positive".to_string());
            }
        }
        _ => {}
    }

    Validation {
        valid: errors.is_empty(),
        errors,
        resolved_params: resolved,
    }
}

fn number_field(params: &Value, camel: &str, snake: &str) -> Option<f64> {
    params
        .get(camel)
        .or_else(|| params.get(snake))
        .and_then(Value::as_f64)
}

fn require_track_id(params: &Value, tool: &str, errors: &mut Vec<String>) {
    if params.get("trackId").and_then(Value::as_str).is_none() {
        errors.push(format!(
            "{tool} requires 'trackId' (or a resolvable 'trackName')"
        ));
    }
}

fn require_region_id(params: &Value, tool: &str, errors: &mut Vec<String>) {
    if params.get("regionId").and_then(Value::as_str).is_none() {
        errors.push(format!(
            "{tool} requires 'regionId' (or a resolvable 'regionName')"
        ));
    }
}

fn resolve_track_ref(params: &mut Value, registry: &EntityRegistry, errors: &mut Vec<String>) {
    let has_id = params.get("trackId").and_then(Value::as_str).is_some();
    if has_id {
        return;
    }
    let Some(track_name) = params
        .get("trackName")
        .and_then(Value::as_str)
        .map(str::to_string)
    else {
        return;
    };
    match registry.resolve_track(&track_name, false) {
        Some(track_id) => {
            let track_id = track_id.to_string();
            if let Some(obj) = params.as_object_mut() {
                obj.insert("trackId".to_string(), Value::String(track_id));
            }
        }
        None => errors.push(format!("unknown track: '{track_name}'")),
    }
}

fn resolve_region_ref(params: &mut Value, registry: &EntityRegistry, errors: &mut Vec<String>) {
    let has_id = params.get("regionId").and_then(Value::as_str).is_some();
    if has_id {
        return;
    }
    let Some(region_name) = params
        .get("regionName")
        .and_then(Value::as_str)
        .map(str::to_string)
    else {
        return;
    };
    match registry.resolve_region(&region_name) {
        Some(region_id) => {
            let region_id = region_id.to_string();
            if let Some(obj) = params.as_object_mut() {
                obj.insert("regionId".to_string(), Value::String(region_id));
            }
        }
        None => errors.push(format!("unknown region: '{region_name}'")),
    }
}

fn backfill_note(note: &mut Value) {
    let Some(obj) = note.as_object_mut() else {
        return;
    };
    obj.entry("pitch").or_insert(Value::from(60));
    obj.entry("velocity").or_insert(Value::from(100));
    if !obj.contains_key("startBeat") && !obj.contains_key("start_beat") {
        obj.insert("startBeat".to_string(), Value::from(0));
    }
    if !obj.contains_key("durationBeats") && !obj.contains_key("duration_beats") {
        obj.insert("durationBeats".to_string(), Value::from(1.0));
    }
}

fn validate_note(note: &Value, index: usize, errors: &mut Vec<String>) {
    match note.get("pitch").and_then(Value::as_i64) {
        Some(p) if (0..=127).contains(&p) => {}
        Some(p) => errors.push(format!("notes[{index}].pitch {p} outside [0,127]")),
        None => errors.push(format!("notes[{index}].pitch must be an integer")),
    }
    if let Some(v) = note.get("velocity").and_then(Value::as_i64) {
        if !(0..=127).contains(&v) {
            errors.push(format!("notes[{index}].velocity {v} outside [0,127]"));
        }
    }
    if number_field(note, "durationBeats", "duration_beats").is_some_and(|d| d <= 0.0) {
        errors.push(format!("notes[{index}].durationBeats must be positive"));
    }
    if number_field(note, "startBeat", "start_beat").is_some_and(|s| s < 0.0) {
        errors.push(format!("notes[{index}].startBeat must be non-negative"));
    }
}

fn backfill_events(params: &mut Value, key: &str) {
    if let Some(events) = params.get_mut(key).and_then(Value::as_array_mut) {
        for event in events {
            if let Some(obj) = event.as_object_mut() {
                obj.entry("beat").or_insert(Value::from(0));
                obj.entry("value").or_insert(Value::from(0));
            }
        }
    }
}

fn backfill_points(params: &mut Value) {
    if let Some(points) = params.get_mut("points").and_then(Value::as_array_mut) {
        for point in points {
            if let Some(obj) = point.as_object_mut() {
                obj.entry("beat").or_insert(Value::from(0));
                obj.entry("value").or_insert(Value::from(0.5));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bandproto::tools::INSTRUMENT_AGENT_TOOLS;
    use serde_json::json;

    fn registry() -> (EntityRegistry, String) {
        let mut reg = EntityRegistry::new();
        let track_id = reg.create_track("Drums", None, None);
        (reg, track_id)
    }

    #[test]
    fn test_disallowed_tool_rejected() {
        let (reg, _) = registry();
        let v = validate_tool_call("set_tempo", &json!({"tempo": 120}), INSTRUMENT_AGENT_TOOLS, &reg);
        assert!(!v.valid);
        assert!(v.error_message().contains("not allowed"));
    }

    #[test]
    fn test_track_name_resolves_to_id() {
        let (reg, track_id) = registry();
        let v = validate_tool_call(
            "add_midi_region",
            &json!({"trackName": "drums", "startBeat": 0, "durationBeats": 16}),
            INSTRUMENT_AGENT_TOOLS,
            &reg,
        );
        assert!(v.valid, "{:?}", v.errors);
        assert_eq!(v.resolved_params["trackId"], track_id);
    }

    #[test]
    fn test_zero_duration_region_rejected() {
        let (reg, track_id) = registry();
        let v = validate_tool_call(
            "add_midi_region",
            &json!({"trackId": track_id, "startBeat": 0, "durationBeats": 0}),
            INSTRUMENT_AGENT_TOOLS,
            &reg,
        );
        assert!(!v.valid);
    }

    #[test]
    fn test_note_pitch_out_of_range_rejected() {
        let (mut reg, track_id) = registry();
        let region_id = reg.create_region("Groove", &track_id, 0.0, 16.0).unwrap();
        let v = validate_tool_call(
            "add_notes",
            &json!({"regionId": region_id, "notes": [{"pitch": 200, "startBeat": 0}]}),
            INSTRUMENT_AGENT_TOOLS,
            &reg,
        );
        assert!(!v.valid);
        assert!(v.error_message().contains("pitch 200"));
    }

    #[test]
    fn test_note_defaults_backfilled() {
        let (mut reg, track_id) = registry();
        let region_id = reg.create_region("Groove", &track_id, 0.0, 16.0).unwrap();
        let v = validate_tool_call(
            "add_notes",
            &json!({"regionId": region_id, "notes": [{}]}),
            INSTRUMENT_AGENT_TOOLS,
            &reg,
        );
        assert!(v.valid, "{:?}", v.errors);
        let note = &v.resolved_params["notes"][0];
        assert_eq!(note["pitch"], 60);
        assert_eq!(note["velocity"], 100);
        assert_eq!(note["startBeat"], 0);
        assert_eq!(note["durationBeats"], 1.0);
    }

    #[test]
    fn test_unknown_track_name_is_an_error() {
        let (reg, _) = registry();
        let v = validate_tool_call(
            "add_insert_effect",
            &json!({"trackName": "Theremin", "type": "reverb"}),
            INSTRUMENT_AGENT_TOOLS,
            &reg,
        );
        assert!(!v.valid);
        assert!(v.error_message().contains("unknown track"));
    }

    #[test]
    fn test_cc_events_backfilled() {
        let (mut reg, track_id) = registry();
        let region_id = reg.create_region("Groove", &track_id, 0.0, 16.0).unwrap();
        let v = validate_tool_call(
            "add_midi_cc",
            &json!({"regionId": region_id, "cc": 74, "events": [{}]}),
            INSTRUMENT_AGENT_TOOLS,
            &reg,
        );
        assert!(v.valid, "{:?}", v.errors);
        assert_eq!(v.resolved_params["events"][0]["beat"], 0);
        assert_eq!(v.resolved_params["events"][0]["value"], 0);
    }
}
