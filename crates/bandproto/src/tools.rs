//! The stable internal tool vocabulary.
//!
//! Tool names, per-phase classification, and the allow-sets used by the
//! three agent layers. The generator service's private tool names never
//! appear here; they are translated at the client boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// Setup
pub const SET_TEMPO: &str = "set_tempo";
pub const SET_KEY: &str = "set_key";

// Composition
pub const ADD_MIDI_TRACK: &str = "add_midi_track";
pub const ADD_MIDI_REGION: &str = "add_midi_region";
pub const ADD_NOTES: &str = "add_notes";
pub const DUPLICATE_REGION: &str = "duplicate_region";
pub const GENERATE_MIDI: &str = "generate_midi";
pub const GENERATE_DRUMS: &str = "generate_drums";
pub const GENERATE_BASS: &str = "generate_bass";
pub const GENERATE_MELODY: &str = "generate_melody";
pub const GENERATE_CHORDS: &str = "generate_chords";

// Sound design
pub const ADD_INSERT_EFFECT: &str = "add_insert_effect";
pub const ENSURE_BUS: &str = "ensure_bus";
pub const ADD_SEND: &str = "add_send";
pub const ADD_MIDI_CC: &str = "add_midi_cc";
pub const ADD_PITCH_BEND: &str = "add_pitch_bend";

// Mixing
pub const SET_TRACK_VOLUME: &str = "set_track_volume";
pub const SET_TRACK_PAN: &str = "set_track_pan";
pub const MUTE_TRACK: &str = "mute_track";
pub const SOLO_TRACK: &str = "solo_track";
pub const SET_TRACK_NAME: &str = "set_track_name";
pub const SET_TRACK_COLOR: &str = "set_track_color";
pub const SET_TRACK_ICON: &str = "set_track_icon";
pub const ADD_AUTOMATION: &str = "add_automation";

pub const SETUP_TOOLS: &[&str] = &[SET_TEMPO, SET_KEY];

pub const TRACK_CREATION_TOOLS: &[&str] = &[ADD_MIDI_TRACK];

pub const GENERATOR_TOOLS: &[&str] = &[
    GENERATE_MIDI,
    GENERATE_DRUMS,
    GENERATE_BASS,
    GENERATE_MELODY,
    GENERATE_CHORDS,
];

pub const EFFECT_TOOLS: &[&str] = &[ADD_INSERT_EFFECT, ENSURE_BUS, ADD_SEND];

pub const EXPRESSIVE_TOOLS: &[&str] = &[ADD_MIDI_CC, ADD_PITCH_BEND, ADD_AUTOMATION];

pub const MIXING_TOOLS: &[&str] = &[
    SET_TRACK_VOLUME,
    SET_TRACK_PAN,
    MUTE_TRACK,
    SOLO_TRACK,
    SET_TRACK_NAME,
    SET_TRACK_COLOR,
    SET_TRACK_ICON,
];

/// Tools each instrument agent (L2) may call. No setup or mixing tools:
/// tempo/key are the coordinator's, mixing is phase 3.
pub const INSTRUMENT_AGENT_TOOLS: &[&str] = &[
    ADD_MIDI_TRACK,
    ADD_MIDI_REGION,
    ADD_NOTES,
    GENERATE_MIDI,
    GENERATE_DRUMS,
    GENERATE_BASS,
    GENERATE_MELODY,
    GENERATE_CHORDS,
    ADD_INSERT_EFFECT,
    ADD_MIDI_CC,
    ADD_PITCH_BEND,
    SET_TRACK_ICON,
    SET_TRACK_COLOR,
];

/// Tools the phase-3 mixing coordinator may call.
pub const MIXING_COORDINATOR_TOOLS: &[&str] = &[
    ENSURE_BUS,
    ADD_SEND,
    SET_TRACK_VOLUME,
    SET_TRACK_PAN,
    MUTE_TRACK,
    SOLO_TRACK,
    ADD_AUTOMATION,
];

/// Tools the expressive-refinement pass (L3) may call.
pub const REFINEMENT_TOOLS: &[&str] = &[ADD_MIDI_CC, ADD_PITCH_BEND];

/// Composition phase a tool call belongs to, for client-side grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Setup,
    Composition,
    SoundDesign,
    Mixing,
}

/// Map a tool name to its composition phase.
///
/// Unknown tools default to [`Phase::Composition`].
pub fn phase_for_tool(tool_name: &str) -> Phase {
    if SETUP_TOOLS.contains(&tool_name) {
        return Phase::Setup;
    }
    if MIXING_TOOLS.contains(&tool_name) || tool_name == ADD_AUTOMATION {
        return Phase::Mixing;
    }
    if EFFECT_TOOLS.contains(&tool_name)
        || tool_name == ADD_MIDI_CC
        || tool_name == ADD_PITCH_BEND
    {
        return Phase::SoundDesign;
    }
    Phase::Composition
}

/// True when the tool routes to the external generator.
pub fn is_generator_tool(tool_name: &str) -> bool {
    GENERATOR_TOOLS.contains(&tool_name)
}

/// A single named tool invocation produced by an LLM or built internally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub params: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            params,
        }
    }

    /// Fetch a string param, tolerating missing/null.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// Fetch a numeric param as f64.
    pub fn param_f64(&self, key: &str) -> Option<f64> {
        self.params.get(key).and_then(Value::as_f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_mapping() {
        assert_eq!(phase_for_tool(SET_TEMPO), Phase::Setup);
        assert_eq!(phase_for_tool(SET_KEY), Phase::Setup);
        assert_eq!(phase_for_tool(ADD_MIDI_TRACK), Phase::Composition);
        assert_eq!(phase_for_tool(ADD_MIDI_REGION), Phase::Composition);
        assert_eq!(phase_for_tool(GENERATE_MIDI), Phase::Composition);
        assert_eq!(phase_for_tool(ADD_INSERT_EFFECT), Phase::SoundDesign);
        assert_eq!(phase_for_tool(ADD_MIDI_CC), Phase::SoundDesign);
        assert_eq!(phase_for_tool(ENSURE_BUS), Phase::SoundDesign);
        assert_eq!(phase_for_tool(SET_TRACK_VOLUME), Phase::Mixing);
        assert_eq!(phase_for_tool(ADD_AUTOMATION), Phase::Mixing);
        assert_eq!(phase_for_tool(SET_TRACK_ICON), Phase::Mixing);
    }

    #[test]
    fn test_phase_serializes_camel_case() {
        assert_eq!(
            serde_json::to_string(&Phase::SoundDesign).unwrap(),
            "\"soundDesign\""
        );
    }

    #[test]
    fn test_generator_tools_are_recognised() {
        assert!(is_generator_tool(GENERATE_MIDI));
        assert!(is_generator_tool(GENERATE_DRUMS));
        assert!(!is_generator_tool(ADD_NOTES));
    }
}
