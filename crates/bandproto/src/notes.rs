//! Musical value types shared across the store, executor, and wire.
//!
//! Canonical field names are snake_case. External callers (the client
//! app, the generator service) send camelCase; serde aliases normalise
//! those on the deserialization boundary so camelCase never reaches the
//! core.

use serde::{Deserialize, Serialize};

fn default_velocity() -> u8 {
    100
}

fn default_duration() -> f64 {
    1.0
}

/// A single MIDI note within a region.
///
/// `start_beat` is relative to the owning region's start. A note whose
/// `start_beat` is at or past the region's `duration_beats` is accepted
/// (tails are caller-defined); range validation on pitch/velocity happens
/// at the executor boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub pitch: u8,
    #[serde(alias = "startBeat", default)]
    pub start_beat: f64,
    #[serde(alias = "durationBeats", default = "default_duration")]
    pub duration_beats: f64,
    #[serde(default = "default_velocity")]
    pub velocity: u8,
    #[serde(default)]
    pub channel: u8,
}

/// A MIDI continuous-controller event within a region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerEvent {
    pub cc: u8,
    #[serde(default)]
    pub beat: f64,
    #[serde(default)]
    pub value: u8,
}

/// A pitch-bend event within a region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PitchBend {
    #[serde(default)]
    pub beat: f64,
    #[serde(default)]
    pub value: i32,
}

/// An aftertouch event; `pitch` present for polyphonic aftertouch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aftertouch {
    #[serde(default)]
    pub beat: f64,
    #[serde(default)]
    pub value: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pitch: Option<u8>,
}

/// One point on a track automation curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationPoint {
    #[serde(default)]
    pub beat: f64,
    #[serde(default)]
    pub value: f64,
}

/// An insert-effect reference on a track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectRef {
    #[serde(alias = "trackId")]
    pub track_id: String,
    #[serde(rename = "type")]
    pub effect_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_note_accepts_camel_case_aliases() {
        let note: Note =
            serde_json::from_str(r#"{"pitch":60,"startBeat":2.5,"durationBeats":0.5,"velocity":96}"#)
                .unwrap();
        assert_eq!(note.start_beat, 2.5);
        assert_eq!(note.duration_beats, 0.5);
    }

    #[test]
    fn test_note_serializes_snake_case() {
        let note = Note {
            pitch: 36,
            start_beat: 0.0,
            duration_beats: 1.0,
            velocity: 110,
            channel: 9,
        };
        let json = serde_json::to_value(&note).unwrap();
        assert!(json.get("start_beat").is_some());
        assert!(json.get("startBeat").is_none());
    }

    #[test]
    fn test_note_defaults_backfill_missing_fields() {
        let note: Note = serde_json::from_str(r#"{"pitch":64}"#).unwrap();
        assert_eq!(note.start_beat, 0.0);
        assert_eq!(note.duration_beats, 1.0);
        assert_eq!(note.velocity, 100);
        assert_eq!(note.channel, 0);
    }

    #[test]
    fn test_aftertouch_pitch_is_optional() {
        let mono: Aftertouch = serde_json::from_str(r#"{"beat":1.0,"value":80}"#).unwrap();
        assert_eq!(mono.pitch, None);
        let poly: Aftertouch =
            serde_json::from_str(r#"{"beat":1.0,"value":80,"pitch":60}"#).unwrap();
        assert_eq!(poly.pitch, Some(60));
    }
}
