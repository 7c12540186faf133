//! Track styling: automatic colour and icon assignment.
//!
//! Colours come from a fixed 12-entry palette allocated by index, so
//! adjacent tracks in one composition always receive distinct entries
//! (cycling only past 12 tracks). Keyword maps provide role-appropriate
//! colours and icons when the caller didn't pick one.

use serde_json::Value;

use crate::gm;

/// Perceptually-spaced hex palette, ordered to maximise contrast
/// between adjacent tracks. Pick in index order; cycle after 12.
pub const COMPOSITION_PALETTE: [&str; 12] = [
    "#E87040", // amber
    "#4A9EE8", // sky blue
    "#60C264", // sage green
    "#B06FD8", // violet
    "#E85D75", // rose
    "#40C4C0", // teal
    "#E8C040", // gold
    "#8C8CE8", // periwinkle
    "#D86F9E", // orchid
    "#7CC2E8", // ice blue
    "#A8C860", // olive
    "#E89C5D", // apricot
];

const ROLE_COLORS: &[(&str, &str)] = &[
    ("drum", "#E85D75"),
    ("kick", "#E85D75"),
    ("perc", "#E89C5D"),
    ("bass", "#60C264"),
    ("sub", "#60C264"),
    ("key", "#4A9EE8"),
    ("piano", "#4A9EE8"),
    ("pad", "#8C8CE8"),
    ("string", "#B06FD8"),
    ("lead", "#E8C040"),
    ("melody", "#E8C040"),
    ("arp", "#40C4C0"),
    ("chord", "#7CC2E8"),
    ("vocal", "#D86F9E"),
    ("voice", "#D86F9E"),
    ("fx", "#40C4C0"),
    ("guitar", "#E87040"),
];

const ROLE_ICONS: &[(&str, &str)] = &[
    ("drum", "drum"),
    ("kick", "drum"),
    ("perc", "shaker"),
    ("bass", "bass-clef"),
    ("key", "piano"),
    ("piano", "piano"),
    ("pad", "synth"),
    ("synth", "synth"),
    ("string", "violin"),
    ("vocal", "microphone"),
    ("voice", "microphone"),
    ("guitar", "guitar"),
    ("lead", "synth"),
    ("melody", "synth"),
    ("chord", "piano"),
    ("arp", "synth"),
    ("fx", "waveform"),
];

/// Palette colour for the track at `index` (coordinator allocation).
pub fn color_for_index(index: usize) -> &'static str {
    COMPOSITION_PALETTE[index % COMPOSITION_PALETTE.len()]
}

/// Pick a colour from the role keyword map, falling back to the palette
/// rotation at `rotation_index`.
pub fn color_for_track(track_name: &str, rotation_index: usize) -> &'static str {
    let lower = track_name.to_lowercase();
    for (keyword, color) in ROLE_COLORS {
        if lower.contains(keyword) {
            return color;
        }
    }
    color_for_index(rotation_index)
}

/// Infer an icon name from the track name; `None` when nothing matches.
pub fn icon_for_track(track_name: &str) -> Option<&'static str> {
    let lower = track_name.to_lowercase();
    ROLE_ICONS
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map(|(_, icon)| *icon)
}

fn is_valid_hex_color(raw: &str) -> bool {
    raw.len() == 7
        && raw.starts_with('#')
        && raw[1..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Enrich `add_midi_track` params with colour, icon, and GM inference.
///
/// A caller-provided valid hex colour is kept; anything else is replaced
/// from the keyword map / palette. Exactly one of `isDrums` or
/// `gmProgram` ends up set.
pub fn enrich_track_params(params: &mut Value, track_name: &str, track_count: usize) {
    let Some(obj) = params.as_object_mut() else {
        return;
    };

    let provided_color = obj
        .get("color")
        .and_then(Value::as_str)
        .filter(|c| is_valid_hex_color(c))
        .map(str::to_string);
    let color = provided_color
        .unwrap_or_else(|| color_for_track(track_name, track_count.saturating_sub(1)).to_string());
    obj.insert("color".to_string(), Value::String(color));

    if obj.get("icon").and_then(Value::as_str).is_none() {
        if let Some(icon) = icon_for_track(track_name) {
            obj.insert("icon".to_string(), Value::String(icon.to_string()));
        }
    }

    let inference = gm::infer_program(track_name);
    if inference.is_drums {
        obj.insert("isDrums".to_string(), Value::Bool(true));
        obj.remove("gmProgram");
    } else if obj.get("gmProgram").and_then(Value::as_u64).is_none() {
        obj.insert(
            "gmProgram".to_string(),
            Value::from(inference.program.unwrap_or(0)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_palette_has_twelve_distinct_entries() {
        let mut seen: Vec<&str> = COMPOSITION_PALETTE.to_vec();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 12);
    }

    #[test]
    fn test_index_allocation_cycles_past_twelve() {
        assert_eq!(color_for_index(0), color_for_index(12));
        assert_ne!(color_for_index(0), color_for_index(1));
    }

    #[test]
    fn test_role_keyword_beats_rotation() {
        assert_eq!(color_for_track("Bass", 0), "#60C264");
        assert_eq!(color_for_track("Sub Bass", 5), "#60C264");
    }

    #[test]
    fn test_enrich_sets_drums_flag_without_gm_program() {
        let mut params = json!({"name": "Drums"});
        enrich_track_params(&mut params, "Drums", 1);
        assert_eq!(params["isDrums"], true);
        assert!(params.get("gmProgram").is_none());
        assert_eq!(params["icon"], "drum");
    }

    #[test]
    fn test_enrich_keeps_valid_caller_color() {
        let mut params = json!({"name": "Keys", "color": "#ABCDEF"});
        enrich_track_params(&mut params, "Keys", 3);
        assert_eq!(params["color"], "#ABCDEF");
    }

    #[test]
    fn test_enrich_replaces_invalid_color() {
        let mut params = json!({"name": "Keys", "color": "chartreuse-ish"});
        enrich_track_params(&mut params, "Keys", 3);
        assert_eq!(params["color"], "#4A9EE8");
    }

    #[test]
    fn test_melodic_track_gets_gm_program() {
        let mut params = json!({"name": "Warm Pad"});
        enrich_track_params(&mut params, "Warm Pad", 2);
        assert!(params["gmProgram"].is_u64());
        assert!(params.get("isDrums").is_none());
    }
}
