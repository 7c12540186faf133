//! General MIDI program inference from track names.
//!
//! Channel 10 (drums) needs no program change, so drum tracks get an
//! `is_drums` flag instead of a program number. Melodic tracks map to a
//! sensible GM program by keyword, defaulting to Acoustic Grand (0).

/// Outcome of inferring a GM program for a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GmInference {
    pub program: Option<u8>,
    pub is_drums: bool,
    pub instrument_name: &'static str,
}

const DRUM_KEYWORDS: &[&str] = &["drum", "kit", "kick", "snare", "hat", "perc", "808", "909"];

const PROGRAM_KEYWORDS: &[(&str, u8, &'static str)] = &[
    ("piano", 0, "Acoustic Grand Piano"),
    ("keys", 0, "Acoustic Grand Piano"),
    ("rhodes", 4, "Electric Piano 1"),
    ("electric piano", 4, "Electric Piano 1"),
    ("organ", 16, "Drawbar Organ"),
    ("guitar", 27, "Electric Guitar (clean)"),
    ("bass", 33, "Electric Bass (finger)"),
    ("sub", 38, "Synth Bass 1"),
    ("string", 48, "String Ensemble 1"),
    ("violin", 40, "Violin"),
    ("cello", 42, "Cello"),
    ("choir", 52, "Choir Aahs"),
    ("vocal", 52, "Choir Aahs"),
    ("voice", 52, "Choir Aahs"),
    ("brass", 61, "Brass Section"),
    ("trumpet", 56, "Trumpet"),
    ("sax", 65, "Alto Sax"),
    ("flute", 73, "Flute"),
    ("lead", 80, "Lead 1 (square)"),
    ("melody", 80, "Lead 1 (square)"),
    ("arp", 81, "Lead 2 (sawtooth)"),
    ("pad", 89, "Pad 2 (warm)"),
    ("chord", 89, "Pad 2 (warm)"),
    ("fx", 99, "FX 4 (atmosphere)"),
    ("texture", 99, "FX 4 (atmosphere)"),
];

/// Infer a GM program (or drums flag) from a track name.
pub fn infer_program(track_name: &str) -> GmInference {
    let lower = track_name.to_lowercase();

    if DRUM_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return GmInference {
            program: None,
            is_drums: true,
            instrument_name: "Drum Kit",
        };
    }

    for (keyword, program, name) in PROGRAM_KEYWORDS {
        if lower.contains(keyword) {
            return GmInference {
                program: Some(*program),
                is_drums: false,
                instrument_name: name,
            };
        }
    }

    GmInference {
        program: Some(0),
        is_drums: false,
        instrument_name: "Acoustic Grand Piano",
    }
}

/// One-line GM guidance for an instrument agent's system prompt.
pub fn guidance_for_role(role: &str) -> String {
    let inference = infer_program(role);
    if inference.is_drums {
        "General MIDI drums: channel 10, kick 35/36, snare 38/40, hats 42/44/46.".to_string()
    } else {
        format!(
            "General MIDI program {} ({}).",
            inference.program.unwrap_or(0),
            inference.instrument_name
        )
    }
}
