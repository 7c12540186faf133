//! Parsed prompt interface and section derivation.
//!
//! The prompt parser itself is an external collaborator; this module
//! defines the [`ParsedPrompt`] shape it produces and derives the
//! composition's sealed [`SectionSpec`] list from it. An explicit form
//! structure is the authoritative section layout; keyword detection over
//! narrative text is the fallback; otherwise the piece is one
//! full-length section.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::info;

use lineage::{HashError, SectionSpec};

/// Structured output of the (external) prompt parser.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedPrompt {
    #[serde(default)]
    pub style: String,
    #[serde(default)]
    pub tempo: Option<u32>,
    #[serde(default)]
    pub key: Option<String>,
    /// Instrument roles to compose, e.g. `["drums", "bass"]`.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Free-text request body.
    #[serde(default)]
    pub request: String,
    #[serde(default)]
    pub bars: Option<u32>,
    /// Explicit form structure, e.g. `["intro", "verse", "chorus"]`.
    #[serde(default)]
    pub form: Option<Vec<String>>,
    #[serde(default)]
    pub quality_preset: Option<String>,
}

fn bars_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(\d{1,3})[\s-]*bars?\b").expect("valid regex"))
}

/// Extract an explicit bar count from free text (e.g. "a 24-bar bridge").
pub fn parse_bars_from_text(text: &str) -> Option<u32> {
    let captures = bars_pattern().captures(text)?;
    let value: u32 = captures.get(1)?.as_str().parse().ok()?;
    (1..=128).contains(&value).then_some(value)
}

impl ParsedPrompt {
    /// Total bars for the composition: explicit field, then free-text
    /// parse, then the default of 4.
    pub fn total_bars(&self) -> u32 {
        self.bars
            .or_else(|| parse_bars_from_text(&self.request))
            .unwrap_or(4)
    }

    pub fn drum_roles(&self) -> Vec<&str> {
        self.roles
            .iter()
            .filter(|r| matches!(r.to_lowercase().as_str(), "drums" | "drum"))
            .map(String::as_str)
            .collect()
    }
}

/// Relative length weights used to distribute beats across sections.
const SECTION_WEIGHTS: &[(&str, f64)] = &[
    ("intro", 0.5),
    ("verse", 1.0),
    ("pre-chorus", 0.5),
    ("chorus", 1.0),
    ("bridge", 0.75),
    ("breakdown", 0.5),
    ("build", 0.5),
    ("drop", 1.0),
    ("outro", 0.5),
    ("solo", 0.75),
    ("groove", 1.0),
    ("interlude", 0.5),
];

const SECTION_CHARACTERS: &[(&str, &str)] = &[
    ("intro", "Opening section, sparse, establishing mood. Minimal instrumentation."),
    ("verse", "Mid-energy verse: full groove, melodic content, controlled density."),
    ("pre-chorus", "Building tension, density increasing, anticipating the chorus."),
    ("chorus", "Peak energy: all instruments at full intensity, maximum density."),
    ("bridge", "Contrasting section: harmonic or rhythmic variation, reduced energy."),
    ("breakdown", "Stripped back, tension before the drop. Most instruments minimal."),
    ("build", "Progressive build: layered entry of instruments, rising intensity."),
    ("drop", "The payoff: maximum weight and movement."),
    ("outro", "Closing section: gradual element removal, winding down."),
    ("solo", "One instrument leads, the others provide supportive accompaniment."),
    ("groove", "Locked-in vamp: repetitive, hypnotic pattern riding the pocket."),
    ("interlude", "Transitional passage connecting two sections, lighter texture."),
    ("full", "Full arrangement."),
];

const ROLE_BRIEFS: &[((&str, &str), &str)] = &[
    (("intro", "drums"), "Sparse kit: maybe just hats and a soft kick pulse."),
    (("intro", "bass"), "Hold back; a few sustained root notes at most."),
    (("verse", "drums"), "Full groove with steady kick and snare backbeat."),
    (("verse", "bass"), "Locked to the kick pattern, melodic but restrained."),
    (("chorus", "drums"), "Maximum drive: crashes, fills, dense hat work."),
    (("chorus", "bass"), "Full-energy line, octave movement welcome."),
    (("bridge", "drums"), "Break the pattern: half-time or sparse alternative groove."),
    (("bridge", "bass"), "Follow the harmonic turn; contrast with the verse line."),
    (("breakdown", "drums"), "Strip to almost nothing; let the space breathe."),
    (("outro", "drums"), "Thin the kit out gradually toward silence."),
    (("outro", "bass"), "Resolve to the tonic and sustain."),
];

fn weight_for(name: &str) -> f64 {
    SECTION_WEIGHTS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, w)| *w)
        .unwrap_or(0.2)
}

fn character_for(name: &str) -> String {
    SECTION_CHARACTERS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, c)| c.to_string())
        .unwrap_or_else(|| format!("{} section.", capitalize(name)))
}

/// Canonical per-role brief for a section, empty when no template fits.
pub fn role_brief_for(section_name: &str, role: &str) -> String {
    let section = section_name.to_lowercase();
    let role = role.to_lowercase();
    ROLE_BRIEFS
        .iter()
        .find(|((s, r), _)| *s == section && (role.contains(*r) || r.contains(role.as_str())))
        .map(|(_, brief)| brief.to_string())
        .unwrap_or_default()
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

const SECTION_KEYWORDS: &[&str] = &[
    "intro", "verse", "pre-chorus", "chorus", "bridge", "breakdown", "build", "drop", "outro",
    "solo", "groove", "interlude",
];

fn detect_sections_by_keywords(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut found: Vec<(usize, String)> = Vec::new();
    for keyword in SECTION_KEYWORDS {
        if let Some(pos) = lower.find(keyword) {
            found.push((pos, keyword.to_string()));
        }
    }
    found.sort_by_key(|(pos, _)| *pos);
    found.into_iter().map(|(_, name)| name).collect()
}

/// Derive the sealed section plan for a composition.
///
/// Beats are distributed across sections proportionally to their
/// weights and snapped to bar boundaries; the last section absorbs the
/// remainder so the total is exact. A single-section plan is named
/// `full`.
pub fn build_section_specs(
    parsed: &ParsedPrompt,
    total_bars: u32,
) -> Result<Vec<SectionSpec>, HashError> {
    let beats_total = total_bars.max(1) * 4;

    let ordered: Vec<String> = match &parsed.form {
        Some(names) if names.len() >= 2 => {
            names.iter().map(|n| n.trim().to_lowercase()).collect()
        }
        _ => {
            let detected = detect_sections_by_keywords(&parsed.request);
            if detected.len() >= 2 {
                detected
            } else {
                vec!["full".to_string()]
            }
        }
    };

    let total_weight: f64 = ordered.iter().map(|n| weight_for(n)).sum();
    let mut specs = Vec::with_capacity(ordered.len());
    let mut current_beat: u32 = 0;

    for (i, name) in ordered.iter().enumerate() {
        let length = if i == ordered.len() - 1 {
            beats_total.saturating_sub(current_beat).max(4)
        } else {
            let proportional = (weight_for(name) / total_weight) * beats_total as f64;
            let snapped = ((proportional / 4.0).round() as u32) * 4;
            snapped.max(4)
        };

        let spec = SectionSpec {
            section_id: SectionSpec::make_id(i as u32, name),
            name: name.clone(),
            index: i as u32,
            start_beat: current_beat,
            duration_beats: length,
            bars: (length / 4).max(1),
            character: character_for(name),
            role_brief: String::new(),
            contract_hash: String::new(),
            parent_contract_hash: String::new(),
        }
        .seal()?;
        current_beat += length;
        specs.push(spec);
    }

    info!(
        sections = specs.len(),
        layout = %specs
            .iter()
            .map(|s| format!("{}({}b)", s.name, s.duration_beats))
            .collect::<Vec<_>>()
            .join(", "),
        "derived section plan"
    );
    Ok(specs)
}

/// Re-seal section specs with a per-role brief baked in, so each
/// instrument contract carries role-specific section descriptions.
pub fn specs_for_role(sections: &[SectionSpec], role: &str) -> Result<Vec<SectionSpec>, HashError> {
    sections
        .iter()
        .map(|spec| {
            SectionSpec {
                role_brief: role_brief_for(&spec.name, role),
                contract_hash: String::new(),
                parent_contract_hash: String::new(),
                ..spec.clone()
            }
            .seal()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_bars_parse_from_text() {
        assert_eq!(parse_bars_from_text("give me a 24-bar bridge"), Some(24));
        assert_eq!(parse_bars_from_text("16 bars of house"), Some(16));
        assert_eq!(parse_bars_from_text("play 999 bars"), None);
        assert_eq!(parse_bars_from_text("no count here"), None);
    }

    #[test]
    fn test_single_section_covers_all_beats() {
        let parsed = ParsedPrompt {
            roles: vec!["drums".into()],
            ..Default::default()
        };
        let specs = build_section_specs(&parsed, 8).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "full");
        assert_eq!(specs[0].start_beat, 0);
        assert_eq!(specs[0].duration_beats, 32);
        assert!(!specs[0].contract_hash.is_empty());
    }

    #[test]
    fn test_explicit_form_wins_over_keywords() {
        let parsed = ParsedPrompt {
            form: Some(vec!["intro".into(), "verse".into()]),
            request: "a chorus-heavy banger".into(),
            ..Default::default()
        };
        let specs = build_section_specs(&parsed, 8).unwrap();
        let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["intro", "verse"]);
    }

    #[test]
    fn test_sections_are_contiguous_and_exact() {
        let parsed = ParsedPrompt {
            form: Some(vec!["intro".into(), "verse".into(), "chorus".into(), "outro".into()]),
            ..Default::default()
        };
        let specs = build_section_specs(&parsed, 16).unwrap();
        let mut expected_start = 0;
        for spec in &specs {
            assert_eq!(spec.start_beat, expected_start);
            expected_start += spec.duration_beats;
        }
        assert_eq!(expected_start, 64);
    }

    #[test]
    fn test_section_ids_include_index() {
        let parsed = ParsedPrompt {
            form: Some(vec!["verse".into(), "verse".into()]),
            ..Default::default()
        };
        let specs = build_section_specs(&parsed, 8).unwrap();
        assert_eq!(specs[0].section_id, "0:verse");
        assert_eq!(specs[1].section_id, "1:verse");
        assert_ne!(specs[0].contract_hash, specs[1].contract_hash);
    }

    #[test]
    fn test_keyword_detection_orders_by_position() {
        let parsed = ParsedPrompt {
            request: "open with an intro, lift into a chorus, close with an outro".into(),
            ..Default::default()
        };
        let specs = build_section_specs(&parsed, 12).unwrap();
        let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["intro", "chorus", "outro"]);
    }

    #[test]
    fn test_role_specs_keep_structure_but_change_hash_with_brief() {
        let parsed = ParsedPrompt {
            form: Some(vec!["intro".into(), "chorus".into()]),
            ..Default::default()
        };
        let base = build_section_specs(&parsed, 8).unwrap();
        let for_drums = specs_for_role(&base, "drums").unwrap();
        assert_eq!(for_drums[0].start_beat, base[0].start_beat);
        assert!(!for_drums[0].role_brief.is_empty());
        // role_brief is structural on the spec, so the hash differs.
        assert_ne!(for_drums[0].contract_hash, base[0].contract_hash);
    }
}
