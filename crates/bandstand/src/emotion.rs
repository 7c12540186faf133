//! Affect profile derived from prompt text.
//!
//! The generator's wire contract carries five affect knobs
//! (brightness, warmth, intensity, excitement, complexity). This module
//! derives them deterministically from the composer's words: a keyword
//! lexicon per axis, no model calls, no randomness. The same prompt
//! always yields the same vector.

use serde::{Deserialize, Serialize};

/// Contribution of one matched keyword to its axis.
const AXIS_STEP: f64 = 0.5;

/// Contribution of one matched keyword to the complexity axis.
const COMPLEXITY_STEP: f64 = 0.25;

/// Affect knobs for the generator, decomposed onto its wire fields.
///
/// Bipolar axes live in `[-1, 1]` with 0 neutral; `complexity` lives in
/// `[0, 1]` with 0.5 neutral.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmotionVector {
    pub tone_brightness: f64,
    pub tone_warmth: f64,
    pub energy_intensity: f64,
    pub energy_excitement: f64,
    pub complexity: f64,
}

impl Default for EmotionVector {
    fn default() -> Self {
        Self {
            tone_brightness: 0.0,
            tone_warmth: 0.0,
            energy_intensity: 0.0,
            energy_excitement: 0.0,
            complexity: 0.5,
        }
    }
}

const BRIGHT_WORDS: &[&str] = &[
    "bright", "shiny", "sparkling", "glassy", "airy", "sunny", "crisp",
];
const DARK_WORDS: &[&str] = &[
    "dark", "moody", "brooding", "shadowy", "murky", "gloomy", "dusky",
];

const WARM_WORDS: &[&str] = &[
    "warm", "lush", "mellow", "soft", "cozy", "analog", "smooth",
];
const COLD_WORDS: &[&str] = &[
    "cold", "icy", "harsh", "metallic", "clinical", "sterile", "brittle",
];

const INTENSE_WORDS: &[&str] = &[
    "aggressive", "heavy", "driving", "pounding", "intense", "hard-hitting",
    "relentless", "punchy",
];
const CALM_WORDS: &[&str] = &[
    "calm", "gentle", "relaxed", "chill", "laid-back", "ambient", "serene",
    "floating",
];

const EXCITED_WORDS: &[&str] = &[
    "energetic", "euphoric", "uplifting", "upbeat", "frantic", "wild",
    "triumphant", "anthemic",
];
const SUBDUED_WORDS: &[&str] = &[
    "melancholic", "sad", "somber", "mournful", "sleepy", "dreamy",
    "wistful", "bittersweet",
];

const INTRICATE_WORDS: &[&str] = &[
    "intricate", "complex", "polyrhythmic", "syncopated", "busy", "ornate",
];
const SIMPLE_WORDS: &[&str] = &[
    "simple", "minimal", "sparse", "repetitive", "stripped", "hypnotic",
];

fn axis_score(text: &str, positive: &[&str], negative: &[&str]) -> f64 {
    let hits = |words: &[&str]| words.iter().filter(|w| text.contains(*w)).count() as f64;
    ((hits(positive) - hits(negative)) * AXIS_STEP).clamp(-1.0, 1.0)
}

/// Derive the affect vector from prompt text. Pure and deterministic.
pub fn emotion_vector_from_prompt(prompt: &str) -> EmotionVector {
    let text = prompt.to_lowercase();
    let hits = |words: &[&str]| words.iter().filter(|w| text.contains(*w)).count() as f64;

    EmotionVector {
        tone_brightness: axis_score(&text, BRIGHT_WORDS, DARK_WORDS),
        tone_warmth: axis_score(&text, WARM_WORDS, COLD_WORDS),
        energy_intensity: axis_score(&text, INTENSE_WORDS, CALM_WORDS),
        energy_excitement: axis_score(&text, EXCITED_WORDS, SUBDUED_WORDS),
        complexity: (0.5 + (hits(INTRICATE_WORDS) - hits(SIMPLE_WORDS)) * COMPLEXITY_STEP)
            .clamp(0.0, 1.0),
    }
}
