//! Deterministic musical telemetry derived from generated notes.
//!
//! All computations are pure math over raw note data: no model calls,
//! no randomness. Later instruments read these snapshots for
//! cross-instrument awareness (bass locking to the drum groove).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use bandproto::notes::Note;
use lineage::short_hash;

/// GM kick drum pitches (Acoustic Bass Drum, Bass Drum 1).
const KICK_PITCHES: [u8; 2] = [35, 36];

/// Immutable telemetry snapshot for one section of one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionTelemetry {
    pub section_id: String,
    pub instrument: String,
    pub tempo: f64,
    /// Normalised product of velocity intensity and density, in [0, 1].
    pub energy_level: f64,
    /// Notes per beat.
    pub density_score: f64,
    /// 16-bin histogram of note onsets within the beat; bin 0 is the
    /// downbeat.
    pub groove_vector: Vec<f64>,
    /// Fingerprint of kick positions; empty when the section has no
    /// kicks.
    pub kick_pattern_hash: String,
    /// Standard deviation of inter-onset intervals.
    pub rhythmic_complexity: f64,
    pub velocity_mean: f64,
    pub velocity_variance: f64,
}

/// Canonical telemetry key: `"Instrument: section_id"`.
pub fn telemetry_key(instrument: &str, section_id: &str) -> String {
    format!("{instrument}: {section_id}")
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Compute telemetry for one generated section. Pure and deterministic:
/// identical input always yields identical output.
pub fn compute_section_telemetry(
    notes: &[Note],
    tempo: f64,
    instrument: &str,
    section_id: &str,
    section_beats: f64,
) -> SectionTelemetry {
    let total_beats = section_beats.max(1.0);
    let n_notes = notes.len();

    let density = n_notes as f64 / total_beats;

    let (vel_mean, vel_var) = if n_notes > 0 {
        let mean = notes.iter().map(|n| n.velocity as f64).sum::<f64>() / n_notes as f64;
        let var = notes
            .iter()
            .map(|n| (n.velocity as f64 - mean).powi(2))
            .sum::<f64>()
            / n_notes as f64;
        (mean, var)
    } else {
        (0.0, 0.0)
    };

    // Velocity contributes 0-1 (over 127); density saturates at 4
    // notes per beat.
    let energy = ((vel_mean / 127.0) * (density / 4.0).min(1.0)).clamp(0.0, 1.0);

    let mut bins = [0.0f64; 16];
    for note in notes {
        let offset = note.start_beat.rem_euclid(1.0);
        let idx = ((offset * 16.0) as usize) % 16;
        bins[idx] += 1.0;
    }
    let bin_total: f64 = bins.iter().sum();
    let bin_total = if bin_total == 0.0 { 1.0 } else { bin_total };
    let groove_vector: Vec<f64> = bins.iter().map(|b| b / bin_total).collect();

    let mut kick_positions: Vec<f64> = notes
        .iter()
        .filter(|n| KICK_PITCHES.contains(&n.pitch))
        .map(|n| round4(n.start_beat))
        .collect();
    kick_positions.sort_by(|a, b| a.total_cmp(b));
    let kick_pattern_hash = if kick_positions.is_empty() {
        String::new()
    } else {
        let encoded = kick_positions
            .iter()
            .map(|p| format!("{p:.4}"))
            .collect::<Vec<_>>()
            .join(",");
        let mut h = short_hash(encoded.as_bytes());
        h.truncate(8);
        h
    };

    let mut starts: Vec<f64> = notes.iter().map(|n| n.start_beat).collect();
    starts.sort_by(|a, b| a.total_cmp(b));
    let complexity = if starts.len() > 1 {
        let spacings: Vec<f64> = starts.windows(2).map(|w| w[1] - w[0]).collect();
        let mean = spacings.iter().sum::<f64>() / spacings.len() as f64;
        (spacings.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / spacings.len() as f64).sqrt()
    } else {
        0.0
    };

    SectionTelemetry {
        section_id: section_id.to_string(),
        instrument: instrument.to_string(),
        tempo,
        energy_level: round4(energy),
        density_score: round4(density),
        groove_vector,
        kick_pattern_hash,
        rhythmic_complexity: round4(complexity),
        velocity_mean: round2(vel_mean),
        velocity_variance: round2(vel_var),
    }
}

/// Write-once telemetry store for cross-instrument awareness.
///
/// All access is serialised through one mutex; the first write for a
/// key wins and later writes are ignored.
#[derive(Debug, Default)]
pub struct TelemetryStore {
    data: Mutex<HashMap<String, SectionTelemetry>>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, key: String, telemetry: SectionTelemetry) {
        let mut data = self.data.lock().await;
        if data.contains_key(&key) {
            debug!(key = %key, "telemetry already recorded, keeping first write");
            return;
        }
        debug!(
            key = %key,
            energy = telemetry.energy_level,
            density = telemetry.density_score,
            "telemetry recorded"
        );
        data.insert(key, telemetry);
    }

    pub async fn get(&self, key: &str) -> Option<SectionTelemetry> {
        self.data.lock().await.get(key).cloned()
    }

    pub async fn snapshot(&self) -> HashMap<String, SectionTelemetry> {
        self.data.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn note(pitch: u8, start: f64, velocity: u8) -> Note {
        Note {
            pitch,
            start_beat: start,
            duration_beats: 0.5,
            velocity,
            channel: 9,
        }
    }

    fn four_on_the_floor() -> Vec<Note> {
        (0..16)
            .map(|i| note(36, i as f64, 110))
            .chain((0..16).map(|i| note(42, i as f64 + 0.5, 80)))
            .collect()
    }

    #[test]
    fn test_telemetry_is_deterministic() {
        let notes = four_on_the_floor();
        let a = compute_section_telemetry(&notes, 124.0, "Drums", "0:intro", 16.0);
        let b = compute_section_telemetry(&notes, 124.0, "Drums", "0:intro", 16.0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_density_is_notes_per_beat() {
        let notes = four_on_the_floor();
        let t = compute_section_telemetry(&notes, 124.0, "Drums", "0:intro", 16.0);
        assert_eq!(t.density_score, 2.0);
    }

    #[test]
    fn test_empty_section_has_zero_energy_and_no_kick_hash() {
        let t = compute_section_telemetry(&[], 124.0, "Drums", "0:intro", 16.0);
        assert_eq!(t.energy_level, 0.0);
        assert_eq!(t.density_score, 0.0);
        assert_eq!(t.kick_pattern_hash, "");
        assert_eq!(t.rhythmic_complexity, 0.0);
    }

    #[test]
    fn test_groove_vector_normalised_and_downbeat_heavy() {
        let notes: Vec<Note> = (0..8).map(|i| note(36, i as f64, 100)).collect();
        let t = compute_section_telemetry(&notes, 120.0, "Drums", "0:full", 8.0);
        let sum: f64 = t.groove_vector.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert_eq!(t.groove_vector[0], 1.0);
    }

    #[test]
    fn test_kick_hash_distinguishes_patterns() {
        let straight: Vec<Note> = (0..4).map(|i| note(36, i as f64, 100)).collect();
        let offbeat: Vec<Note> = (0..4).map(|i| note(36, i as f64 + 0.5, 100)).collect();
        let a = compute_section_telemetry(&straight, 120.0, "Drums", "0:full", 4.0);
        let b = compute_section_telemetry(&offbeat, 120.0, "Drums", "0:full", 4.0);
        assert_ne!(a.kick_pattern_hash, b.kick_pattern_hash);
        assert_eq!(a.kick_pattern_hash.len(), 8);
    }

    #[test]
    fn test_even_spacing_has_zero_complexity() {
        let notes: Vec<Note> = (0..8).map(|i| note(38, i as f64, 100)).collect();
        let t = compute_section_telemetry(&notes, 120.0, "Drums", "0:full", 8.0);
        assert_eq!(t.rhythmic_complexity, 0.0);
    }

    #[tokio::test]
    async fn test_store_first_write_wins() {
        let store = TelemetryStore::new();
        let key = telemetry_key("Drums", "0:intro");
        let first = compute_section_telemetry(&four_on_the_floor(), 124.0, "Drums", "0:intro", 16.0);
        let second = compute_section_telemetry(&[], 124.0, "Drums", "0:intro", 16.0);
        store.set(key.clone(), first.clone()).await;
        store.set(key.clone(), second).await;
        assert_eq!(store.get(&key).await, Some(first));
    }
}
