//! Derived in-memory entity lookups.
//!
//! Cyclic references (tracks ↔ regions ↔ effects) are expressed as
//! id-keyed lookups here, never as pointer graphs. The registry is
//! internal to its [`StateStore`](super::StateStore); executors go
//! through the store for mutation and may only read here.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use bandproto::notes::{Aftertouch, ControllerEvent, EffectRef, Note, PitchBend};

/// Errors raised by registry mutations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("region would overlap existing region {existing_region_id} on track {track_id}")]
    OverlapsExisting {
        track_id: String,
        existing_region_id: String,
    },

    #[error("region duration must be positive, got {0}")]
    ZeroDuration(f64),

    #[error("unknown track: {0}")]
    UnknownTrack(String),

    #[error("unknown region: {0}")]
    UnknownRegion(String),
}

/// A track entity: owns an ordered sequence of regions by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackEntity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub effects: Vec<EffectRef>,
}

/// A region entity: a contiguous beat range on one track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionEntity {
    pub id: String,
    pub name: String,
    pub track_id: String,
    pub start_beat: f64,
    pub duration_beats: f64,
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default)]
    pub cc: Vec<ControllerEvent>,
    #[serde(default)]
    pub pitch_bends: Vec<PitchBend>,
    #[serde(default)]
    pub aftertouch: Vec<Aftertouch>,
}

impl RegionEntity {
    /// Half-open interval intersection on `[start, start + duration)`.
    fn overlaps(&self, start: f64, duration: f64) -> bool {
        self.start_beat < start + duration && start < self.start_beat + self.duration_beats
    }
}

/// A named shared aux path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEntity {
    pub id: String,
    pub name: String,
}

/// Fast name↔id resolution with insertion-ordered, first-match-wins
/// name lookups. Cloning the registry is the snapshot mechanism.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityRegistry {
    tracks: Vec<TrackEntity>,
    regions: Vec<RegionEntity>,
    buses: Vec<BusEntity>,
    tracks_by_id: HashMap<String, usize>,
    regions_by_id: HashMap<String, usize>,
    buses_by_id: HashMap<String, usize>,
    latest_region_for_track: HashMap<String, String>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Tracks ──

    pub fn create_track(&mut self, name: &str, id: Option<String>, metadata: Option<Value>) -> String {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.tracks_by_id.insert(id.clone(), self.tracks.len());
        self.tracks.push(TrackEntity {
            id: id.clone(),
            name: name.to_string(),
            metadata: metadata.unwrap_or(Value::Null),
            effects: Vec::new(),
        });
        id
    }

    pub fn get_track(&self, id: &str) -> Option<&TrackEntity> {
        self.tracks_by_id.get(id).map(|&i| &self.tracks[i])
    }

    /// Resolve a track by name, case-insensitively, first match wins.
    ///
    /// With `exact` false, a prefix match is accepted when no exact
    /// match exists.
    pub fn resolve_track(&self, name: &str, exact: bool) -> Option<&str> {
        let needle = name.to_lowercase();
        if let Some(track) = self
            .tracks
            .iter()
            .find(|t| t.name.to_lowercase() == needle)
        {
            return Some(&track.id);
        }
        if exact {
            return None;
        }
        self.tracks
            .iter()
            .find(|t| t.name.to_lowercase().starts_with(&needle))
            .map(|t| t.id.as_str())
    }

    pub fn list_tracks(&self) -> &[TrackEntity] {
        &self.tracks
    }

    pub fn add_effect(&mut self, track_id: &str, effect_type: &str) -> Result<(), RegistryError> {
        let idx = *self
            .tracks_by_id
            .get(track_id)
            .ok_or_else(|| RegistryError::UnknownTrack(track_id.to_string()))?;
        self.tracks[idx].effects.push(EffectRef {
            track_id: track_id.to_string(),
            effect_type: effect_type.to_string(),
        });
        Ok(())
    }

    // ── Regions ──

    /// Create a region, rejecting zero/negative durations and overlaps.
    ///
    /// An overlap that is not beat-identical to the existing region gets
    /// a warning log, per the idempotence rule that any overlap resolves
    /// to the existing region.
    pub fn create_region(
        &mut self,
        name: &str,
        track_id: &str,
        start_beat: f64,
        duration_beats: f64,
    ) -> Result<String, RegistryError> {
        if !self.tracks_by_id.contains_key(track_id) {
            return Err(RegistryError::UnknownTrack(track_id.to_string()));
        }
        if duration_beats <= 0.0 {
            return Err(RegistryError::ZeroDuration(duration_beats));
        }
        if let Some(existing) = self.find_overlapping_region(track_id, start_beat, duration_beats) {
            let entity = &self.regions[self.regions_by_id[existing]];
            if entity.start_beat != start_beat || entity.duration_beats != duration_beats {
                warn!(
                    track.id = %track_id,
                    region.existing = %existing,
                    region.requested_start = start_beat,
                    region.requested_duration = duration_beats,
                    "region overlaps existing range without matching it exactly"
                );
            }
            return Err(RegistryError::OverlapsExisting {
                track_id: track_id.to_string(),
                existing_region_id: existing.to_string(),
            });
        }

        let id = Uuid::new_v4().to_string();
        self.regions_by_id.insert(id.clone(), self.regions.len());
        self.latest_region_for_track
            .insert(track_id.to_string(), id.clone());
        self.regions.push(RegionEntity {
            id: id.clone(),
            name: name.to_string(),
            track_id: track_id.to_string(),
            start_beat,
            duration_beats,
            notes: Vec::new(),
            cc: Vec::new(),
            pitch_bends: Vec::new(),
            aftertouch: Vec::new(),
        });
        Ok(id)
    }

    pub fn get_region(&self, id: &str) -> Option<&RegionEntity> {
        self.regions_by_id.get(id).map(|&i| &self.regions[i])
    }

    pub fn get_region_mut(&mut self, id: &str) -> Option<&mut RegionEntity> {
        self.regions_by_id
            .get(id)
            .copied()
            .map(move |i| &mut self.regions[i])
    }

    /// First region on `track_id` whose interval intersects
    /// `[start, start + duration)`, else `None`.
    pub fn find_overlapping_region(
        &self,
        track_id: &str,
        start: f64,
        duration: f64,
    ) -> Option<&str> {
        self.regions
            .iter()
            .find(|r| r.track_id == track_id && r.overlaps(start, duration))
            .map(|r| r.id.as_str())
    }

    /// Resolve a region by name, case-insensitively, first match wins.
    pub fn resolve_region(&self, name: &str) -> Option<&str> {
        let needle = name.to_lowercase();
        self.regions
            .iter()
            .find(|r| r.name.to_lowercase() == needle)
            .map(|r| r.id.as_str())
    }

    pub fn regions_for_track(&self, track_id: &str) -> Vec<&RegionEntity> {
        self.regions
            .iter()
            .filter(|r| r.track_id == track_id)
            .collect()
    }

    pub fn latest_region_for_track(&self, track_id: &str) -> Option<&str> {
        self.latest_region_for_track
            .get(track_id)
            .map(String::as_str)
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    // ── Buses ──

    pub fn create_bus(&mut self, name: &str) -> String {
        let id = Uuid::new_v4().to_string();
        self.buses_by_id.insert(id.clone(), self.buses.len());
        self.buses.push(BusEntity {
            id: id.clone(),
            name: name.to_string(),
        });
        id
    }

    pub fn resolve_bus(&self, name: &str) -> Option<&str> {
        let needle = name.to_lowercase();
        self.buses
            .iter()
            .find(|b| b.name.to_lowercase() == needle)
            .map(|b| b.id.as_str())
    }

    // ── Sync ──

    /// Replace registry contents from a client-reported snapshot.
    pub fn replace_all(
        &mut self,
        tracks: Vec<TrackEntity>,
        regions: Vec<RegionEntity>,
        buses: Vec<BusEntity>,
    ) {
        self.tracks_by_id = tracks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();
        self.regions_by_id = regions
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();
        self.buses_by_id = buses
            .iter()
            .enumerate()
            .map(|(i, b)| (b.id.clone(), i))
            .collect();
        self.latest_region_for_track = regions
            .iter()
            .map(|r| (r.track_id.clone(), r.id.clone()))
            .collect();
        self.tracks = tracks;
        self.regions = regions;
        self.buses = buses;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_track() -> (EntityRegistry, String) {
        let mut reg = EntityRegistry::new();
        let track_id = reg.create_track("Drums", None, None);
        (reg, track_id)
    }

    #[test]
    fn test_track_name_resolution_is_case_insensitive() {
        let (reg, track_id) = registry_with_track();
        assert_eq!(reg.resolve_track("drums", true), Some(track_id.as_str()));
        assert_eq!(reg.resolve_track("DRUMS", true), Some(track_id.as_str()));
    }

    #[test]
    fn test_prefix_resolution_disabled_in_exact_mode() {
        let (reg, track_id) = registry_with_track();
        assert_eq!(reg.resolve_track("dru", false), Some(track_id.as_str()));
        assert_eq!(reg.resolve_track("dru", true), None);
    }

    #[test]
    fn test_first_match_wins_on_duplicate_names() {
        let mut reg = EntityRegistry::new();
        let first = reg.create_track("Bass", None, None);
        let _second = reg.create_track("Bass", None, None);
        assert_eq!(reg.resolve_track("bass", true), Some(first.as_str()));
    }

    #[test]
    fn test_overlapping_region_rejected_with_existing_id() {
        let (mut reg, track_id) = registry_with_track();
        let first = reg.create_region("A", &track_id, 0.0, 16.0).unwrap();
        let err = reg.create_region("B", &track_id, 8.0, 16.0).unwrap_err();
        match err {
            RegistryError::OverlapsExisting {
                existing_region_id, ..
            } => assert_eq!(existing_region_id, first),
            other => panic!("expected overlap error, got {other:?}"),
        }
    }

    #[test]
    fn test_adjacent_regions_do_not_overlap() {
        let (mut reg, track_id) = registry_with_track();
        reg.create_region("A", &track_id, 0.0, 16.0).unwrap();
        assert!(reg.create_region("B", &track_id, 16.0, 16.0).is_ok());
    }

    #[test]
    fn test_zero_duration_region_rejected() {
        let (mut reg, track_id) = registry_with_track();
        assert!(matches!(
            reg.create_region("A", &track_id, 0.0, 0.0),
            Err(RegistryError::ZeroDuration(_))
        ));
    }

    #[test]
    fn test_regions_on_different_tracks_may_overlap() {
        let mut reg = EntityRegistry::new();
        let a = reg.create_track("Drums", None, None);
        let b = reg.create_track("Bass", None, None);
        reg.create_region("A", &a, 0.0, 16.0).unwrap();
        assert!(reg.create_region("B", &b, 0.0, 16.0).is_ok());
    }

    #[test]
    fn test_latest_region_tracks_creation_order() {
        let (mut reg, track_id) = registry_with_track();
        let _first = reg.create_region("A", &track_id, 0.0, 8.0).unwrap();
        let second = reg.create_region("B", &track_id, 8.0, 8.0).unwrap();
        assert_eq!(reg.latest_region_for_track(&track_id), Some(second.as_str()));
    }

    #[test]
    fn test_snapshot_clone_is_independent() {
        let (mut reg, track_id) = registry_with_track();
        let snapshot = reg.clone();
        reg.create_region("A", &track_id, 0.0, 8.0).unwrap();
        assert_eq!(reg.region_count(), 1);
        assert_eq!(snapshot.region_count(), 0);
    }
}
