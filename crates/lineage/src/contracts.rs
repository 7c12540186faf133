//! Sealed contracts for the three-level agent architecture.
//!
//! Contracts are typed, immutable handoffs between scheduling layers.
//! They replace loose maps and natural-language passthrough so a child
//! layer can never reinterpret structural decisions made above it.
//!
//! Hierarchy:
//!   L1 → L2: [`InstrumentContract`] (coordinator builds, agent executes)
//!   L2 → L3: [`SectionContract`]    (dispatch builds, section child executes)
//!
//! Every contract is sealed immediately after construction: the hash is
//! computed once and stored, and the value is never mutated afterwards.
//! Advisory fields (`l2_generate_prompt`, `region_name`, `gm_guidance`,
//! `assigned_color`, `existing_track_id`) are excluded from hashing.

use serde::{Deserialize, Serialize};

use crate::hash::{
    canonical_value, compute_contract_hash, execution_hash, hash_canonical, HashError,
};

/// One section's layout in the composition plan.
///
/// Built by the coordinator from the parsed prompt. L2 and L3 execute
/// against these values; they never recompute or reinterpret them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionSpec {
    /// Stable identifier, `"{index}:{name}"` (e.g. `"0:intro"`). Keyed by
    /// id rather than name so repeated section names cannot collide.
    pub section_id: String,
    pub name: String,
    pub index: u32,
    pub start_beat: u32,
    pub duration_beats: u32,
    pub bars: u32,
    /// Canonical overall description of the section.
    pub character: String,
    /// Canonical per-role description.
    pub role_brief: String,
    #[serde(default)]
    pub contract_hash: String,
    #[serde(default)]
    pub parent_contract_hash: String,
}

impl SectionSpec {
    /// Compose the canonical section id for an index/name pair.
    pub fn make_id(index: u32, name: &str) -> String {
        format!("{}:{}", index, name)
    }

    /// Compute and store this section's structural hash.
    pub fn seal(mut self) -> Result<Self, HashError> {
        self.contract_hash = compute_contract_hash(&self)?;
        Ok(self)
    }

    /// Recompute the hash and compare against the stored value.
    pub fn verify(&self) -> Result<bool, HashError> {
        if self.contract_hash.is_empty() {
            return Ok(false);
        }
        Ok(compute_contract_hash(self)? == self.contract_hash)
    }
}

/// Root of the contract tree: the whole composition's structural plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositionContract {
    pub composition_id: String,
    pub sections: Vec<SectionSpec>,
    pub style: String,
    pub tempo: f64,
    pub key: String,
    #[serde(default)]
    pub contract_hash: String,
    #[serde(default)]
    pub parent_contract_hash: String,
}

impl CompositionContract {
    /// Canonical form: `sections` is replaced with the sorted list of
    /// member section hashes, keeping the root hash compact and
    /// order-independent.
    fn canonical(&self) -> Result<serde_json::Value, HashError> {
        let mut value = canonical_value(self)?;
        let mut hashes: Vec<String> = self
            .sections
            .iter()
            .map(|s| s.contract_hash.clone())
            .collect();
        hashes.sort();
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "sections".to_string(),
                serde_json::Value::Array(
                    hashes.into_iter().map(serde_json::Value::String).collect(),
                ),
            );
        }
        Ok(value)
    }

    /// Seal the composition root. Member sections must be sealed first.
    pub fn seal(mut self) -> Result<Self, HashError> {
        self.contract_hash = hash_canonical(&self.canonical()?);
        Ok(self)
    }

    pub fn verify(&self) -> Result<bool, HashError> {
        if self.contract_hash.is_empty() {
            return Ok(false);
        }
        Ok(hash_canonical(&self.canonical()?) == self.contract_hash)
    }

    /// Section ids in plan order.
    pub fn section_ids(&self) -> Vec<String> {
        self.sections.iter().map(|s| s.section_id.clone()).collect()
    }
}

/// Immutable contract from the coordinator (L1) to one instrument agent (L2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentContract {
    pub instrument_name: String,
    pub role: String,
    pub style: String,
    pub bars: u32,
    pub tempo: f64,
    pub key: String,
    pub start_beat: u32,
    pub sections: Vec<SectionSpec>,
    /// Advisory: reuse this track instead of creating one.
    pub existing_track_id: Option<String>,
    /// Advisory: palette colour assigned by the coordinator.
    pub assigned_color: Option<String>,
    /// Advisory: General-MIDI guidance text for the system prompt.
    #[serde(default)]
    pub gm_guidance: String,
    #[serde(default)]
    pub contract_hash: String,
    #[serde(default)]
    pub parent_contract_hash: String,
}

impl InstrumentContract {
    /// Seal with lineage to the composition root.
    pub fn seal(mut self, parent_hash: &str) -> Result<Self, HashError> {
        self.parent_contract_hash = parent_hash.to_string();
        self.contract_hash = compute_contract_hash(&self)?;
        Ok(self)
    }

    pub fn verify(&self) -> Result<bool, HashError> {
        if self.contract_hash.is_empty() {
            return Ok(false);
        }
        Ok(compute_contract_hash(self)? == self.contract_hash)
    }

    pub fn is_drum(&self) -> bool {
        matches!(self.role.to_lowercase().as_str(), "drums" | "drum")
    }

    pub fn is_bass(&self) -> bool {
        self.role.to_lowercase() == "bass"
    }

    pub fn multi_section(&self) -> bool {
        self.sections.len() > 1
    }

    pub fn reusing_track(&self) -> bool {
        self.existing_track_id.is_some()
    }
}

/// Immutable contract from an instrument agent (L2) to one section child (L3).
///
/// L3 must use structural fields exactly as provided. It may only reason
/// about how to describe the music to the generator, never about what
/// section it is or where regions go. `l2_generate_prompt` is advisory;
/// the child prefers `section.character` and `section.role_brief` when
/// they conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionContract {
    pub section: SectionSpec,
    pub track_id: String,
    pub instrument_name: String,
    pub role: String,
    pub style: String,
    pub tempo: f64,
    pub key: String,
    /// Advisory: display name for the region.
    #[serde(default)]
    pub region_name: String,
    /// Advisory: the L2's suggested generation prompt.
    #[serde(default)]
    pub l2_generate_prompt: String,
    #[serde(default)]
    pub contract_hash: String,
    #[serde(default)]
    pub parent_contract_hash: String,
}

impl SectionContract {
    /// Seal with lineage to the owning instrument contract.
    pub fn seal(mut self, parent_hash: &str) -> Result<Self, HashError> {
        self.parent_contract_hash = parent_hash.to_string();
        self.contract_hash = compute_contract_hash(&self)?;
        Ok(self)
    }

    pub fn verify(&self) -> Result<bool, HashError> {
        if self.contract_hash.is_empty() {
            return Ok(false);
        }
        Ok(compute_contract_hash(self)? == self.contract_hash)
    }

    /// Per-run attestation binding this contract to one trace.
    pub fn execution_hash(&self, trace_id: &str) -> String {
        execution_hash(&self.contract_hash, trace_id)
    }

    pub fn is_drum(&self) -> bool {
        matches!(self.role.to_lowercase().as_str(), "drums" | "drum")
    }

    pub fn is_bass(&self) -> bool {
        self.role.to_lowercase() == "bass"
    }

    pub fn section_id(&self) -> &str {
        &self.section.section_id
    }

    pub fn section_name(&self) -> &str {
        &self.section.name
    }

    pub fn start_beat(&self) -> u32 {
        self.section.start_beat
    }

    pub fn duration_beats(&self) -> u32 {
        self.section.duration_beats
    }

    pub fn bars(&self) -> u32 {
        self.section.bars
    }
}
