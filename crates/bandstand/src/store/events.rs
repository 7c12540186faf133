//! State mutation events, transactions, and snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::registry::EntityRegistry;

/// Types of state mutation events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "track.created")]
    TrackCreated,
    #[serde(rename = "region.created")]
    RegionCreated,
    #[serde(rename = "bus.created")]
    BusCreated,
    #[serde(rename = "notes.added")]
    NotesAdded,
    #[serde(rename = "notes.removed")]
    NotesRemoved,
    #[serde(rename = "effect.added")]
    EffectAdded,
    #[serde(rename = "tempo.changed")]
    TempoChanged,
    #[serde(rename = "key.changed")]
    KeyChanged,
    #[serde(rename = "transaction.start")]
    TransactionStart,
    #[serde(rename = "transaction.commit")]
    TransactionCommit,
    #[serde(rename = "transaction.rollback")]
    TransactionRollback,
}

/// Entity kinds referenced by events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Track,
    Region,
    Bus,
}

/// A single entry in the append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEvent {
    pub id: Uuid,
    pub event_type: EventType,
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<String>,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub version: u64,
    pub transaction_id: Option<Uuid>,
}

/// A group of events that commit or roll back together.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: Uuid,
    pub description: String,
    pub started_at: DateTime<Utc>,
    pub(super) state: TxState,
    /// Versions of the events recorded under this transaction.
    pub(super) event_versions: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TxState {
    Active,
    Committed,
    RolledBack,
}

impl Transaction {
    pub(super) fn new(description: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            description,
            started_at: Utc::now(),
            state: TxState::Active,
            event_versions: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == TxState::Active
    }

    pub fn event_count(&self) -> usize {
        self.event_versions.len()
    }
}

/// A full capture of registry and project metadata at one version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub registry: EntityRegistry,
    pub metadata: ProjectMetadata,
}

/// Project-level settings carried alongside the entity tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMetadata {
    pub tempo: u32,
    pub key: String,
    pub time_signature: (u32, u32),
}

impl Default for ProjectMetadata {
    fn default() -> Self {
        Self {
            tempo: 120,
            key: "C".to_string(),
            time_signature: (4, 4),
        }
    }
}
