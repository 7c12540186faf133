//! Versioned, transactional project state.
//!
//! The store is the authoritative source of truth for one conversation's
//! project. Every mutation appends an event and bumps the monotonically
//! increasing version; rollback restores the registry and metadata from
//! the snapshot taken at `begin_transaction` but never rewinds the
//! version counter. Exactly one writer per store instance: callers
//! serialise access through [`SharedStore`].

pub mod events;
pub mod registry;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use bandproto::notes::{Aftertouch, ControllerEvent, Note, PitchBend};

pub use events::{EntityType, EventType, ProjectMetadata, StateEvent, StateSnapshot, Transaction};
pub use registry::{BusEntity, EntityRegistry, RegionEntity, RegistryError, TrackEntity};

use events::TxState;

/// Snapshots retained for rollback.
const SNAPSHOT_RING: usize = 10;

/// Handle identifying an open transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxId(pub Uuid);

/// Errors raised by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transaction already active; commit or rollback first")]
    TransactionActive,

    #[error("transaction is not active")]
    TransactionNotActive,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Criteria identifying notes to remove from a region.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoteCriteria {
    #[serde(default)]
    pub pitch: Option<u8>,
    #[serde(default, alias = "startBeat")]
    pub start_beat: Option<f64>,
}

impl NoteCriteria {
    fn matches(&self, note: &Note) -> bool {
        self.pitch.map_or(true, |p| note.pitch == p)
            && self.start_beat.map_or(true, |s| note.start_beat == s)
    }
}

/// A client-reported project snapshot for [`StateStore::sync_from_client`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    #[serde(default)]
    pub tracks: Vec<TrackEntity>,
    #[serde(default)]
    pub regions: Vec<RegionEntity>,
    #[serde(default)]
    pub buses: Vec<BusEntity>,
    #[serde(default)]
    pub tempo: Option<u32>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default, alias = "timeSignature")]
    pub time_signature: Option<(u32, u32)>,
}

/// Single-writer shared handle for one conversation's store.
pub type SharedStore = Arc<tokio::sync::Mutex<StateStore>>;

/// Versioned, event-sourced project state for one conversation.
pub struct StateStore {
    conversation_id: String,
    registry: EntityRegistry,
    metadata: ProjectMetadata,
    version: u64,
    events: Vec<StateEvent>,
    snapshots: Vec<StateSnapshot>,
    active_tx: Option<Transaction>,
}

impl StateStore {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        let conversation_id = conversation_id.into();
        debug!(conversation.id = %conversation_id, "state store initialized");
        Self {
            conversation_id,
            registry: EntityRegistry::new(),
            metadata: ProjectMetadata::default(),
            version: 0,
            events: Vec::new(),
            snapshots: Vec::new(),
            active_tx: None,
        }
    }

    /// Wrap a fresh store in the shared single-writer handle.
    pub fn shared(conversation_id: impl Into<String>) -> SharedStore {
        Arc::new(tokio::sync::Mutex::new(Self::new(conversation_id)))
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn tempo(&self) -> u32 {
        self.metadata.tempo
    }

    pub fn key(&self) -> &str {
        &self.metadata.key
    }

    pub fn events(&self) -> &[StateEvent] {
        &self.events
    }

    pub fn active_transaction(&self) -> Option<&Transaction> {
        self.active_tx.as_ref()
    }

    // ── Transactions ──

    /// Begin a transaction. The pre-transaction snapshot is taken before
    /// the `transaction.start` event so rollback restores to exactly the
    /// state at the moment of begin.
    pub fn begin_transaction(&mut self, description: &str) -> Result<TxId, StoreError> {
        if self.active_tx.as_ref().is_some_and(Transaction::is_active) {
            return Err(StoreError::TransactionActive);
        }

        self.take_snapshot();

        let tx = Transaction::new(description.to_string());
        let id = tx.id;
        self.active_tx = Some(tx);
        self.append_event(
            EventType::TransactionStart,
            None,
            None,
            json!({ "description": description }),
        );

        info!(tx.id = %id, "transaction started");
        Ok(TxId(id))
    }

    pub fn commit(&mut self, tx: TxId) -> Result<(), StoreError> {
        let active = match &mut self.active_tx {
            Some(t) if t.id == tx.0 && t.is_active() => t,
            _ => return Err(StoreError::TransactionNotActive),
        };
        let event_count = active.event_count();
        active.state = TxState::Committed;

        self.append_event(
            EventType::TransactionCommit,
            None,
            None,
            json!({ "event_count": event_count }),
        );
        self.active_tx = None;

        info!(tx.id = %tx.0, tx.events = event_count, "transaction committed");
        Ok(())
    }

    /// Roll back: restore the pre-transaction snapshot, drop the
    /// transaction's events from the log, and append
    /// `transaction.rollback`. The version counter keeps increasing.
    pub fn rollback(&mut self, tx: TxId) -> Result<(), StoreError> {
        let active = match &mut self.active_tx {
            Some(t) if t.id == tx.0 && t.is_active() => t,
            _ => return Err(StoreError::TransactionNotActive),
        };
        active.state = TxState::RolledBack;
        let rolled_back = active.event_count();
        let first_version = active.event_versions.first().copied();

        if let Some(first) = first_version {
            let snapshot = self
                .snapshots
                .iter()
                .rev()
                .find(|s| s.version < first)
                .cloned();
            if let Some(snapshot) = snapshot {
                self.restore_snapshot(&snapshot);
            }
        }

        self.events.retain(|e| e.transaction_id != Some(tx.0));
        self.active_tx = None;
        self.append_event(
            EventType::TransactionRollback,
            None,
            None,
            json!({ "rolled_back_events": rolled_back }),
        );

        warn!(tx.id = %tx.0, tx.events = rolled_back, "transaction rolled back");
        Ok(())
    }

    // ── Entity creation ──

    pub fn create_track(
        &mut self,
        name: &str,
        id: Option<String>,
        metadata: Option<Value>,
    ) -> String {
        let track_id = self.registry.create_track(name, id, metadata.clone());
        self.append_event(
            EventType::TrackCreated,
            Some(EntityType::Track),
            Some(track_id.clone()),
            json!({ "name": name, "metadata": metadata.unwrap_or(Value::Null) }),
        );
        track_id
    }

    pub fn create_region(
        &mut self,
        name: &str,
        parent_track_id: &str,
        start_beat: f64,
        duration_beats: f64,
    ) -> Result<String, StoreError> {
        let region_id =
            self.registry
                .create_region(name, parent_track_id, start_beat, duration_beats)?;
        self.append_event(
            EventType::RegionCreated,
            Some(EntityType::Region),
            Some(region_id.clone()),
            json!({
                "name": name,
                "parent_track_id": parent_track_id,
                "start_beat": start_beat,
                "duration_beats": duration_beats,
            }),
        );
        Ok(region_id)
    }

    pub fn find_overlapping_region(
        &self,
        track_id: &str,
        start: f64,
        duration: f64,
    ) -> Option<&str> {
        self.registry.find_overlapping_region(track_id, start, duration)
    }

    pub fn get_or_create_bus(&mut self, name: &str) -> String {
        if let Some(existing) = self.registry.resolve_bus(name) {
            return existing.to_string();
        }
        let bus_id = self.registry.create_bus(name);
        self.append_event(
            EventType::BusCreated,
            Some(EntityType::Bus),
            Some(bus_id.clone()),
            json!({ "name": name }),
        );
        bus_id
    }

    // ── Project metadata ──

    pub fn set_tempo(&mut self, tempo: u32) {
        let old = self.metadata.tempo;
        self.metadata.tempo = tempo;
        self.append_event(
            EventType::TempoChanged,
            None,
            None,
            json!({ "old_tempo": old, "new_tempo": tempo }),
        );
    }

    pub fn set_key(&mut self, key: &str) {
        let old = self.metadata.key.clone();
        self.metadata.key = key.to_string();
        self.append_event(
            EventType::KeyChanged,
            None,
            None,
            json!({ "old_key": old, "new_key": key }),
        );
    }

    // ── Musical content ──

    pub fn add_notes(&mut self, region_id: &str, notes: Vec<Note>) -> Result<(), StoreError> {
        let count = notes.len();
        let region = self
            .registry
            .get_region_mut(region_id)
            .ok_or_else(|| RegistryError::UnknownRegion(region_id.to_string()))?;
        region.notes.extend(notes.iter().cloned());
        self.append_event(
            EventType::NotesAdded,
            Some(EntityType::Region),
            Some(region_id.to_string()),
            json!({ "notes_count": count, "notes": notes }),
        );
        Ok(())
    }

    pub fn remove_notes(
        &mut self,
        region_id: &str,
        criteria: Vec<NoteCriteria>,
    ) -> Result<usize, StoreError> {
        let region = self
            .registry
            .get_region_mut(region_id)
            .ok_or_else(|| RegistryError::UnknownRegion(region_id.to_string()))?;
        let before = region.notes.len();
        region
            .notes
            .retain(|note| !criteria.iter().any(|c| c.matches(note)));
        let removed = before - region.notes.len();
        self.append_event(
            EventType::NotesRemoved,
            Some(EntityType::Region),
            Some(region_id.to_string()),
            json!({ "notes_count": removed, "criteria": criteria }),
        );
        Ok(removed)
    }

    pub fn add_cc(
        &mut self,
        region_id: &str,
        cc_events: Vec<ControllerEvent>,
    ) -> Result<(), StoreError> {
        let region = self
            .registry
            .get_region_mut(region_id)
            .ok_or_else(|| RegistryError::UnknownRegion(region_id.to_string()))?;
        region.cc.extend(cc_events);
        Ok(())
    }

    pub fn add_pitch_bends(
        &mut self,
        region_id: &str,
        bends: Vec<PitchBend>,
    ) -> Result<(), StoreError> {
        let region = self
            .registry
            .get_region_mut(region_id)
            .ok_or_else(|| RegistryError::UnknownRegion(region_id.to_string()))?;
        region.pitch_bends.extend(bends);
        Ok(())
    }

    pub fn add_aftertouch(
        &mut self,
        region_id: &str,
        events: Vec<Aftertouch>,
    ) -> Result<(), StoreError> {
        let region = self
            .registry
            .get_region_mut(region_id)
            .ok_or_else(|| RegistryError::UnknownRegion(region_id.to_string()))?;
        region.aftertouch.extend(events);
        Ok(())
    }

    pub fn add_effect(&mut self, track_id: &str, effect_type: &str) -> Result<(), StoreError> {
        self.registry.add_effect(track_id, effect_type)?;
        self.append_event(
            EventType::EffectAdded,
            Some(EntityType::Track),
            Some(track_id.to_string()),
            json!({ "effect_type": effect_type }),
        );
        Ok(())
    }

    // ── Sync & introspection ──

    /// Sync with a client-reported project state. The client is
    /// authoritative for imports, so no events are appended.
    pub fn sync_from_client(&mut self, snapshot: ProjectSnapshot) {
        self.registry
            .replace_all(snapshot.tracks, snapshot.regions, snapshot.buses);
        if let Some(tempo) = snapshot.tempo {
            self.metadata.tempo = tempo;
        }
        if let Some(key) = snapshot.key {
            self.metadata.key = key;
        }
        if let Some(ts) = snapshot.time_signature {
            self.metadata.time_signature = ts;
        }
    }

    pub fn get_state_id(&self) -> String {
        self.version.to_string()
    }

    pub fn get_events_since(&self, version: u64) -> Vec<StateEvent> {
        self.events
            .iter()
            .filter(|e| e.version > version)
            .cloned()
            .collect()
    }

    // ── Internals ──

    fn append_event(
        &mut self,
        event_type: EventType,
        entity_type: Option<EntityType>,
        entity_id: Option<String>,
        data: Value,
    ) {
        self.version += 1;
        let tx_id = self
            .active_tx
            .as_ref()
            .filter(|t| t.is_active())
            .map(|t| t.id);
        let event = StateEvent {
            id: Uuid::new_v4(),
            event_type,
            entity_type,
            entity_id,
            data,
            timestamp: chrono::Utc::now(),
            version: self.version,
            transaction_id: tx_id,
        };
        if let Some(tx) = self.active_tx.as_mut().filter(|t| t.is_active()) {
            tx.event_versions.push(event.version);
        }
        self.events.push(event);
    }

    fn take_snapshot(&mut self) {
        self.snapshots.push(StateSnapshot {
            version: self.version,
            timestamp: chrono::Utc::now(),
            registry: self.registry.clone(),
            metadata: self.metadata.clone(),
        });
        if self.snapshots.len() > SNAPSHOT_RING {
            let overflow = self.snapshots.len() - SNAPSHOT_RING;
            self.snapshots.drain(..overflow);
        }
    }

    fn restore_snapshot(&mut self, snapshot: &StateSnapshot) {
        self.registry = snapshot.registry.clone();
        self.metadata = snapshot.metadata.clone();
        info!(snapshot.version = snapshot.version, "restored pre-transaction snapshot");
    }
}
