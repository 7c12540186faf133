//! Cross-instrument readiness signalling.
//!
//! One [`SectionSignals`] instance is shared between the drum and bass
//! instrument agents. Each drum section child calls `signal_complete`
//! after generating, storing its notes and waking the waiter; the
//! matching bass section child calls `wait_for` before generating.
//!
//! Keys are `"{section_id}:{contract_hash}"`, never section names, so
//! repeated section names cannot collide and a waiter presenting the
//! wrong lineage simply times out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tracing::{info, warn};

use bandproto::notes::Note;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("timed out waiting for section signal {key}")]
    Timeout { key: String },

    #[error("signal for {key} carries mismatched contract hash {stored}")]
    ProtocolViolation { key: String, stored: String },
}

/// Typed outcome stored by `signal_complete`.
#[derive(Debug, Clone)]
pub struct SectionSignalResult {
    pub success: bool,
    pub drum_notes: Option<Vec<Note>>,
    pub contract_hash: String,
}

#[derive(Default)]
struct Slot {
    result: Option<SectionSignalResult>,
    notify: Arc<Notify>,
}

/// Per-section one-shot completion events.
#[derive(Default)]
pub struct SectionSignals {
    slots: Mutex<HashMap<String, Slot>>,
}

fn signal_key(section_id: &str, contract_hash: &str) -> String {
    format!("{section_id}:{contract_hash}")
}

impl SectionSignals {
    /// Pre-create one completion event per `(section_id, hash)` pair.
    pub fn from_section_ids(keys: &[(String, String)]) -> Self {
        let slots = keys
            .iter()
            .map(|(section_id, hash)| (signal_key(section_id, hash), Slot::default()))
            .collect();
        Self {
            slots: Mutex::new(slots),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().map(|s| s.is_empty()).unwrap_or(true)
    }

    /// Store a completion result and wake the waiter. Idempotent: the
    /// first write wins and later calls are silently ignored. The result
    /// is stored before the notify so the waiter always observes it.
    pub fn signal_complete(
        &self,
        section_id: &str,
        contract_hash: &str,
        success: bool,
        drum_notes: Option<Vec<Note>>,
    ) {
        let key = signal_key(section_id, contract_hash);
        let Ok(mut slots) = self.slots.lock() else {
            return;
        };
        let slot = slots.entry(key.clone()).or_default();
        if slot.result.is_some() {
            return;
        }
        slot.result = Some(SectionSignalResult {
            success,
            drum_notes,
            contract_hash: contract_hash.to_string(),
        });
        slot.notify.notify_one();
        info!(key = %key, success, "section signal stored");
    }

    /// Await the completion result for `(section_id, contract_hash)`.
    ///
    /// Returns `Ok(None)` immediately when the bus has no registered
    /// events at all (a composition without drums). A key that never
    /// gets signalled, including a waiter presenting the wrong hash,
    /// times out.
    pub async fn wait_for(
        &self,
        section_id: &str,
        contract_hash: &str,
        timeout: Duration,
    ) -> Result<Option<SectionSignalResult>, SignalError> {
        if self.is_empty() {
            return Ok(None);
        }
        let key = signal_key(section_id, contract_hash);

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notify = {
                let Ok(mut slots) = self.slots.lock() else {
                    return Ok(None);
                };
                let slot = slots.entry(key.clone()).or_default();
                if let Some(result) = &slot.result {
                    if result.contract_hash != contract_hash {
                        warn!(
                            key = %key,
                            stored = %result.contract_hash,
                            "stored signal result does not match its key"
                        );
                        return Err(SignalError::ProtocolViolation {
                            key,
                            stored: result.contract_hash.clone(),
                        });
                    }
                    return Ok(Some(result.clone()));
                }
                slot.notify.clone()
            };

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(SignalError::Timeout { key });
            }
            if tokio::time::timeout(remaining, notify.notified())
                .await
                .is_err()
            {
                return Err(SignalError::Timeout { key });
            }
        }
    }

    /// Inject a result with an arbitrary inner hash. Only for tests of
    /// the protocol-violation path; production writes always go through
    /// `signal_complete`.
    #[cfg(test)]
    pub(crate) fn store_raw(&self, key: &str, result: SectionSignalResult) {
        if let Ok(mut slots) = self.slots.lock() {
            let slot = slots.entry(key.to_string()).or_default();
            slot.result = Some(result);
            slot.notify.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    fn kick() -> Vec<Note> {
        vec![Note {
            pitch: 36,
            start_beat: 0.0,
            duration_beats: 0.5,
            velocity: 110,
            channel: 9,
        }]
    }

    #[tokio::test]
    async fn test_wait_sees_notes_signalled_before_wait() {
        let signals = SectionSignals::from_section_ids(&keys(&[("0:intro", "aaaa")]));
        signals.signal_complete("0:intro", "aaaa", true, Some(kick()));
        let result = signals
            .wait_for("0:intro", "aaaa", Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert!(result.success);
        assert_eq!(result.drum_notes.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_wait_wakes_on_later_signal() {
        let signals = Arc::new(SectionSignals::from_section_ids(&keys(&[("0:intro", "aaaa")])));
        let waiter = {
            let signals = signals.clone();
            tokio::spawn(async move {
                signals
                    .wait_for("0:intro", "aaaa", Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        signals.signal_complete("0:intro", "aaaa", true, Some(kick()));
        let result = waiter.await.unwrap().unwrap().unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_wrong_hash_times_out() {
        let signals = SectionSignals::from_section_ids(&keys(&[("0:intro", "aaaa")]));
        signals.signal_complete("0:intro", "aaaa", true, None);
        let result = signals
            .wait_for("0:intro", "bbbb", Duration::from_millis(30))
            .await;
        assert!(matches!(result, Err(SignalError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_empty_bus_returns_none_immediately() {
        let signals = SectionSignals::default();
        let result = signals
            .wait_for("0:intro", "aaaa", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_second_signal_is_a_no_op() {
        let signals = SectionSignals::from_section_ids(&keys(&[("0:intro", "aaaa")]));
        signals.signal_complete("0:intro", "aaaa", true, Some(kick()));
        signals.signal_complete("0:intro", "aaaa", false, None);
        let result = signals
            .wait_for("0:intro", "aaaa", Duration::from_millis(30))
            .await
            .unwrap()
            .unwrap();
        assert!(result.success, "first write must win");
    }

    #[tokio::test]
    async fn test_mismatched_stored_hash_is_protocol_violation() {
        let signals = SectionSignals::from_section_ids(&keys(&[("0:intro", "aaaa")]));
        signals.store_raw(
            "0:intro:aaaa",
            SectionSignalResult {
                success: true,
                drum_notes: None,
                contract_hash: "zzzz".to_string(),
            },
        );
        let result = signals
            .wait_for("0:intro", "aaaa", Duration::from_millis(30))
            .await;
        assert!(matches!(result, Err(SignalError::ProtocolViolation { .. })));
    }

    #[tokio::test]
    async fn test_failure_signal_reports_unsuccessful() {
        let signals = SectionSignals::from_section_ids(&keys(&[("1:verse", "cccc")]));
        signals.signal_complete("1:verse", "cccc", false, None);
        let result = signals
            .wait_for("1:verse", "cccc", Duration::from_millis(30))
            .await
            .unwrap()
            .unwrap();
        assert!(!result.success);
        assert!(result.drum_notes.is_none());
    }
}
