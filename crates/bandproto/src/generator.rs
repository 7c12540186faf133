//! Wire types for the external music-generation service.
//!
//! The service exposes `POST /generate` (async submit, immediate cache
//! hits) and `GET /jobs/{id}/wait?timeout=N` (long poll). Its responses
//! sometimes pack musical data inside DAW-style tool calls; those raw
//! payloads are modelled here and flattened by the client's adapter so
//! the service's private tool vocabulary never leaks into the core.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::notes::{Aftertouch, ControllerEvent, Note, PitchBend};

/// Submit body for `POST /generate`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub genre: String,
    pub tempo: u32,
    pub instruments: Vec<String>,
    pub bars: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub musical_goals: Option<Vec<String>>,
    pub tone_brightness: f64,
    pub tone_warmth: f64,
    pub energy_intensity: f64,
    pub energy_excitement: f64,
    pub complexity: f64,
    pub quality_preset: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub composition_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_notes: Option<Vec<Note>>,
}

/// Lifecycle of a generation job on the service side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Complete,
    Failed,
}

/// Response to `POST /generate`. `status == Complete` with a populated
/// `result` is the cache-hit fast path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    #[serde(default)]
    pub job_id: Option<String>,
    pub status: JobStatus,
    #[serde(default)]
    pub position: Option<u32>,
    #[serde(default)]
    pub result: Option<RawJobResult>,
}

/// Response to `GET /jobs/{id}/wait`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobWaitResponse {
    pub status: JobStatus,
    #[serde(default)]
    pub result: Option<RawJobResult>,
    #[serde(default)]
    pub error: Option<String>,
}

/// The service's raw job payload before adapter flattening.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawJobResult {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default)]
    pub tool_calls: Vec<RawToolCall>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// One DAW-style tool call inside a raw job result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawToolCall {
    pub tool: String,
    #[serde(default)]
    pub params: Value,
}

/// Flattened generation outcome consumed by the executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneratorResult {
    pub success: bool,
    pub notes: Vec<Note>,
    pub cc_events: Vec<ControllerEvent>,
    pub pitch_bends: Vec<PitchBend>,
    pub aftertouch: Vec<Aftertouch>,
    pub tool_calls: Vec<RawToolCall>,
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl GeneratorResult {
    /// A failed outcome carrying only an error message.
    pub fn failure(error: impl Into<String>, retry_count: u32) -> Self {
        let mut metadata = Map::new();
        metadata.insert("retry_count".to_string(), Value::from(retry_count));
        Self {
            success: false,
            error: Some(error.into()),
            metadata,
            ..Default::default()
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.metadata
            .get("retry_count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_response_cache_hit_shape() {
        let body = r#"{
            "jobId": "j-1",
            "status": "complete",
            "result": {"success": true, "notes": [{"pitch": 36, "startBeat": 0}]}
        }"#;
        let resp: SubmitResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.status, JobStatus::Complete);
        let result = resp.result.unwrap();
        assert!(result.success);
        assert_eq!(result.notes[0].pitch, 36);
    }

    #[test]
    fn test_wait_response_failure_carries_error() {
        let body = r#"{"status": "failed", "error": "model exploded"}"#;
        let resp: JobWaitResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.status, JobStatus::Failed);
        assert_eq!(resp.error.as_deref(), Some("model exploded"));
    }

    #[test]
    fn test_failure_result_records_retry_count() {
        let result = GeneratorResult::failure("queue full", 3);
        assert!(!result.success);
        assert_eq!(result.retry_count(), 3);
    }

    #[test]
    fn test_submit_request_omits_empty_optionals() {
        let req = SubmitRequest {
            genre: "house".into(),
            tempo: 124,
            instruments: vec!["drums".into()],
            bars: 8,
            quality_preset: "quality".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("key").is_none());
        assert!(json.get("previous_notes").is_none());
    }
}
