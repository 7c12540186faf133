//! HTTP surface: a streaming compose endpoint and a health probe.
//!
//! `POST /compose` runs one composition and streams newline-delimited
//! JSON events as they happen; the connection stays open until the
//! final `complete` (or `error`) event. Each request gets its own
//! conversation-scoped state store.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::info;

use bandconf::Settings;

use crate::agents::coordinator::{run_composition, CompositionRun};
use crate::agents::TraceContext;
use crate::generator::GeneratorClient;
use crate::llm::ToolCallingLlm;
use crate::prompt::ParsedPrompt;
use crate::store::{ProjectSnapshot, StateStore};
use crate::stream::{channel, ndjson_line};

#[derive(Clone)]
pub struct AppState {
    pub llm: Arc<dyn ToolCallingLlm>,
    pub generator: Arc<GeneratorClient>,
    pub settings: Settings,
}

/// Body of `POST /compose`. The prompt parser is an upstream concern;
/// callers send the parsed form plus the raw text for the agents that
/// want to quote it.
#[derive(Debug, Deserialize)]
pub struct ComposeRequest {
    pub parsed: ParsedPrompt,
    #[serde(default)]
    pub prompt: String,
    /// Client-authoritative project snapshot, imported before composing.
    #[serde(default)]
    pub project: Option<ProjectSnapshot>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/compose", post(compose))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn compose(
    State(state): State<AppState>,
    Json(request): Json<ComposeRequest>,
) -> Response {
    let trace = TraceContext::new();
    info!(
        trace = trace.short(),
        roles = ?request.parsed.roles,
        "compose request accepted"
    );

    let store = StateStore::shared(trace.trace_id.clone());
    if let Some(project) = request.project {
        store.lock().await.sync_from_client(project);
    }

    let (emit, mut events) = channel();
    let run = CompositionRun {
        parsed: request.parsed,
        raw_prompt: request.prompt,
        llm: state.llm.clone(),
        store,
        generator: state.generator.clone(),
        settings: state.settings.orchestration.clone(),
        emit,
        trace,
    };
    tokio::spawn(run_composition(run));

    let body_stream = async_stream::stream! {
        while let Some(event) = events.next().await {
            yield Ok::<Bytes, Infallible>(Bytes::from(ndjson_line(&event)));
        }
    };

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(body_stream),
    )
        .into_response()
}
