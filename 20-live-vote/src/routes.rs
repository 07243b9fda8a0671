use std::{sync::Arc, time::Duration};

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{Method, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::{
    config::ServerConfig,
    counter::VoteCounter,
    error::VoteError,
    keys::{OptionId, SessionId},
    relay::ResultRelay,
    session::{NewSession, SessionDirectory},
    store::KvStore,
};

/// Shared handles every request handler works through. Holds no vote state of
/// its own; cloning only bumps reference counts.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn KvStore>,
    pub counter: VoteCounter,
    pub relay: ResultRelay,
    pub sessions: SessionDirectory,
    pub keep_alive: Duration,
}

impl AppState {
    pub fn new(store: Arc<dyn KvStore>, config: &ServerConfig) -> Self {
        Self {
            counter: VoteCounter::new(Arc::clone(&store), config.keys.clone(), config.retry),
            relay: ResultRelay::new(Arc::clone(&store), config.keys.clone()),
            sessions: SessionDirectory::new(Arc::clone(&store), config.keys.clone()),
            keep_alive: config.keep_alive,
            store,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .allow_origin(Any)
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/health", get(health_handler))
        .route("/sessions", get(list_sessions_handler).post(create_session_handler))
        .route("/sessions/:session_id", get(get_session_handler))
        .route("/sessions/:session_id/vote", post(vote_handler))
        .route("/sessions/:session_id/results/stream", get(stream_results_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> Response {
    match state.store.status().await {
        Ok(status) => Json(json!({
            "status": "ok",
            "store_connected": true,
            "store": status,
        }))
        .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "status": "error",
                "store_connected": false,
                "error": err.to_string(),
            })),
        )
            .into_response(),
    }
}

async fn list_sessions_handler(State(state): State<AppState>) -> Result<Response, VoteError> {
    let sessions = state.sessions.list().await?;
    Ok(Json(sessions).into_response())
}

async fn create_session_handler(
    State(state): State<AppState>,
    payload: Result<Json<NewSession>, JsonRejection>,
) -> Result<Response, VoteError> {
    let Json(request) =
        payload.map_err(|rejection| VoteError::MalformedPayload(rejection.body_text()))?;
    let created = state.sessions.create(request).await?;
    info!(session = %created.session_id, "session created over http");
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

async fn get_session_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response, VoteError> {
    let session = SessionId::parse(&session_id)?;
    let detail = state.sessions.get(&session).await?;
    Ok(Json(detail).into_response())
}

/// Option ids arrive as either `"1"` or `1`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OptionIdInput {
    Text(String),
    Number(u64),
}

impl OptionIdInput {
    fn into_string(self) -> String {
        match self {
            OptionIdInput::Text(text) => text,
            OptionIdInput::Number(number) => number.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct VoteRequest {
    option_id: OptionIdInput,
}

#[derive(Debug, Serialize)]
struct VoteResponse {
    success: bool,
    option_id: String,
    new_count: u64,
}

async fn vote_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    payload: Result<Json<VoteRequest>, JsonRejection>,
) -> Result<Response, VoteError> {
    let Json(request) =
        payload.map_err(|_| VoteError::MalformedPayload("Option ID is required".into()))?;
    let option_id = request.option_id.into_string();

    let session = SessionId::parse(&session_id)?;
    let option = OptionId::parse(&option_id)?;
    let new_count = state.counter.cast_vote(&session, option).await?;

    Ok(Json(VoteResponse {
        success: true,
        option_id,
        new_count,
    })
    .into_response())
}

async fn stream_results_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, VoteError> {
    let session = SessionId::parse(&session_id)?;
    state.sessions.ensure_exists(&session).await?;

    let frames = state
        .relay
        .subscribe(session)
        .map(|message| Event::default().json_data(message));

    Ok(Sse::new(frames).keep_alive(KeepAlive::new().interval(state.keep_alive)))
}
