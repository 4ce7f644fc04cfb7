use crate::consts::UNAVAILABLE_MESSAGE;
use crate::db_types::{NewRecording, Speaker};
use crate::error::ApiError;
use crate::ingest::{self, Fragment};
use crate::query;
use crate::twilio_types::{
    inbound_call_twiml, IncomingCallPayload, RecordingPayload, TranscriptionEvent,
    TranscriptionPayload, TranscriptionTrack,
};
use crate::types::AppState;

use axum::{
    body::StreamBody,
    extract::{Host, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, trace, warn};

pub fn router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/voice/incoming", post(incoming_call))
        .route("/voice/transcription", post(transcription))
        .route("/voice/recording-callback", post(recording_callback))
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations/:call_sid", get(get_conversation))
        .route("/api/live", get(live_calls))
        .route("/api/stats", get(stats))
        .route("/api/search", get(search))
        .route("/api/update-team-notes", post(update_team_notes))
        .route("/api/update-status", post(update_status))
        .route("/api/audio/:id", get(audio))
        .route("/api/audio/:id/info", get(audio_info))
        .route("/health", get(|| async { Json(json!({"status": "ok"})) }))
        .with_state(app_state)
}

fn ok() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// Answer an inbound call.  The call is recorded as started and Twilio is told to start
/// transcription and dial through.  Always 200, or Twilio plays its own error message.
pub async fn incoming_call(
    host: Option<Host>,
    State(app_state): State<Arc<AppState>>,
    body: String,
) -> impl IntoResponse {
    trace!(body=%body, "incoming call body");
    match serde_urlencoded::from_str::<IncomingCallPayload>(&body) {
        Ok(payload) => {
            debug!(call_sid=%payload.call_sid, to=?payload.to, "incoming call");
            ingest::call_started(&app_state, &payload.call_sid, payload.from.as_deref()).await;
        }
        Err(e) => error!(error=%e, "failed to deserialize Twilio incoming call payload"),
    }

    let host = app_state
        .config
        .public_host
        .clone()
        .or(host.map(|Host(h)| h))
        .unwrap_or_else(|| "localhost".to_string());
    let twiml = inbound_call_twiml(
        &format!("https://{host}"),
        &app_state.config.forward_number,
        UNAVAILABLE_MESSAGE,
    );
    trace!("twiml: '{}'", twiml);

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/xml"),
    );
    (StatusCode::OK, headers, twiml)
}

pub async fn transcription(
    State(app_state): State<Arc<AppState>>,
    body: String,
) -> impl IntoResponse {
    let payload = match serde_urlencoded::from_str::<TranscriptionPayload>(&body) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error=%e, "failed to deserialize Twilio transcription payload");
            return ok();
        }
    };

    match payload.transcription_event {
        TranscriptionEvent::TranscriptionContent => {
            let speaker = match payload.track {
                Some(TranscriptionTrack::InboundTrack) => Speaker::Customer,
                Some(TranscriptionTrack::OutboundTrack) => Speaker::Agent,
                ref track => {
                    warn!(call_sid=%payload.call_sid, track=?track, "fragment on unknown track dropped");
                    return ok();
                }
            };
            let fragment = Fragment {
                text: payload.transcript(),
                is_final: payload.is_final(),
                call_sid: payload.call_sid,
                speaker,
            };
            ingest::transcription_fragment(&app_state, fragment).await;
        }
        TranscriptionEvent::TranscriptionStopped => {
            ingest::transcription_stopped(&app_state, &payload.call_sid).await;
        }
        ref event => debug!(call_sid=%payload.call_sid, event=?event, "ignoring transcription event"),
    }
    ok()
}

pub async fn recording_callback(
    State(app_state): State<Arc<AppState>>,
    body: String,
) -> impl IntoResponse {
    match serde_urlencoded::from_str::<RecordingPayload>(&body) {
        Ok(payload) => {
            let recording = NewRecording {
                recording_url: payload.playable_url(),
                duration_seconds: payload.duration_seconds(),
                recording_sid: payload.recording_sid,
            };
            ingest::recording_completed(&app_state, &payload.call_sid, recording).await;
        }
        Err(e) => error!(error=%e, "failed to deserialize Twilio recording payload"),
    }
    ok()
}

#[derive(Deserialize)]
pub struct ListParams {
    window_minutes: Option<i64>,
    limit: Option<i64>,
}

pub async fn list_conversations(
    State(app_state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let calls = query::list_recent(
        &app_state,
        params.window_minutes,
        params.limit,
        OffsetDateTime::now_utc(),
    )
    .await?;
    Ok(Json(json!({ "calls": calls })))
}

pub async fn get_conversation(
    State(app_state): State<Arc<AppState>>,
    Path(call_sid): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(query::get_call(&app_state, &call_sid).await?))
}

pub async fn live_calls(
    State(app_state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(json!({ "calls": query::live_calls(&app_state).await? })))
}

/// Dashboard counters; zeroed rather than an error when storage is unavailable.
pub async fn stats(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = query::stats(&app_state, OffsetDateTime::now_utc())
        .await
        .unwrap_or_default();
    Json(stats)
}

#[derive(Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    q: String,
    limit: Option<i64>,
}

pub async fn search(
    State(app_state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    let calls = query::search(&app_state, &params.q, params.limit).await?;
    Ok(Json(json!({ "calls": calls })))
}

#[derive(Deserialize)]
pub struct TeamNotesUpdate {
    call_id: i64,
    #[serde(default)]
    team_notes: String,
}

pub async fn update_team_notes(
    State(app_state): State<Arc<AppState>>,
    Json(update): Json<TeamNotesUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let call = query::update_team_notes(&app_state, update.call_id, &update.team_notes).await?;
    Ok(Json(json!({ "success": true, "team_notes": call.team_notes })))
}

#[derive(Deserialize)]
pub struct StatusUpdate {
    call_id: i64,
    status: String,
}

pub async fn update_status(
    State(app_state): State<Arc<AppState>>,
    Json(update): Json<StatusUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let call = query::update_status(&app_state, update.call_id, &update.status).await?;
    Ok(Json(json!({ "success": true, "status": call.call_status })))
}

/// Stream the call's recording from the local cache, downloading it from Twilio first if
/// it is not cached yet.
pub async fn audio(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let call = query::recorded_call(&app_state, id).await?;
    let path = app_state.recordings.fetch(&app_state, &call).await?;
    let file = tokio::fs::File::open(&path).await.map_err(|e| {
        error!(error=%e, path=?path, "failed to open cached recording");
        ApiError::Internal("recording unavailable".to_string())
    })?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("audio/mpeg"),
    );
    Ok((headers, StreamBody::new(ReaderStream::new(file))))
}

pub async fn audio_info(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(query::recording_info(&app_state, id).await?))
}
