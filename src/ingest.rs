use crate::consts::CONTEXT_TURNS;
use crate::db_types::{NewRecording, Speaker, TranscriptEntry};
use crate::extraction::{ExtractionError, ExtractionRequest};
use crate::types::AppState;
use crate::utils::generate_display_id;

use time::OffsetDateTime;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

/// A transcription fragment after carrier-specific decoding.
#[derive(Debug)]
pub struct Fragment {
    pub call_sid: String,
    pub speaker: Speaker,
    pub text: String,
    pub is_final: bool,
}

/// Create the call record unless it exists.  Like every event here, failures are logged
/// and the event is abandoned.
pub async fn call_started(state: &AppState, call_sid: &str, from_number: Option<&str>) {
    let display_id = generate_display_id(OffsetDateTime::now_utc());
    match state
        .store
        .create_call(call_sid, from_number, &display_id)
        .await
    {
        Ok(true) => info!(call_sid, display_id=%display_id, from=?from_number, "new call created"),
        Ok(false) => debug!(call_sid, "duplicate call-started event ignored"),
        Err(e) => error!(error=%e, call_sid, "failed to create call record"),
    }
}

pub async fn transcription_fragment(state: &AppState, fragment: Fragment) {
    if !fragment.is_final {
        trace!(call_sid=%fragment.call_sid, "discarding interim fragment");
        return;
    }
    let text = fragment.text.trim();
    if text.is_empty() {
        return;
    }

    let entry = match state
        .store
        .append_transcript(&fragment.call_sid, fragment.speaker, text)
        .await
    {
        Ok(Some(entry)) => entry,
        Ok(None) => {
            warn!(call_sid=%fragment.call_sid, "fragment for unknown call dropped");
            return;
        }
        Err(e) => {
            error!(error=%e, call_sid=%fragment.call_sid, "failed to append transcript");
            return;
        }
    };
    debug!(call_sid=%entry.call_sid, speaker=entry.speaker.as_str(), text=%entry.text, "transcript");

    if entry.speaker == Speaker::Customer {
        merge_extraction(state, &entry).await;
    }
}

/// Ask the extractor about `entry` and fill whatever call fields are still unset.
async fn merge_extraction(state: &AppState, entry: &TranscriptEntry) {
    let Some(extractor) = &state.extractor else {
        return;
    };
    let call_sid = entry.call_sid.as_str();
    let history = match state
        .store
        .recent_transcript(call_sid, entry.id, CONTEXT_TURNS)
        .await
    {
        Ok(history) => history,
        Err(e) => {
            error!(error=%e, call_sid, "failed to load transcript context; merge skipped");
            return;
        }
    };
    let request = ExtractionRequest::new(&entry.text, &history);

    let fields = match timeout(state.config.extraction_timeout, extractor.extract(&request)).await
    {
        Ok(Ok(fields)) => fields,
        Ok(Err(e)) => {
            warn!(error=%e, call_sid, "extraction failed; merge skipped");
            return;
        }
        Err(_) => {
            warn!(error=%ExtractionError::Timeout, call_sid, "extraction failed; merge skipped");
            return;
        }
    };

    let updates = fields.into_updates();
    if updates.is_empty() {
        return;
    }
    match state.store.apply_field_updates(call_sid, &updates).await {
        Ok(applied) if applied.is_empty() => debug!(call_sid, "extracted fields already set"),
        Ok(applied) => info!(call_sid, fields=?applied, "extracted fields merged"),
        Err(e) => error!(error=%e, call_sid, "failed to merge extracted fields"),
    }
}

pub async fn transcription_stopped(state: &AppState, call_sid: &str) {
    match state.store.mark_ended(call_sid).await {
        Ok(true) => info!(call_sid, "call ended"),
        Ok(false) => warn!(call_sid, "transcription stopped for unknown call"),
        Err(e) => error!(error=%e, call_sid, "failed to mark call ended"),
    }
}

pub async fn recording_completed(state: &AppState, call_sid: &str, recording: NewRecording) {
    match state.store.set_recording(call_sid, &recording).await {
        Ok(true) => info!(
            call_sid,
            recording_sid=%recording.recording_sid,
            duration=recording.duration_seconds,
            "recording saved"
        ),
        Ok(false) => warn!(
            call_sid,
            recording_sid=%recording.recording_sid,
            "recording for unknown call dropped"
        ),
        Err(e) => error!(error=%e, call_sid, "failed to save recording"),
    }
}
