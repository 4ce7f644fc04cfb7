use crate::consts::{
    DEFAULT_LIST_LIMIT, DEFAULT_LIST_WINDOW_MINUTES, MAX_LIST_LIMIT, MAX_LIST_WINDOW_MINUTES,
};
use crate::db_types::{CallRecord, CallStats, CallStatus, CallWithTranscript, RecordingStatus};
use crate::error::ApiError;
use crate::store::with_retry;
use crate::types::AppState;

use serde::Serialize;
use time::{Duration, OffsetDateTime, Time};

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

/// Calls started within the last `window_minutes`, newest first.
pub async fn list_recent(
    state: &AppState,
    window_minutes: Option<i64>,
    limit: Option<i64>,
    now: OffsetDateTime,
) -> Result<Vec<CallRecord>, ApiError> {
    let window = window_minutes.unwrap_or(DEFAULT_LIST_WINDOW_MINUTES);
    if window <= 0 {
        return Err(ApiError::BadRequest(
            "window_minutes must be positive".to_string(),
        ));
    }
    let since = now
        .checked_sub(Duration::minutes(window.min(MAX_LIST_WINDOW_MINUTES)))
        .ok_or_else(|| ApiError::BadRequest("window_minutes out of range".to_string()))?;
    let limit = clamp_limit(limit);
    Ok(with_retry(|| state.store.list_calls(since, limit)).await?)
}

pub async fn get_call(state: &AppState, call_sid: &str) -> Result<CallWithTranscript, ApiError> {
    let call_info = with_retry(|| state.store.get_call(call_sid))
        .await?
        .ok_or_else(|| ApiError::NotFound("Call not found".to_string()))?;
    let transcripts = with_retry(|| state.store.transcript(call_sid)).await?;
    Ok(CallWithTranscript {
        call_info,
        transcripts,
    })
}

/// Dashboard counters.  "Today" is the current UTC calendar day.
pub async fn stats(state: &AppState, now: OffsetDateTime) -> Result<CallStats, ApiError> {
    let day_start = now.replace_time(Time::MIDNIGHT);
    Ok(with_retry(|| state.store.stats(day_start)).await?)
}

pub async fn search(
    state: &AppState,
    keyword: &str,
    limit: Option<i64>,
) -> Result<Vec<CallRecord>, ApiError> {
    let keyword = keyword.trim();
    if keyword.is_empty() {
        return Err(ApiError::BadRequest("Search keyword required".to_string()));
    }
    let limit = clamp_limit(limit);
    Ok(with_retry(|| state.store.search(keyword, limit)).await?)
}

/// Active calls with their transcripts, rebuilt from the store on every read.
pub async fn live_calls(state: &AppState) -> Result<Vec<CallWithTranscript>, ApiError> {
    let calls = with_retry(|| state.store.list_active()).await?;
    let mut live = Vec::with_capacity(calls.len());
    for call_info in calls {
        let transcripts = with_retry(|| state.store.transcript(&call_info.call_sid)).await?;
        live.push(CallWithTranscript {
            call_info,
            transcripts,
        });
    }
    Ok(live)
}

pub async fn update_team_notes(
    state: &AppState,
    id: i64,
    notes: &str,
) -> Result<CallRecord, ApiError> {
    state
        .store
        .update_team_notes(id, notes.trim())
        .await?
        .ok_or_else(|| ApiError::NotFound("Call not found".to_string()))
}

/// The status is validated before the call is looked up, so a bad value never touches
/// the store.
pub async fn update_status(state: &AppState, id: i64, status: &str) -> Result<CallRecord, ApiError> {
    let status: CallStatus = status
        .parse()
        .map_err(|_| ApiError::BadRequest("Invalid status".to_string()))?;
    state
        .store
        .update_status(id, status)
        .await?
        .ok_or_else(|| ApiError::NotFound("Call not found".to_string()))
}

#[derive(Serialize, Debug)]
pub struct RecordingInfo {
    pub success: bool,
    /// Where this service streams the recording from.
    pub audio_url: String,
    pub duration: i32,
    pub status: RecordingStatus,
}

pub async fn recording_info(state: &AppState, id: i64) -> Result<RecordingInfo, ApiError> {
    let call = recorded_call(state, id).await?;
    Ok(RecordingInfo {
        success: true,
        audio_url: format!("/api/audio/{}", call.id),
        duration: call.recording_duration,
        status: call.recording_status,
    })
}

/// The call with internal id `id`, provided it has a recording attached.
pub async fn recorded_call(state: &AppState, id: i64) -> Result<CallRecord, ApiError> {
    with_retry(|| state.store.get_call_by_id(id))
        .await?
        .filter(|call| call.recording_url.is_some())
        .ok_or_else(|| ApiError::NotFound("No recording".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_types::{FieldUpdate, FlagField, NewRecording, Speaker, TextField};
    use crate::store::CallStore;
    use crate::test_support::memory_state;
    use time::macros::datetime;

    #[tokio::test]
    async fn recent_list_respects_window_and_order() {
        let (state, store) = memory_state(None);
        let now = datetime!(2026-05-01 12:00 UTC);
        for (sid, started) in [
            ("CA_OLD", datetime!(2026-05-01 09:00 UTC)),
            ("CA_A", datetime!(2026-05-01 10:30 UTC)),
            ("CA_B", datetime!(2026-05-01 11:45 UTC)),
        ] {
            store.create_call(sid, None, "WK1").await.unwrap();
            store.set_start_time(sid, started).await;
        }
        let calls = list_recent(&state, None, None, now).await.unwrap();
        let sids: Vec<&str> = calls.iter().map(|c| c.call_sid.as_str()).collect();
        assert_eq!(sids, ["CA_B", "CA_A"]);

        let calls = list_recent(&state, Some(24 * 60), Some(1), now).await.unwrap();
        assert_eq!(calls.len(), 1);
        assert!(matches!(
            list_recent(&state, Some(0), None, now).await,
            Err(ApiError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn huge_window_is_clamped_to_a_year() {
        let (state, store) = memory_state(None);
        let now = datetime!(2026-05-01 12:00 UTC);
        store.create_call("CA_MONTH", None, "WK1").await.unwrap();
        store
            .set_start_time("CA_MONTH", datetime!(2026-04-01 12:00 UTC))
            .await;
        store.create_call("CA_ANCIENT", None, "WK2").await.unwrap();
        store
            .set_start_time("CA_ANCIENT", datetime!(2020-01-01 00:00 UTC))
            .await;

        for window in [1_000_000_000_000, i64::MAX] {
            let calls = list_recent(&state, Some(window), None, now).await.unwrap();
            let sids: Vec<&str> = calls.iter().map(|c| c.call_sid.as_str()).collect();
            assert_eq!(sids, ["CA_MONTH"]);
        }
    }

    #[test]
    fn limits_are_clamped() {
        assert_eq!(clamp_limit(None), DEFAULT_LIST_LIMIT);
        assert_eq!(clamp_limit(Some(10_000)), MAX_LIST_LIMIT);
        assert_eq!(clamp_limit(Some(-3)), 1);
    }

    #[tokio::test]
    async fn unknown_call_is_not_found() {
        let (state, _store) = memory_state(None);
        assert!(matches!(
            get_call(&state, "CA404").await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn search_matches_case_insensitively_and_rejects_blank() {
        let (state, store) = memory_state(None);
        store.create_call("CA1", Some("+447700900123"), "WK1").await.unwrap();
        store
            .apply_field_updates(
                "CA1",
                &[FieldUpdate::Text(TextField::CustomerName, "Jane Smith".to_string())],
            )
            .await
            .unwrap();
        store.create_call("CA2", Some("+447700900999"), "WK2").await.unwrap();

        let hits = search(&state, "  SMITH ", None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].call_sid, "CA1");
        let hits = search(&state, "0900", None).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(matches!(
            search(&state, "   ", None).await,
            Err(ApiError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn stats_count_today_in_utc() {
        let (state, store) = memory_state(None);
        let now = datetime!(2026-05-01 08:00 UTC);
        store.create_call("CA1", None, "WK1").await.unwrap();
        store.set_start_time("CA1", datetime!(2026-05-01 00:00 UTC)).await;
        store.create_call("CA2", None, "WK2").await.unwrap();
        store.set_start_time("CA2", datetime!(2026-04-30 23:59 UTC)).await;
        store
            .apply_field_updates("CA2", &[FieldUpdate::Flag(FlagField::Complaint)])
            .await
            .unwrap();
        store.mark_ended("CA2").await.unwrap();

        let stats = stats(&state, now).await.unwrap();
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.today_calls, 1);
        assert_eq!(stats.active_calls, 1);
        assert_eq!(stats.complaints, 1);
        assert_eq!(stats.callbacks, 0);
    }

    #[tokio::test]
    async fn live_view_only_holds_active_calls() {
        let (state, store) = memory_state(None);
        store.create_call("CA1", None, "WK1").await.unwrap();
        store.create_call("CA2", None, "WK2").await.unwrap();
        store
            .append_transcript("CA1", Speaker::Customer, "hello")
            .await
            .unwrap();
        store.mark_ended("CA2").await.unwrap();

        let live = live_calls(&state).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].call_info.call_sid, "CA1");
        assert_eq!(live[0].transcripts.len(), 1);
    }

    #[tokio::test]
    async fn team_notes_are_trimmed_and_overwritten() {
        let (state, store) = memory_state(None);
        store.create_call("CA1", None, "WK1").await.unwrap();
        let id = store.get_call("CA1").await.unwrap().unwrap().id;

        update_team_notes(&state, id, "first").await.unwrap();
        let call = update_team_notes(&state, id, "  called back \n").await.unwrap();
        assert_eq!(call.team_notes.as_deref(), Some("called back"));
        assert!(matches!(
            update_team_notes(&state, id + 100, "x").await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn invalid_status_is_rejected_before_lookup() {
        let (state, store) = memory_state(None);
        store.create_call("CA1", None, "WK1").await.unwrap();
        let id = store.get_call("CA1").await.unwrap().unwrap().id;

        assert!(matches!(
            update_status(&state, id, "escalated").await,
            Err(ApiError::BadRequest(_))
        ));
        assert!(matches!(
            update_status(&state, id + 100, "escalated").await,
            Err(ApiError::BadRequest(_))
        ));
        let call = store.get_call("CA1").await.unwrap().unwrap();
        assert_eq!(call.call_status, CallStatus::Completed);

        let call = update_status(&state, id, "ticket_raised").await.unwrap();
        assert_eq!(call.call_status, CallStatus::TicketRaised);
        assert!(matches!(
            update_status(&state, id + 100, "callback").await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn recording_info_requires_a_recording() {
        let (state, store) = memory_state(None);
        store.create_call("CA1", None, "WK1").await.unwrap();
        let id = store.get_call("CA1").await.unwrap().unwrap().id;
        assert!(matches!(
            recording_info(&state, id).await,
            Err(ApiError::NotFound(_))
        ));

        let recording = NewRecording {
            recording_sid: "RE1".to_string(),
            recording_url: "https://api.twilio.com/rec/RE1.mp3".to_string(),
            duration_seconds: 61,
        };
        store.set_recording("CA1", &recording).await.unwrap();
        let info = recording_info(&state, id).await.unwrap();
        assert_eq!(info.audio_url, format!("/api/audio/{id}"));
        assert_eq!(info.duration, 61);
        assert_eq!(info.status, RecordingStatus::Available);
    }
}
