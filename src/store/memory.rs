use super::{CallStore, StoreError};
use crate::db_types::{
    CallRecord, CallState, CallStats, CallStatus, FieldUpdate, NewRecording, RecordingStatus,
    Speaker, TranscriptEntry,
};

use async_trait::async_trait;
use std::collections::HashMap;
use time::OffsetDateTime;
use tokio::sync::Mutex;

#[derive(Default)]
struct Tables {
    next_call_id: i64,
    next_entry_id: i64,
    calls: HashMap<String, CallRecord>,
    /// Kept in insertion order, which is also timestamp order.
    transcripts: Vec<TranscriptEntry>,
}

/// In-process store, used when no database is configured.  All mutations happen under
/// one lock.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn set_start_time(&self, call_sid: &str, start_time: OffsetDateTime) {
        let mut tables = self.tables.lock().await;
        if let Some(call) = tables.calls.get_mut(call_sid) {
            call.start_time = start_time;
        }
    }

    #[cfg(test)]
    pub async fn call_count(&self) -> usize {
        self.tables.lock().await.calls.len()
    }

    #[cfg(test)]
    pub async fn transcript_count(&self) -> usize {
        self.tables.lock().await.transcripts.len()
    }
}

fn newest_first(mut calls: Vec<CallRecord>) -> Vec<CallRecord> {
    calls.sort_by(|a, b| b.start_time.cmp(&a.start_time).then(b.id.cmp(&a.id)));
    calls
}

fn contains_ci(haystack: Option<&str>, needle: &str) -> bool {
    haystack.map_or(false, |h| h.to_lowercase().contains(needle))
}

#[async_trait]
impl CallStore for MemoryStore {
    async fn create_call(
        &self,
        call_sid: &str,
        from_number: Option<&str>,
        display_id: &str,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.calls.contains_key(call_sid) {
            return Ok(false);
        }
        tables.next_call_id += 1;
        let call = CallRecord::new(tables.next_call_id, call_sid, from_number, display_id);
        tables.calls.insert(call_sid.to_string(), call);
        Ok(true)
    }

    async fn get_call(&self, call_sid: &str) -> Result<Option<CallRecord>, StoreError> {
        Ok(self.tables.lock().await.calls.get(call_sid).cloned())
    }

    async fn get_call_by_id(&self, id: i64) -> Result<Option<CallRecord>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.calls.values().find(|c| c.id == id).cloned())
    }

    async fn append_transcript(
        &self,
        call_sid: &str,
        speaker: Speaker,
        text: &str,
    ) -> Result<Option<TranscriptEntry>, StoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.calls.contains_key(call_sid) {
            return Ok(None);
        }
        tables.next_entry_id += 1;
        let entry = TranscriptEntry {
            id: tables.next_entry_id,
            call_sid: call_sid.to_string(),
            speaker,
            text: text.to_string(),
            created_at: OffsetDateTime::now_utc(),
        };
        tables.transcripts.push(entry.clone());
        Ok(Some(entry))
    }

    async fn recent_transcript(
        &self,
        call_sid: &str,
        before_id: i64,
        limit: i64,
    ) -> Result<Vec<TranscriptEntry>, StoreError> {
        let tables = self.tables.lock().await;
        let mut recent: Vec<TranscriptEntry> = tables
            .transcripts
            .iter()
            .rev()
            .filter(|t| t.call_sid == call_sid && t.id < before_id)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect();
        recent.reverse();
        Ok(recent)
    }

    async fn transcript(&self, call_sid: &str) -> Result<Vec<TranscriptEntry>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .transcripts
            .iter()
            .filter(|t| t.call_sid == call_sid)
            .cloned()
            .collect())
    }

    async fn apply_field_updates(
        &self,
        call_sid: &str,
        updates: &[FieldUpdate],
    ) -> Result<Vec<&'static str>, StoreError> {
        let mut tables = self.tables.lock().await;
        let Some(call) = tables.calls.get_mut(call_sid) else {
            return Ok(vec![]);
        };
        Ok(updates
            .iter()
            .filter(|update| call.fill(update))
            .map(FieldUpdate::column)
            .collect())
    }

    async fn mark_ended(&self, call_sid: &str) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        Ok(match tables.calls.get_mut(call_sid) {
            Some(call) => {
                call.state = CallState::Ended;
                true
            }
            None => false,
        })
    }

    async fn set_recording(
        &self,
        call_sid: &str,
        recording: &NewRecording,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        Ok(match tables.calls.get_mut(call_sid) {
            Some(call) => {
                call.recording_sid = Some(recording.recording_sid.clone());
                call.recording_url = Some(recording.recording_url.clone());
                call.recording_duration = recording.duration_seconds;
                if call.recording_status != RecordingStatus::Downloaded {
                    call.recording_status = RecordingStatus::Available;
                }
                true
            }
            None => false,
        })
    }

    async fn set_recording_cached(
        &self,
        call_sid: &str,
        path: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        Ok(match tables.calls.get_mut(call_sid) {
            Some(call) => {
                call.recording_path = path.map(str::to_string);
                call.recording_status = if path.is_some() {
                    RecordingStatus::Downloaded
                } else {
                    RecordingStatus::Available
                };
                true
            }
            None => false,
        })
    }

    async fn update_team_notes(
        &self,
        id: i64,
        notes: &str,
    ) -> Result<Option<CallRecord>, StoreError> {
        let mut tables = self.tables.lock().await;
        Ok(tables.calls.values_mut().find(|c| c.id == id).map(|call| {
            call.team_notes = Some(notes.to_string());
            call.clone()
        }))
    }

    async fn update_status(
        &self,
        id: i64,
        status: CallStatus,
    ) -> Result<Option<CallRecord>, StoreError> {
        let mut tables = self.tables.lock().await;
        Ok(tables.calls.values_mut().find(|c| c.id == id).map(|call| {
            call.call_status = status;
            call.clone()
        }))
    }

    async fn list_calls(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<CallRecord>, StoreError> {
        let tables = self.tables.lock().await;
        let calls = tables
            .calls
            .values()
            .filter(|c| c.start_time >= since)
            .cloned()
            .collect();
        let mut calls = newest_first(calls);
        calls.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(calls)
    }

    async fn list_active(&self) -> Result<Vec<CallRecord>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(newest_first(
            tables
                .calls
                .values()
                .filter(|c| c.state == CallState::Active)
                .cloned()
                .collect(),
        ))
    }

    async fn search(&self, keyword: &str, limit: i64) -> Result<Vec<CallRecord>, StoreError> {
        let needle = keyword.to_lowercase();
        let tables = self.tables.lock().await;
        let calls = tables
            .calls
            .values()
            .filter(|c| {
                contains_ci(c.customer_name.as_deref(), &needle)
                    || contains_ci(c.from_number.as_deref(), &needle)
                    || contains_ci(c.postcode.as_deref(), &needle)
                    || contains_ci(Some(&c.display_id), &needle)
            })
            .cloned()
            .collect();
        let mut calls = newest_first(calls);
        calls.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(calls)
    }

    async fn stats(&self, day_start: OffsetDateTime) -> Result<CallStats, StoreError> {
        let tables = self.tables.lock().await;
        let mut stats = CallStats::default();
        for call in tables.calls.values() {
            stats.total_calls += 1;
            stats.today_calls += i64::from(call.start_time >= day_start);
            stats.active_calls += i64::from(call.state == CallState::Active);
            stats.callbacks += i64::from(call.callback_requested);
            stats.complaints += i64::from(call.complaint);
            stats.trade_customers += i64::from(call.trade_customer);
            stats.quotes += i64::from(call.quote_provided);
            stats.bookings += i64::from(call.booking_confirmed);
            stats.tickets_raised += i64::from(call.call_status == CallStatus::TicketRaised);
        }
        Ok(stats)
    }

    async fn expired_calls(&self, cutoff: OffsetDateTime) -> Result<Vec<String>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .calls
            .values()
            .filter(|c| c.start_time < cutoff)
            .map(|c| c.call_sid.clone())
            .collect())
    }

    async fn delete_call(&self, call_sid: &str) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.calls.remove(call_sid).is_none() {
            return Ok(false);
        }
        tables.transcripts.retain(|t| t.call_sid != call_sid);
        Ok(true)
    }
}
