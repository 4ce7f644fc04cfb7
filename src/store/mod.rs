pub mod memory;
pub mod postgres;

use crate::consts::{STORE_RETRY_ATTEMPTS, STORE_RETRY_BACKOFF_MILLIS};
use crate::db_types::{
    CallRecord, CallStats, CallStatus, FieldUpdate, NewRecording, Speaker, TranscriptEntry,
};

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.  Decided from the driver's error
    /// kind and SQLSTATE, never from message text.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(e) => match e {
                sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db) => db
                    .code()
                    .map_or(false, |code| is_transient_sqlstate(&code)),
                _ => false,
            },
            StoreError::Migrate(_) => false,
        }
    }
}

/// Connection exceptions (class 08), serialization failure, deadlock and admin shutdown.
fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08") || matches!(code, "40001" | "40P01" | "57P01" | "57P02" | "57P03")
}

/// Run a read, retrying transient faults with a linear backoff.
pub async fn with_retry<T, F, Fut>(mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt: u32 = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < STORE_RETRY_ATTEMPTS => {
                warn!(error=%e, attempt, "transient storage fault; retrying");
                sleep(Duration::from_millis(STORE_RETRY_BACKOFF_MILLIS) * attempt).await;
                attempt += 1;
            }
            res => break res,
        }
    }
}

/// Durable call records and transcripts.  Each mutation is a single conditional write;
/// callers never read-modify-write.
#[async_trait]
pub trait CallStore: Send + Sync {
    /// Insert a call unless one with `call_sid` exists.  Returns true when a row was created.
    async fn create_call(
        &self,
        call_sid: &str,
        from_number: Option<&str>,
        display_id: &str,
    ) -> Result<bool, StoreError>;

    async fn get_call(&self, call_sid: &str) -> Result<Option<CallRecord>, StoreError>;

    async fn get_call_by_id(&self, id: i64) -> Result<Option<CallRecord>, StoreError>;

    /// Append to the call's transcript.  `None` when the call does not exist.
    async fn append_transcript(
        &self,
        call_sid: &str,
        speaker: Speaker,
        text: &str,
    ) -> Result<Option<TranscriptEntry>, StoreError>;

    /// Up to `limit` entries preceding entry `before_id`, oldest first.
    async fn recent_transcript(
        &self,
        call_sid: &str,
        before_id: i64,
        limit: i64,
    ) -> Result<Vec<TranscriptEntry>, StoreError>;

    /// Full transcript in conversation order.
    async fn transcript(&self, call_sid: &str) -> Result<Vec<TranscriptEntry>, StoreError>;

    /// Write each update only where the target field is still unset.  Returns the
    /// columns actually written.
    async fn apply_field_updates(
        &self,
        call_sid: &str,
        updates: &[FieldUpdate],
    ) -> Result<Vec<&'static str>, StoreError>;

    async fn mark_ended(&self, call_sid: &str) -> Result<bool, StoreError>;

    /// Attach recording metadata.  A recording already `downloaded` keeps that status.
    async fn set_recording(
        &self,
        call_sid: &str,
        recording: &NewRecording,
    ) -> Result<bool, StoreError>;

    /// `Some(path)` marks the recording downloaded; `None` reverts it to available.
    async fn set_recording_cached(
        &self,
        call_sid: &str,
        path: Option<&str>,
    ) -> Result<bool, StoreError>;

    async fn update_team_notes(
        &self,
        id: i64,
        notes: &str,
    ) -> Result<Option<CallRecord>, StoreError>;

    async fn update_status(
        &self,
        id: i64,
        status: CallStatus,
    ) -> Result<Option<CallRecord>, StoreError>;

    /// Calls started at or after `since`, newest first.
    async fn list_calls(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<CallRecord>, StoreError>;

    async fn list_active(&self) -> Result<Vec<CallRecord>, StoreError>;

    /// Case-insensitive substring match on name, phone, postcode and display id.
    async fn search(&self, keyword: &str, limit: i64) -> Result<Vec<CallRecord>, StoreError>;

    async fn stats(&self, day_start: OffsetDateTime) -> Result<CallStats, StoreError>;

    /// Calls started strictly before `cutoff`.
    async fn expired_calls(&self, cutoff: OffsetDateTime) -> Result<Vec<String>, StoreError>;

    /// Delete a call and, by cascade, its transcript.
    async fn delete_call(&self, call_sid: &str) -> Result<bool, StoreError>;
}
