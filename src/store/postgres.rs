use super::{CallStore, StoreError};
use crate::db_types::{
    CallRecord, CallState, CallStats, CallStatus, FieldUpdate, NewRecording, RecordingStatus,
    Speaker, TranscriptEntry, UnknownVariant,
};
use crate::utils::like_pattern;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{FromRow, Row};
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::info;

pub struct PgCallStore {
    pool: PgPool,
}

impl PgCallStore {
    /// Open a pool and bring the schema up to date.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .test_before_acquire(true)
            .connect(url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("database ready");
        Ok(Self { pool })
    }
}

fn decode_enum<T>(row: &PgRow, column: &str) -> Result<T, sqlx::Error>
where
    T: FromStr<Err = UnknownVariant>,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e: UnknownVariant| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

impl<'r> FromRow<'r, PgRow> for CallRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            call_sid: row.try_get("call_sid")?,
            display_id: row.try_get("display_id")?,
            from_number: row.try_get("from_number")?,
            start_time: row.try_get("start_time")?,
            state: decode_enum(row, "state")?,
            call_status: decode_enum(row, "call_status")?,
            customer_name: row.try_get("customer_name")?,
            postcode: row.try_get("postcode")?,
            customer_address: row.try_get("customer_address")?,
            customer_email: row.try_get("customer_email")?,
            service: row.try_get("service")?,
            skip_size: row.try_get("skip_size")?,
            waste_type: row.try_get("waste_type")?,
            grab_material: row.try_get("grab_material")?,
            when_needed: row.try_get("when_needed")?,
            trade_customer: row.try_get("trade_customer")?,
            callback_requested: row.try_get("callback_requested")?,
            complaint: row.try_get("complaint")?,
            quote_provided: row.try_get("quote_provided")?,
            booking_confirmed: row.try_get("booking_confirmed")?,
            payment_link_sent: row.try_get("payment_link_sent")?,
            recording_sid: row.try_get("recording_sid")?,
            recording_url: row.try_get("recording_url")?,
            recording_duration: row.try_get("recording_duration")?,
            recording_path: row.try_get("recording_path")?,
            recording_status: decode_enum(row, "recording_status")?,
            team_notes: row.try_get("team_notes")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for TranscriptEntry {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            call_sid: row.try_get("call_sid")?,
            speaker: decode_enum(row, "speaker")?,
            text: row.try_get("text")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

const TRANSCRIPT_COLUMNS: &str = "id, call_sid, speaker, text, created_at";

#[async_trait]
impl CallStore for PgCallStore {
    async fn create_call(
        &self,
        call_sid: &str,
        from_number: Option<&str>,
        display_id: &str,
    ) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "
            insert into calls (call_sid, display_id, from_number)
            values ($1, $2, $3)
            on conflict (call_sid) do nothing
            ",
        )
        .bind(call_sid)
        .bind(display_id)
        .bind(from_number)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn get_call(&self, call_sid: &str) -> Result<Option<CallRecord>, StoreError> {
        let call = sqlx::query_as::<_, CallRecord>("select * from calls where call_sid = $1")
            .bind(call_sid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(call)
    }

    async fn get_call_by_id(&self, id: i64) -> Result<Option<CallRecord>, StoreError> {
        let call = sqlx::query_as::<_, CallRecord>("select * from calls where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(call)
    }

    async fn append_transcript(
        &self,
        call_sid: &str,
        speaker: Speaker,
        text: &str,
    ) -> Result<Option<TranscriptEntry>, StoreError> {
        let sql = format!(
            "
            insert into transcripts (call_sid, speaker, text)
            select call_sid, $2, $3
            from calls
            where call_sid = $1
            returning {TRANSCRIPT_COLUMNS}
            "
        );
        let entry = sqlx::query_as::<_, TranscriptEntry>(&sql)
            .bind(call_sid)
            .bind(speaker.as_str())
            .bind(text)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry)
    }

    async fn recent_transcript(
        &self,
        call_sid: &str,
        before_id: i64,
        limit: i64,
    ) -> Result<Vec<TranscriptEntry>, StoreError> {
        let sql = format!(
            "
            select {TRANSCRIPT_COLUMNS}
            from transcripts
            where call_sid = $1 and id < $2
            order by created_at desc, id desc
            limit $3
            "
        );
        let mut entries = sqlx::query_as::<_, TranscriptEntry>(&sql)
            .bind(call_sid)
            .bind(before_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        entries.reverse();
        Ok(entries)
    }

    async fn transcript(&self, call_sid: &str) -> Result<Vec<TranscriptEntry>, StoreError> {
        let sql = format!(
            "
            select {TRANSCRIPT_COLUMNS}
            from transcripts
            where call_sid = $1
            order by created_at, id
            "
        );
        let entries = sqlx::query_as::<_, TranscriptEntry>(&sql)
            .bind(call_sid)
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }

    async fn apply_field_updates(
        &self,
        call_sid: &str,
        updates: &[FieldUpdate],
    ) -> Result<Vec<&'static str>, StoreError> {
        let mut applied = vec![];
        let mut tx = self.pool.begin().await?;
        for update in updates {
            // Column names come from the closed field enums, never from input.
            let column = update.column();
            let res = match update {
                FieldUpdate::Text(_, value) => {
                    let sql = format!(
                        "update calls set {column} = $2 \
                         where call_sid = $1 and ({column} is null or {column} = '')"
                    );
                    sqlx::query(&sql)
                        .bind(call_sid)
                        .bind(value)
                        .execute(&mut *tx)
                        .await?
                }
                FieldUpdate::Flag(_) => {
                    let sql = format!(
                        "update calls set {column} = true where call_sid = $1 and not {column}"
                    );
                    sqlx::query(&sql).bind(call_sid).execute(&mut *tx).await?
                }
            };
            if res.rows_affected() > 0 {
                applied.push(column);
            }
        }
        tx.commit().await?;
        Ok(applied)
    }

    async fn mark_ended(&self, call_sid: &str) -> Result<bool, StoreError> {
        let res = sqlx::query("update calls set state = $2 where call_sid = $1")
            .bind(call_sid)
            .bind(CallState::Ended.as_str())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn set_recording(
        &self,
        call_sid: &str,
        recording: &NewRecording,
    ) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "
            update calls
            set recording_sid = $2,
                recording_url = $3,
                recording_duration = $4,
                recording_status = case
                  when recording_status = $6 then recording_status
                  else $5
                end
            where call_sid = $1
            ",
        )
        .bind(call_sid)
        .bind(&recording.recording_sid)
        .bind(&recording.recording_url)
        .bind(recording.duration_seconds)
        .bind(RecordingStatus::Available.as_str())
        .bind(RecordingStatus::Downloaded.as_str())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn set_recording_cached(
        &self,
        call_sid: &str,
        path: Option<&str>,
    ) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "
            update calls
            set recording_path = $2,
                recording_status = $3
            where call_sid = $1
            ",
        )
        .bind(call_sid)
        .bind(path)
        .bind(match path {
            Some(_) => RecordingStatus::Downloaded.as_str(),
            None => RecordingStatus::Available.as_str(),
        })
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn update_team_notes(
        &self,
        id: i64,
        notes: &str,
    ) -> Result<Option<CallRecord>, StoreError> {
        let call = sqlx::query_as::<_, CallRecord>(
            "update calls set team_notes = $2 where id = $1 returning *",
        )
        .bind(id)
        .bind(notes)
        .fetch_optional(&self.pool)
        .await?;
        Ok(call)
    }

    async fn update_status(
        &self,
        id: i64,
        status: CallStatus,
    ) -> Result<Option<CallRecord>, StoreError> {
        let call = sqlx::query_as::<_, CallRecord>(
            "update calls set call_status = $2 where id = $1 returning *",
        )
        .bind(id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(call)
    }

    async fn list_calls(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<CallRecord>, StoreError> {
        let calls = sqlx::query_as::<_, CallRecord>(
            "
            select * from calls
            where start_time >= $1
            order by start_time desc, id desc
            limit $2
            ",
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(calls)
    }

    async fn list_active(&self) -> Result<Vec<CallRecord>, StoreError> {
        let calls = sqlx::query_as::<_, CallRecord>(
            "select * from calls where state = $1 order by start_time desc, id desc",
        )
        .bind(CallState::Active.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(calls)
    }

    async fn search(&self, keyword: &str, limit: i64) -> Result<Vec<CallRecord>, StoreError> {
        let calls = sqlx::query_as::<_, CallRecord>(
            "
            select * from calls
            where customer_name ilike $1
               or from_number ilike $1
               or postcode ilike $1
               or display_id ilike $1
            order by start_time desc, id desc
            limit $2
            ",
        )
        .bind(like_pattern(keyword))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(calls)
    }

    async fn stats(&self, day_start: OffsetDateTime) -> Result<CallStats, StoreError> {
        let stats = sqlx::query_as::<_, CallStats>(
            "
            select
              count(*) as total_calls,
              count(*) filter (where start_time >= $1) as today_calls,
              count(*) filter (where state = 'active') as active_calls,
              count(*) filter (where callback_requested) as callbacks,
              count(*) filter (where complaint) as complaints,
              count(*) filter (where trade_customer) as trade_customers,
              count(*) filter (where quote_provided) as quotes,
              count(*) filter (where booking_confirmed) as bookings,
              count(*) filter (where call_status = 'ticket_raised') as tickets_raised
            from calls
            ",
        )
        .bind(day_start)
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }

    async fn expired_calls(&self, cutoff: OffsetDateTime) -> Result<Vec<String>, StoreError> {
        let sids = sqlx::query_scalar::<_, String>(
            "select call_sid from calls where start_time < $1 order by start_time",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(sids)
    }

    async fn delete_call(&self, call_sid: &str) -> Result<bool, StoreError> {
        let res = sqlx::query("delete from calls where call_sid = $1")
            .bind(call_sid)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }
}

/// These run against a live database:
///
/// ```bash
/// DATABASE_URL=postgres://localhost/call_intake_test cargo test -- --ignored
/// ```
#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_types::{FlagField, TextField};
    use time::macros::datetime;

    async fn test_store() -> PgCallStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        PgCallStore::connect(&url, 2).await.unwrap()
    }

    fn unique_sid() -> String {
        format!("CATEST{}", rand::random::<u64>())
    }

    async fn set_start_time(store: &PgCallStore, call_sid: &str, start_time: OffsetDateTime) {
        sqlx::query("update calls set start_time = $2 where call_sid = $1")
            .bind(call_sid)
            .bind(start_time)
            .execute(&store.pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn create_call_is_idempotent() {
        let store = test_store().await;
        let sid = unique_sid();
        assert!(store.create_call(&sid, Some("+441130000000"), "WK100").await.unwrap());
        assert!(!store.create_call(&sid, Some("+449999999999"), "WK200").await.unwrap());

        let call = store.get_call(&sid).await.unwrap().unwrap();
        assert_eq!(call.display_id, "WK100");
        assert_eq!(call.from_number.as_deref(), Some("+441130000000"));
        assert_eq!(call.state, CallState::Active);
        store.delete_call(&sid).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn first_confirmed_value_wins() {
        let store = test_store().await;
        let sid = unique_sid();
        store.create_call(&sid, None, "WK1").await.unwrap();
        sqlx::query("update calls set postcode = '' where call_sid = $1")
            .bind(&sid)
            .execute(&store.pool)
            .await
            .unwrap();

        let applied = store
            .apply_field_updates(
                &sid,
                &[
                    FieldUpdate::Text(TextField::CustomerName, "Jane".to_string()),
                    FieldUpdate::Text(TextField::Postcode, "LS1 4ED".to_string()),
                    FieldUpdate::Flag(FlagField::CallbackRequested),
                ],
            )
            .await
            .unwrap();
        assert_eq!(applied, vec!["customer_name", "postcode", "callback_requested"]);

        let applied = store
            .apply_field_updates(
                &sid,
                &[
                    FieldUpdate::Text(TextField::CustomerName, "Janet".to_string()),
                    FieldUpdate::Text(TextField::CustomerEmail, "jane@example.com".to_string()),
                    FieldUpdate::Flag(FlagField::CallbackRequested),
                ],
            )
            .await
            .unwrap();
        assert_eq!(applied, vec!["customer_email"]);

        let call = store.get_call(&sid).await.unwrap().unwrap();
        assert_eq!(call.customer_name.as_deref(), Some("Jane"));
        assert_eq!(call.postcode.as_deref(), Some("LS1 4ED"));
        assert_eq!(call.customer_email.as_deref(), Some("jane@example.com"));
        assert!(call.callback_requested);
        assert!(!call.complaint);
        store.delete_call(&sid).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn orphan_fragment_is_not_stored() {
        let store = test_store().await;
        let sid = unique_sid();
        let entry = store
            .append_transcript(&sid, Speaker::Customer, "hello?")
            .await
            .unwrap();
        assert!(entry.is_none());
        assert!(store.transcript(&sid).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore]
    async fn deleting_a_call_removes_its_transcript() {
        let store = test_store().await;
        let sid = unique_sid();
        store.create_call(&sid, None, "WK1").await.unwrap();
        for (speaker, text) in [(Speaker::Agent, "Hello"), (Speaker::Customer, "Hi there")] {
            store.append_transcript(&sid, speaker, text).await.unwrap().unwrap();
        }
        assert_eq!(store.transcript(&sid).await.unwrap().len(), 2);

        assert!(store.delete_call(&sid).await.unwrap());
        assert!(store.get_call(&sid).await.unwrap().is_none());
        assert!(store.transcript(&sid).await.unwrap().is_empty());
        assert!(!store.delete_call(&sid).await.unwrap());
    }

    #[tokio::test]
    #[ignore]
    async fn retention_cutoff_is_exclusive() {
        let store = test_store().await;
        let cutoff = datetime!(1990-03-01 00:00 UTC);
        let old = unique_sid();
        let edge = unique_sid();
        store.create_call(&old, None, "WK1").await.unwrap();
        store.create_call(&edge, None, "WK2").await.unwrap();
        set_start_time(&store, &old, cutoff - time::Duration::seconds(1)).await;
        set_start_time(&store, &edge, cutoff).await;

        let expired = store.expired_calls(cutoff).await.unwrap();
        assert!(expired.contains(&old));
        assert!(!expired.contains(&edge));
        store.delete_call(&old).await.unwrap();
        store.delete_call(&edge).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn search_treats_wildcards_literally() {
        let store = test_store().await;
        let tag = rand::random::<u32>();
        let literal = unique_sid();
        let other = unique_sid();
        store.create_call(&literal, None, "WK1").await.unwrap();
        store.create_call(&other, None, "WK2").await.unwrap();
        store
            .apply_field_updates(
                &literal,
                &[FieldUpdate::Text(TextField::CustomerName, format!("100% Skips {tag}"))],
            )
            .await
            .unwrap();
        store
            .apply_field_updates(
                &other,
                &[FieldUpdate::Text(TextField::CustomerName, format!("1000 Skips {tag}"))],
            )
            .await
            .unwrap();

        let found = store.search(&format!("100% Skips {tag}"), 10).await.unwrap();
        let sids: Vec<&str> = found.iter().map(|c| c.call_sid.as_str()).collect();
        assert_eq!(sids, vec![literal.as_str()]);

        let found = store.search(&format!("skips {tag}"), 10).await.unwrap();
        assert_eq!(found.len(), 2);
        store.delete_call(&literal).await.unwrap();
        store.delete_call(&other).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn stats_count_flags_and_tickets() {
        let store = test_store().await;
        let day_start = datetime!(2999-01-01 00:00 UTC);
        let before = store.stats(day_start).await.unwrap();

        let sid = unique_sid();
        store.create_call(&sid, None, "WK1").await.unwrap();
        store
            .apply_field_updates(
                &sid,
                &[
                    FieldUpdate::Flag(FlagField::Complaint),
                    FieldUpdate::Flag(FlagField::TradeCustomer),
                ],
            )
            .await
            .unwrap();
        let id = store.get_call(&sid).await.unwrap().unwrap().id;
        store.update_status(id, CallStatus::TicketRaised).await.unwrap();

        let after = store.stats(day_start).await.unwrap();
        assert_eq!(after.complaints - before.complaints, 1);
        assert_eq!(after.trade_customers - before.trade_customers, 1);
        assert_eq!(after.tickets_raised - before.tickets_raised, 1);
        assert_eq!(after.today_calls, 0);
        store.delete_call(&sid).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn redelivered_recording_keeps_downloaded_status() {
        let store = test_store().await;
        let sid = unique_sid();
        store.create_call(&sid, None, "WK1").await.unwrap();
        let recording = NewRecording {
            recording_sid: "RE1".to_string(),
            recording_url: "https://api.twilio.com/recordings/RE1".to_string(),
            duration_seconds: 42,
        };
        assert!(store.set_recording(&sid, &recording).await.unwrap());
        let path = format!("recordings/{sid}.mp3");
        store.set_recording_cached(&sid, Some(&path)).await.unwrap();
        assert!(store.set_recording(&sid, &recording).await.unwrap());

        let call = store.get_call(&sid).await.unwrap().unwrap();
        assert_eq!(call.recording_status, RecordingStatus::Downloaded);
        assert_eq!(call.recording_path.as_deref(), Some(path.as_str()));
        store.delete_call(&sid).await.unwrap();
    }
}
