use crate::error::{handle_error, AppError};
use crate::types::AppState;

use std::sync::Arc;
use std::time::SystemTime;
use time::{Duration, OffsetDateTime};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub calls_deleted: usize,
    pub files_removed: usize,
}

/// Background task that periodically purges expired calls and stale cached recordings.
/// The first sweep runs immediately.
pub async fn retention_sweep(app_state: Arc<AppState>) {
    let mut ticker = interval(app_state.config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let report = run_sweep(&app_state, OffsetDateTime::now_utc(), SystemTime::now()).await;
        info!(
            calls_deleted = report.calls_deleted,
            files_removed = report.files_removed,
            "retention sweep finished"
        );
    }
}

pub async fn run_sweep(state: &AppState, now: OffsetDateTime, wall_clock: SystemTime) -> SweepReport {
    let calls_deleted = match purge_expired_calls(state, now).await {
        Ok(n) => n,
        Err(e) => {
            handle_error(e).await;
            0
        }
    };
    let files_removed = state
        .recordings
        .sweep(
            &*state.store,
            state.config.recording_cache_ttl,
            wall_clock,
        )
        .await;
    SweepReport {
        calls_deleted,
        files_removed,
    }
}

/// Delete calls older than the retention period one at a time; a failed delete is logged
/// and the rest still go.
async fn purge_expired_calls(state: &AppState, now: OffsetDateTime) -> Result<usize, AppError> {
    let days = state.config.call_retention_days;
    let cutoff = Some(days)
        .filter(|days| *days > 0)
        .and_then(|days| days.checked_mul(24 * 60 * 60))
        .and_then(|secs| now.checked_sub(Duration::seconds(secs)))
        .ok_or_else(|| {
            error!(days, "retention cutoff out of range");
            AppError("retention cutoff out of range")
        })?;
    let expired = state.store.expired_calls(cutoff).await.map_err(|e| {
        error!(error=%e, "failed to list expired calls");
        AppError("retention sweep could not list expired calls")
    })?;

    let mut deleted = 0;
    for call_sid in expired {
        match state.store.delete_call(&call_sid).await {
            Ok(true) => {
                debug!(call_sid=%call_sid, "deleted expired call");
                deleted += 1;
            }
            Ok(false) => {}
            Err(e) => error!(error=%e, call_sid=%call_sid, "failed to delete expired call"),
        }
    }
    Ok(deleted)
}
