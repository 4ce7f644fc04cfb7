use crate::db_types::CallRecord;
use crate::error::AppError;
use crate::store::CallStore;
use crate::types::AppState;
use crate::utils::file_stem;

use futures_util::StreamExt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

/// Local cache of carrier call recordings, one `<call_sid>.mp3` per call.
pub struct RecordingCache {
    dir: PathBuf,
}

impl RecordingCache {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Cache location for a call's recording; `None` when the call sid is not a safe
    /// file name.
    pub fn path_for(&self, call_sid: &str) -> Option<PathBuf> {
        file_stem(call_sid).map(|stem| self.dir.join(format!("{stem}.mp3")))
    }

    async fn cached(&self, call_sid: &str) -> Option<PathBuf> {
        let path = self.path_for(call_sid)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Some(path),
            _ => None,
        }
    }

    /// Path of the cached recording for `call`, downloading it first if needed.
    pub async fn fetch(&self, state: &AppState, call: &CallRecord) -> Result<PathBuf, AppError> {
        if let Some(path) = self.cached(&call.call_sid).await {
            return Ok(path);
        }
        let url = call
            .recording_url
            .as_deref()
            .ok_or(AppError("call has no recording"))?;
        let path = self.path_for(&call.call_sid).ok_or_else(|| {
            error!(call_sid=%call.call_sid, "call sid cannot be used as a file name");
            AppError("invalid call sid")
        })?;
        fs::create_dir_all(&self.dir).await.map_err(|e| {
            error!(error=%e, dir=?self.dir, "failed to create recording cache dir");
            AppError("recording cache unavailable")
        })?;

        let part = path.with_extension("mp3.part");
        if let Err(e) = download(state, url, &part).await {
            let _ = fs::remove_file(&part).await;
            return Err(e);
        }
        fs::rename(&part, &path).await.map_err(|e| {
            error!(error=%e, path=?path, "failed to move downloaded recording into place");
            AppError("recording cache unavailable")
        })?;
        info!(call_sid=%call.call_sid, path=?path, "recording cached");

        let stored = path.to_string_lossy();
        if let Err(e) = state
            .store
            .set_recording_cached(&call.call_sid, Some(&stored))
            .await
        {
            error!(error=%e, call_sid=%call.call_sid, "failed to mark recording downloaded");
        }
        Ok(path)
    }

    /// Remove cached files last modified more than `ttl` before `now` and revert their
    /// calls to `available`.  Returns the number of files removed.
    pub async fn sweep(&self, store: &dyn CallStore, ttl: Duration, now: SystemTime) -> usize {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return 0,
            Err(e) => {
                error!(error=%e, dir=?self.dir, "failed to read recording cache dir");
                return 0;
            }
        };

        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    error!(error=%e, "failed to read recording cache entry");
                    break;
                }
            };
            let path = entry.path();
            if !is_expired(&path, ttl, now).await {
                continue;
            }
            if let Err(e) = fs::remove_file(&path).await {
                warn!(error=%e, path=?path, "failed to remove cached recording");
                continue;
            }
            removed += 1;
            debug!(path=?path, "removed stale cached recording");

            let call_sid = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_suffix(".mp3"));
            if let Some(call_sid) = call_sid {
                if let Err(e) = store.set_recording_cached(call_sid, None).await {
                    warn!(error=%e, call_sid, "failed to reset recording status");
                }
            }
        }
        removed
    }
}

async fn is_expired(path: &Path, ttl: Duration, now: SystemTime) -> bool {
    let modified = match fs::metadata(path).await {
        Ok(meta) if meta.is_file() => meta.modified(),
        Ok(_) => return false,
        Err(e) => {
            warn!(error=%e, path=?path, "failed to stat cached recording");
            return false;
        }
    };
    match modified {
        Ok(modified) => now.duration_since(modified).map_or(false, |age| age > ttl),
        Err(e) => {
            warn!(error=%e, path=?path, "no modification time for cached recording");
            false
        }
    }
}

/// Stream the recording at `url` into `dest`.
async fn download(state: &AppState, url: &str, dest: &Path) -> Result<(), AppError> {
    let mut request = state.http_client.get(url);
    if let Some((account_sid, auth_token)) = state.config.twilio_credentials() {
        request = request.basic_auth(account_sid, Some(auth_token));
    }
    let resp = request.send().await.map_err(|e| {
        error!(error=%e, "failed to request recording from twilio");
        AppError("recording download failed")
    })?;
    if !resp.status().is_success() {
        error!(status=%resp.status(), url, "twilio refused recording download");
        return Err(AppError("recording download failed"));
    }

    let mut file = fs::File::create(dest).await.map_err(|e| {
        error!(error=%e, path=?dest, "failed to create recording file");
        AppError("recording cache unavailable")
    })?;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            error!(error=%e, "recording download interrupted");
            AppError("recording download failed")
        })?;
        file.write_all(&chunk).await.map_err(|e| {
            error!(error=%e, path=?dest, "failed to write recording chunk");
            AppError("recording cache unavailable")
        })?;
    }
    file.flush().await.map_err(|e| {
        error!(error=%e, path=?dest, "failed to flush recording file");
        AppError("recording cache unavailable")
    })?;
    Ok(())
}
