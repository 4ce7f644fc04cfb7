use crate::config::Config;
use crate::extraction::Extractor;
use crate::recordings::RecordingCache;
use crate::store::CallStore;

use std::sync::Arc;

/// Everything a request handler or background task needs, built once in `main`.
pub struct AppState {
    pub config: Config,
    pub http_client: reqwest::Client,
    pub store: Arc<dyn CallStore>,
    /// `None` when no extraction service is configured.
    pub extractor: Option<Arc<dyn Extractor>>,
    pub recordings: RecordingCache,
}

impl AppState {
    pub fn new(
        config: Config,
        http_client: reqwest::Client,
        store: Arc<dyn CallStore>,
        extractor: Option<Arc<dyn Extractor>>,
    ) -> Self {
        let recordings = RecordingCache::new(config.recording_cache_dir.clone());
        Self {
            config,
            http_client,
            store,
            extractor,
            recordings,
        }
    }
}
