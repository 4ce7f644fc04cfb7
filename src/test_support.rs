use crate::config::Config;
use crate::extraction::{ExtractedFields, ExtractionError, ExtractionRequest, Extractor};
use crate::store::memory::MemoryStore;
use crate::types::AppState;

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Extractor double: answers every request with a canned body, optionally after a delay.
pub struct StubExtractor {
    body: Option<String>,
    delay: Duration,
    pub requests: Mutex<Vec<ExtractionRequest>>,
}

impl StubExtractor {
    pub fn returning(body: &str) -> Self {
        Self {
            body: Some(body.to_string()),
            delay: Duration::ZERO,
            requests: Mutex::new(vec![]),
        }
    }

    pub fn failing() -> Self {
        Self {
            body: None,
            delay: Duration::ZERO,
            requests: Mutex::new(vec![]),
        }
    }

    pub fn slow(body: &str, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::returning(body)
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Extractor for StubExtractor {
    async fn extract(&self, request: &ExtractionRequest) -> Result<ExtractedFields, ExtractionError> {
        self.requests.lock().unwrap().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.body {
            Some(body) => ExtractedFields::parse(body),
            None => Err(ExtractionError::Status(503)),
        }
    }
}

pub fn test_config() -> Config {
    Config {
        extraction_timeout: Duration::from_millis(200),
        ..Config::default()
    }
}

pub fn memory_state(extractor: Option<Arc<StubExtractor>>) -> (Arc<AppState>, Arc<MemoryStore>) {
    memory_state_with(test_config(), extractor)
}

pub fn memory_state_with(
    config: Config,
    extractor: Option<Arc<StubExtractor>>,
) -> (Arc<AppState>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let extractor = extractor.map(|e| e as Arc<dyn Extractor>);
    let state = AppState::new(config, reqwest::Client::new(), store.clone(), extractor);
    (Arc::new(state), store)
}
