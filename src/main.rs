mod config;
mod db_types;
mod error;
mod extraction;
mod handlers;
mod ingest;
mod openai_types;
mod query;
mod recordings;
mod store;
mod tasks;
#[cfg(test)]
mod test_support;
mod twilio_types;
mod types;
mod utils;

use crate::config::Config;
use crate::store::{memory::MemoryStore, postgres::PgCallStore, CallStore};
use crate::types::AppState;

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

pub mod consts {
    pub const DISPLAY_ID_PREFIX: &str = "WK";
    /// Prior transcript entries handed to the extractor as context.
    pub const CONTEXT_TURNS: i64 = 5;
    pub const DEFAULT_LIST_WINDOW_MINUTES: i64 = 120;
    /// Longer windows are clamped to this (one year).
    pub const MAX_LIST_WINDOW_MINUTES: i64 = 366 * 24 * 60;
    pub const DEFAULT_LIST_LIMIT: i64 = 100;
    pub const MAX_LIST_LIMIT: i64 = 500;
    pub const UNAVAILABLE_MESSAGE: &str = "Sorry, we're unable to connect you at the moment.";
    pub const STORE_RETRY_ATTEMPTS: u32 = 3;
    pub const STORE_RETRY_BACKOFF_MILLIS: u64 = 100;
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let config = Config::from_env().expect("invalid configuration");

    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(true)
                .with_line_number(true),
        )
        .with(tracing_subscriber::filter::Targets::new().with_targets([
            ("hyper", tracing_subscriber::filter::LevelFilter::OFF),
            ("sqlx", tracing_subscriber::filter::LevelFilter::WARN),
            ("call_intake", config.log_level),
        ]));
    tracing::subscriber::set_global_default(subscriber).expect("failed to install subscriber");

    let store: Arc<dyn CallStore> = match &config.database_url {
        Some(url) => Arc::new(
            PgCallStore::connect(url, config.db_max_connections)
                .await
                .expect("failed to connect to database"),
        ),
        None => {
            warn!("DATABASE_URL not set; call records are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };
    let http_client = reqwest::Client::new();
    let extractor = extraction::from_config(&config, http_client.clone());
    if extractor.is_none() {
        warn!("no extraction service configured; field extraction disabled");
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let app_state = Arc::new(AppState::new(config, http_client, store, extractor));

    tokio::spawn(tasks::retention_sweep(app_state.clone()));

    let app = handlers::router(app_state);

    info!(%addr, "listening");
    if let Err(e) = axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
    {
        error!(error=%e, "server error");
    }
}
