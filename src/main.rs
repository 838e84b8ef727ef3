use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use tracing_subscriber::EnvFilter;

use doc_numbering::api;
use doc_numbering::audit::MemoryAuditSink;
use doc_numbering::clock::SystemClock;
use doc_numbering::config::{Config, StoreBackend};
use doc_numbering::metrics::NumberingMetrics;
use doc_numbering::{InMemoryDefinitionStore, RedisDefinitionStore, SequenceDefinitionStore, SequenceService};

#[actix_web::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("doc_numbering=info,audit=info")),
        )
        .init();

    let config = Config::from_env()?;
    tracing::info!(store = ?config.store, host = %config.host, port = config.port, "doc-numbering starting");

    let store: Arc<dyn SequenceDefinitionStore> = match config.store {
        StoreBackend::Memory => {
            tracing::warn!("in-memory store: counters are lost on restart and not shared across instances");
            Arc::new(InMemoryDefinitionStore::new(config.lock_timeout))
        }
        StoreBackend::Redis => {
            let store =
                RedisDefinitionStore::connect(&config.redis_url, config.redis_prefix.clone(), config.lock_timeout).await?;
            tracing::info!(url = %config.redis_url, prefix = %config.redis_prefix, "connected to redis");
            Arc::new(store)
        }
    };

    let service = web::Data::new(SequenceService::new(
        store,
        Arc::new(SystemClock),
        Arc::new(MemoryAuditSink::new()),
        NumberingMetrics::new()?,
        config.service.clone(),
    ));

    HttpServer::new(move || App::new().app_data(service.clone()).configure(api::configure))
        .bind((config.host.as_str(), config.port))?
        .run()
        .await?;

    Ok(())
}
