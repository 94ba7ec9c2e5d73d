//! reactor-pool server binary.
//!
//! Loads the configuration (CLI arguments over an optional TOML file),
//! installs logging and runs the reactor until it stops.

use reactor_pool::cache::{Cache, FsBacking};
use reactor_pool::config::Config;
use reactor_pool::http::{HttpService, Service};
use reactor_pool::pool::WorkerPool;
use reactor_pool::runtime::{Reactor, ServerContext};
use reactor_pool::services::auth::StaticTokens;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.runtime.listen,
        doc_root = %config.doc_root.display(),
        workers = config.pool.initial,
        min_workers = config.pool.min,
        max_workers = config.pool.max,
        keepalive_ms = config.runtime.keepalive_ms,
        freshness_ms = config.cache.freshness_ms,
        "Starting reactor-pool server"
    );

    let backing = Arc::new(FsBacking::new(&config.doc_root));
    let cache = Arc::new(Cache::new(backing, config.cache.clone()));

    let mut service = HttpService::new(Arc::clone(&cache));
    if !config.auth.tokens.is_empty() {
        let tokens = StaticTokens::new(
            config
                .auth
                .tokens
                .iter()
                .map(|grant| (grant.token.clone(), grant.expires)),
        );
        info!(
            tokens = tokens.len(),
            public_paths = config.auth.public_paths.len(),
            "Token authentication enabled"
        );
        service = service.with_auth(Arc::new(tokens), config.auth.public_paths.clone());
    }
    let service: Arc<dyn Service> = Arc::new(service);

    let pool = WorkerPool::new(config.pool.clone())?;
    let ctx = Arc::new(ServerContext::new(config.runtime.clone(), cache, service));
    let reactor = Reactor::bind(ctx, pool)?;

    reactor.run()?;
    info!("Server stopped");
    Ok(())
}
