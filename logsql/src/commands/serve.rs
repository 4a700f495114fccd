//! Entrypoint for the search and ingestion server.

use std::sync::Arc;

use hyper::server::conn::AddrIncoming;
use logsql_clap_blocks::{
    logging::LoggingConfig,
    meta_store::{MetaStoreConfig, MetaStoreError},
    socket_addr::{DEFAULT_HTTP_BIND_ADDR, SocketAddr},
    tuning::TuningConfig,
};
use logsql_config::{
    ConfigNotifier, ConfigProvider, ConfigStore, ConfigSynchronizer, PollingNotifier, StoreError,
};
use logsql_ingest::Ingester;
use logsql_object_store::{DatastoreConnector, ObjectStoreProvider};
use logsql_search::{Executor, StreamingSelector};
use logsql_server::{HttpApi, serve};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot open meta store: {0}")]
    MetaStore(#[from] MetaStoreError),

    #[error("cannot load config descriptor: {0}")]
    Config(#[from] StoreError),

    #[error("failed to bind address {addr}: {source}")]
    BindAddress {
        addr: std::net::SocketAddr,
        source: hyper::Error,
    },

    #[error("server error: {0}")]
    Server(#[from] hyper::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, clap::Parser)]
pub struct Config {
    /// config descriptor store options
    #[clap(flatten)]
    meta_store_config: MetaStoreConfig,

    /// logging options
    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,

    /// limits
    #[clap(flatten)]
    tuning_config: TuningConfig,

    /// The address on which the HTTP API is served
    #[clap(
        long = "http-bind",
        env = "LOGSQL_HTTP_BIND_ADDR",
        default_value = DEFAULT_HTTP_BIND_ADDR,
        action,
    )]
    http_bind_address: SocketAddr,
}

pub async fn command(config: Config) -> Result<()> {
    let startup_timer = Instant::now();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        query_workers = config.tuning_config.query_workers,
        "logsql server starting"
    );

    // Construct a token to trigger clean shutdown
    let shutdown = CancellationToken::new();

    let connector = Arc::new(DatastoreConnector::new(&config.meta_store_config.region));
    let meta_store = config.meta_store_config.object_store(&connector)?;
    let config_store = ConfigStore::new(meta_store, config.meta_store_config.config_path());

    let synchronizer = Arc::new(ConfigSynchronizer::initialize(config_store).await?);
    let notifier = PollingNotifier::new(
        synchronizer.store(),
        config.tuning_config.config_poll_interval,
    );
    let watcher = synchronizer.spawn_watcher(notifier.subscribe(), shutdown.clone());

    let provider: Arc<dyn ObjectStoreProvider> = Arc::clone(&connector) as _;
    let config_provider: Arc<dyn ConfigProvider> = Arc::clone(&synchronizer) as _;
    let executor = Executor::new(
        Arc::clone(&provider),
        Arc::new(StreamingSelector),
        config.tuning_config.query_workers,
    );
    let ingester = Ingester::new(
        Arc::clone(&config_provider),
        provider,
        config.tuning_config.ingest_max_records,
    );
    let api = Arc::new(HttpApi::new(
        config_provider,
        executor,
        ingester,
        config.tuning_config.max_http_request_size,
        shutdown.clone(),
    ));

    let addr = *config.http_bind_address;
    let listener =
        AddrIncoming::bind(&addr).map_err(|source| Error::BindAddress { addr, source })?;

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received interrupt, shutting down"),
            Err(e) => warn!(error = %e, "cannot listen for interrupts"),
        }
        signal.cancel();
    });

    info!(elapsed = ?startup_timer.elapsed(), "startup complete");
    let served = serve(listener, api, shutdown.clone()).await;
    shutdown.cancel();
    if let Err(e) = watcher.await {
        warn!(error = %e, "config watcher failed");
    }
    served?;
    info!("server stopped");
    Ok(())
}
