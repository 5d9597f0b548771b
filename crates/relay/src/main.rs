use std::sync::Arc;

use anyhow::Context;
use notesync_relay::{
    app::{build_router, RelayServices},
    auth::{authenticator::ConnectionAuthenticator, jwt::JwtCredentialVerifier},
    blob::{FsBlobStore, MemoryBlobStore, StateBlobStore},
    config::{LogFormat, RelayConfig},
    db::{
        migrations::run_migrations,
        pool::{check_pool_health, create_pg_pool, PoolConfig},
    },
    records::PgRecordStore,
    sync::{
        coordinator::PersistenceCoordinator,
        observer::{LifecycleEvents, LoggingObserver, ObserverChain, SessionObserver},
        session::{SessionConfig, SessionManager},
    },
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config);

    if config.is_dev_jwt_secret() {
        warn!("using the development JWT secret; set NOTESYNC_RELAY_JWT_SECRET in production");
    }

    let verifier = Arc::new(
        JwtCredentialVerifier::new(&config.jwt_secret).context("invalid relay JWT secret")?,
    );

    let database_url = config
        .database_url
        .as_deref()
        .context("NOTESYNC_RELAY_DATABASE_URL must be set to start the relay")?;
    let pool = create_pg_pool(database_url, PoolConfig::from_env()).await?;
    check_pool_health(&pool).await?;
    if config.run_migrations {
        run_migrations(&pool).await?;
        info!("relay migrations applied");
    }
    let records = Arc::new(PgRecordStore::new(pool));

    let blobs: Arc<dyn StateBlobStore> = match &config.state_dir {
        Some(state_dir) => {
            let store = FsBlobStore::open(state_dir).await?;
            info!(state_dir = %store.root().display(), "durable state on local disk");
            Arc::new(store)
        }
        None => {
            warn!("NOTESYNC_RELAY_STATE_DIR is unset; document state is kept in memory only");
            Arc::new(MemoryBlobStore::new())
        }
    };

    let lifecycle = LifecycleEvents::new();
    let observers = ObserverChain::new(vec![
        Arc::new(LoggingObserver) as Arc<dyn SessionObserver>,
        Arc::new(lifecycle),
    ]);

    let coordinator =
        Arc::new(PersistenceCoordinator::new(records.clone(), blobs, observers.clone()));
    let sessions = Arc::new(SessionManager::new(
        coordinator,
        observers,
        SessionConfig { store_debounce: config.store_debounce, store_retry: config.store_retry },
    ));
    let authenticator = Arc::new(ConnectionAuthenticator::new(Arc::clone(&verifier), records));

    let app = build_router(
        RelayServices { verifier, authenticator, sessions: Arc::clone(&sessions) },
        config.cors_origins.as_deref(),
    );

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting relay server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited unexpectedly")?;

    let flushed = sessions.flush_all().await;
    info!(flushed, "relay stopped");
    Ok(())
}

fn init_tracing(config: &RelayConfig) {
    let filter =
        EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
