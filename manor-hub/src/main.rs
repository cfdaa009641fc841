//! Hub entry point

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use manor_hub::audit::AuditLog;
use manor_hub::config::HubConfig;
use manor_hub::packages::PackageManager;
use manor_hub::procman::ProcessManager;
use manor_hub::sessions::{FingerprintFn, SessionManager};
use manor_hub::state::{HubContext, RouteTable};
use manor_hub::tls::TlsListener;
use manor_hub::{proxy, Result};

fn init_tracing(log_level: &str) {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

async fn open_hub_database(config: &HubConfig) -> Result<libsql::Database> {
    let path = config.hub_db_path();
    libsql::Builder::new_local(&path)
        .build()
        .await
        .map_err(|e| {
            manor_hub::Error::Database(format!(
                "failed to open hub database '{}': {}",
                path.display(),
                e
            ))
        })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = HubConfig::load()?;
    config.validate()?;
    init_tracing(&config.log_level);

    tracing::info!(
        "starting hub for domain {} on port {}",
        config.domain,
        config.listen_port
    );
    if config.verify_backend_tls {
        tracing::info!("verify_backend_tls is set; all hops are loopback today, so it is inert");
    }

    tokio::fs::create_dir_all(&config.data_dir).await?;
    let db = open_hub_database(&config).await?;

    let fingerprint: FingerprintFn =
        Arc::new(|token| blake3::hash(token.as_bytes()).to_hex().to_string());
    let audit = Arc::new(AuditLog::open(&db).await?);
    let sessions = Arc::new(SessionManager::open(db, fingerprint).await?);
    let packages = Arc::new(PackageManager::open(config.data_dir.join("packages"))?);

    let (probe_tx, probe_rx) = mpsc::unbounded_channel();
    let ctx = Arc::new(HubContext {
        config: Arc::new(config),
        routes: Arc::new(RouteTable::new()),
        sessions: sessions.clone(),
        audit,
        packages,
        runtime: Arc::new(dashmap::DashMap::new()),
        http: reqwest::Client::new(),
        probe_nudge: probe_tx,
    });

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, shutting down");
                shutdown.cancel();
            }
        });
    }

    // The fleet.
    let manager = Arc::new(ProcessManager::new(ctx.clone()));
    let manager_task = tokio::spawn(manager.run(probe_rx, shutdown.clone()));

    // Periodic session and token garbage collection.
    {
        let sessions = sessions.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => match sessions.sweep_expired().await {
                        Ok(0) => {}
                        Ok(swept) => tracing::debug!("swept {} expired sessions", swept),
                        Err(e) => tracing::warn!("session sweep failed: {}", e),
                    },
                }
            }
        });
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], ctx.config.listen_port));
    let listener = TlsListener::bind(addr, &ctx.config.tls).await?;
    tracing::info!("hub listening on {}", addr);

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, proxy::router(ctx))
        .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
        .await?;

    // Let the process manager finish stopping children.
    if tokio::time::timeout(Duration::from_secs(30), manager_task)
        .await
        .is_err()
    {
        tracing::warn!("process manager did not stop in time");
    }

    tracing::info!("hub shutdown complete");
    Ok(())
}
