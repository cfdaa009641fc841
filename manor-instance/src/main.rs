//! Instance daemon entry point
//!
//! The hub launches one of these per active application instance, passing
//! identity and wiring as flags. Everything else comes from the shared
//! config sources.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use manor_instance::config::{AppKind, InstanceConfig};
use manor_instance::dbproxy::DbProxy;
use manor_instance::events::{EventStore, HandlerRegistry};
use manor_instance::http::AppState;
use manor_instance::sandbox::{self, SandboxHost};
use manor_instance::{admin, db, http};

#[derive(Parser)]
#[command(name = "manor-instance", about = "Manor application instance daemon")]
struct Args {
    /// Stable opaque id of this instance
    #[arg(long)]
    instance_id: Option<String>,

    /// External hostname this instance is routed under
    #[arg(long)]
    host_name: Option<String>,

    /// Path to the instance database file
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Loopback port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Application kind: admin, login, or guest
    #[arg(long)]
    app: Option<String>,

    /// Path to the guest module
    #[arg(long)]
    guest_module: Option<PathBuf>,

    /// Public domain of the hub
    #[arg(long)]
    public_domain: Option<String>,

    /// Base URL of the hub's internal host
    #[arg(long)]
    internal_base_url: Option<String>,

    /// Shared secret for the internal RPC channel
    #[arg(long, env = "INTERNAL_SECRET", hide_env_values = true)]
    internal_secret: Option<String>,
}

impl Args {
    fn apply(self, config: &mut InstanceConfig) -> anyhow::Result<()> {
        if let Some(v) = self.instance_id {
            config.instance_id = v;
        }
        if let Some(v) = self.host_name {
            config.host_name = v;
        }
        if let Some(v) = self.db_path {
            config.db_path = v;
        }
        if let Some(v) = self.port {
            config.port = v;
        }
        if let Some(v) = self.app {
            config.app = match v.as_str() {
                "admin" => AppKind::Admin,
                "login" => AppKind::Login,
                "guest" => AppKind::Guest,
                other => anyhow::bail!("unknown app kind '{}'", other),
            };
        }
        if let Some(v) = self.guest_module {
            config.guest_module = Some(v);
        }
        if let Some(v) = self.public_domain {
            config.public_domain = v;
        }
        if let Some(v) = self.internal_base_url {
            config.internal_base_url = v;
        }
        if let Some(v) = self.internal_secret {
            config.internal_secret = v;
        }
        Ok(())
    }
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = InstanceConfig::load()?;
    args.apply(&mut config)?;
    config.validate()?;
    init_tracing(&config.log_level);

    tracing::info!(
        "starting instance {} ({:?}) on port {}",
        config.instance_id,
        config.app,
        config.port
    );

    let database = db::open_database(
        &config.db_path,
        config.db_max_retries,
        config.db_retry_delay_secs,
    )
    .await?;
    let db = Arc::new(DbProxy::new(database)?);

    let mut registry = HandlerRegistry::new();
    let mut sandbox_host = None;
    match config.app {
        AppKind::Admin => {
            admin::seed(db.connection(), &config.public_domain).await?;
            admin::register_handlers(&mut registry);
        }
        AppKind::Login => {}
        AppKind::Guest => {
            let host = SandboxHost::spawn(&config, db.clone()).await?;
            sandbox::register_guest_event_handlers(&mut registry, &host);
            sandbox_host = Some(host);
        }
    }

    let store = Arc::new(EventStore::open(db.clone(), registry, config.poll_timeout()).await?);

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

    http::serve(AppState {
        config: Arc::new(config),
        store,
        db,
        sandbox: sandbox_host,
        shutdown,
    })
    .await?;

    Ok(())
}
