//! cartograph-server: HTTP front end for the live target-rule store.
//!
//! # Usage
//!
//! ```bash
//! # Defaults from .env / environment
//! cartograph-server
//!
//! # Profiled config (reads PROD_PG_HOST, PROD_PORT, ... before PG_HOST, PORT, ...)
//! cartograph-server --profile prod
//!
//! # Throwaway in-memory store on another port
//! cartograph-server --backend memory --port 4000
//! ```

mod api;
mod router;
mod state;

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use cartograph_core::config::{self, Config};
use cartograph_targets::TargetStore;

use crate::state::AppState;

/// Serve the target-rule API.
#[derive(Parser, Debug)]
#[command(name = "cartograph-server", version, about)]
struct Cli {
    /// Config profile; every key is looked up as {PROFILE}_{KEY} first.
    #[arg(long, env = "CARTOGRAPH_PROFILE")]
    profile: Option<String>,

    /// Bind address (overrides HOST).
    #[arg(long)]
    host: Option<String>,

    /// Bind port (overrides PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Target backend: "postgres" or "memory" (overrides TARGETS_BACKEND).
    #[arg(long)]
    backend: Option<String>,
}

impl Cli {
    fn into_config(self) -> Config {
        let mut config = Config::for_profile(self.profile.as_deref().unwrap_or(""));
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(backend) = self.backend {
            config.targets.backend = backend;
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // .env must be loaded before clap reads CARTOGRAPH_PROFILE.
    config::load_dotenv();
    let config = Cli::parse().into_config();
    config.validate()?;
    config.log_summary();

    let targets = Arc::new(TargetStore::connect(&config).await?);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            targets.close().await;
            return Err(e.into());
        }
    };

    let state = Arc::new(AppState {
        targets: Arc::clone(&targets),
        config,
    });
    let app = router::build_router(state);

    info!("Server listening on http://{}", addr);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    targets.close().await;
    served?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl_c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
