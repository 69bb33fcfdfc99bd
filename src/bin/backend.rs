use std::{net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use reeltube::{
    api::{self, AppState},
    auth::TokenSigner,
    config::{DEFAULT_CONFIG_PATH, Settings},
    db::Database,
    media::MediaStore,
    security::ensure_not_root,
};
use tokio::signal::{
    self,
    unix::{SignalKind, signal},
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve the ReelTube API.")]
struct Cli {
    #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the env-style config file")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    ensure_not_root("reeltube-backend")?;

    let settings = Settings::load(&cli.config).context("loading configuration")?;
    let db = Database::open(&settings.database_path).context("initializing database")?;
    let media = MediaStore::new(&settings.upload_dir);
    media.prepare().await?;

    let state = AppState::new(
        db.clone(),
        TokenSigner::new(&settings.token_secret, settings.token_ttl),
        media,
    );
    let app = api::router(state, settings.max_upload_bytes);

    let addr = SocketAddr::new(
        settings
            .host
            .parse()
            .with_context(|| format!("parsing REELTUBE_HOST {}", settings.host))?,
        settings.port,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    info!("server stopped");
    db.close()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
