use clap::Parser;
use soligraph::{create_router, AppState, Engine, EngineConfig};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "soligraph")]
#[command(about = "Soligraph - GraphQL mutations compiled to PostgreSQL", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the configuration
    #[arg(short, long)]
    listen: Option<String>,

    /// Cache compiled statements and hide per-field validation logs
    #[arg(long)]
    production: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "soligraph=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &args.config {
        Some(path) => {
            tracing::info!("Loading configuration from {}", path.display());
            EngineConfig::load(path)?
        }
        None => {
            let mut config = EngineConfig::default();
            config.apply_env();
            config
        }
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if args.production {
        config.production = true;
    }
    if config.jwt_secret.is_none() {
        tracing::warn!("No JWT secret configured, every request runs anonymously");
    }

    let listen = config.listen.clone();
    let app_state = AppState::new(Engine::connect(config.clone())?, config.jwt_secret.as_deref());
    let app = create_router(app_state);

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!("Server listening on {}", listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining connections...");
}
