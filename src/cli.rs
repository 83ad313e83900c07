use std::future::IntoFuture;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::{api, config::Config, state::AppState, store, utils};

/// Once a shutdown signal arrives, in-flight requests get this long to
/// commit or roll back before the process exits anyway.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// CLI for the order matching engine
#[derive(Parser)]
#[command(name = "order-matching-engine")]
#[command(version, about = "A continuous double-auction order matching engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API server (the default when no command is given)
    Serve {
        /// Listen port; overrides $PORT
        #[arg(long)]
        port: Option<u16>,
    },
    /// Create the database tables and exit
    InitSchema,
}

pub async fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = Config::from_env()?;
    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => serve(cfg, port).await,
        Commands::InitSchema => {
            let pool = store::connect(&cfg.db).await?;
            store::init_schema(&pool).await?;
            pool.close().await;
            Ok(())
        }
    }
}

async fn serve(cfg: Config, port_override: Option<u16>) -> anyhow::Result<()> {
    let pool = store::connect(&cfg.db).await?;
    store::init_schema(&pool).await?;

    let state = AppState::new(pool.clone());
    let app = api::router(state);

    let port = port_override.unwrap_or(cfg.listen_port);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "order REST API running");

    let token = utils::shutdown_token();
    let shutdown = token.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await });
    let mut server = std::pin::pin!(server.into_future());

    tokio::select! {
        res = &mut server => res?,
        _ = async {
            token.cancelled().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            warn!("grace period elapsed with requests still in flight");
        }
    }

    info!("closing database pool");
    pool.close().await;
    Ok(())
}
