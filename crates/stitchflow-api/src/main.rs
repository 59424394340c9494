//! Stitchflow REST API entry point.
//!
//! Binary name: `stitchflow`
//!
//! Parses CLI arguments, initializes the database and engine wiring, and
//! starts the API server hosting the pipeline-run endpoints and the
//! completion-callback receiver.

mod http;
mod state;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use state::AppState;

#[derive(Parser)]
#[command(name = "stitchflow", about = "Stitchflow pipeline execution engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the REST API server.
    Serve {
        /// Port to listen on.
        #[arg(short, long, default_value_t = 8700)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "info,stitchflow=debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();

    match cli.command {
        Commands::Serve { port } => {
            let state = AppState::init().await?;
            let router = http::router::build_router(state);
            let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
            tracing::info!(%addr, "stitchflow api listening");
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, router).await?;
        }
    }

    Ok(())
}
