//! Storyloop server - HTTP control surface and SSE event stream for runs.

mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use clap::Parser;
use secrecy::SecretString;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use storyloop::io::config::load_config;
use storyloop::io::executor::ProcessExecutor;
use storyloop::io::source_control::GitSourceControl;
use storyloop::io::store::FileRunStore;
use storyloop::orchestrator::Orchestrator;

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "storyloop-server")]
#[command(about = "HTTP control API and event stream for storyloop runs")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3001")]
    port: u16,

    /// Orchestrator config (TOML). Missing file means defaults.
    #[arg(long, default_value = ".storyloop/config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("storyloop_server=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args.config)?;
    info!(state_dir = %config.state_dir.display(), "starting storyloop-server");

    let credential = std::env::var(&config.credential_env)
        .ok()
        .map(SecretString::from);
    if credential.is_none() {
        warn!(env = %config.credential_env, "no agent credential set");
    }
    let orchestrator = Orchestrator::new(
        config.clone(),
        Arc::new(FileRunStore::new(&config.state_dir)),
        Arc::new(ProcessExecutor::new(&config.executor)),
        Arc::new(GitSourceControl::new(&config.source_control)),
        credential,
    );
    let report = orchestrator.recover().await.context("recover persisted runs")?;
    info!(resumed = report.resumed.len(), idle = report.idle.len(), "recovered runs");

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api", routes::api_router())
        .layer(cors)
        .with_state(AppState::new(orchestrator));

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    Ok(())
}
