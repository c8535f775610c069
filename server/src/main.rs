//! # Palaver Chat Server
//!
//! Realtime group and private chat: WebSocket delivery of messages, read
//! receipts, typing indicators, and presence, over a transactional SQLite
//! store.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use palaver_server::app::{App, AppConfig};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server bind address
    #[arg(short = 'a', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Database file path
    #[arg(short = 'd', long, default_value = "palaver.db")]
    database: String,

    /// Secret used to sign session tokens
    #[arg(long, env = "PALAVER_SECRET", default_value = "palaver-dev-secret")]
    secret: String,

    /// Session token lifetime in hours
    #[arg(long, default_value_t = 24)]
    token_ttl_hours: i64,
}

/// How long shutdown waits for connections and in-flight handlers.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    info!("starting palaver chat server");
    info!("version: {}", env!("CARGO_PKG_VERSION"));
    if args.secret == "palaver-dev-secret" {
        warn!("running with the default token secret - only use for development!");
    }

    info!("initializing database: {}", args.database);
    let app = App::new(AppConfig {
        database: args.database,
        secret: args.secret,
        token_ttl_hours: args.token_ttl_hours,
    })
    .await?;

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {addr}");

    axum::serve(listener, app.router.clone())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    if !app.shutdown(SHUTDOWN_DEADLINE).await {
        error!("shutdown deadline exceeded");
        std::process::exit(1);
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("installing ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
