use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod allocator;
mod client;
mod config;
mod connection;
mod engine;
mod error;
mod hostkeys;
mod keys;
mod protocol;
mod registry;
mod sshd;
mod ws;

use config::{Cli, Config};
use engine::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "tunnel_broker=debug,tower_http=debug"
    } else {
        "tunnel_broker=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_cli(cli)?;

    info!(
        server_port = config.server_port,
        forwarding_user = %config.forwarding_user,
        opened_ports = ?config.opened_ports,
        "preflight checks passed"
    );

    let host_keys = hostkeys::ensure_host_keys(&config.keys_folder).await?;

    let engine = Engine::new(&config, host_keys);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = axum::Router::new()
        .route("/", axum::routing::get(ws::ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(engine);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.server_port));
    info!("listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
