mod cli;
mod commands;
mod config;
mod correlator;
mod events;
mod handlers;
mod protocol;
mod registry;
mod session;

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    cli::{Cli, Commands},
    commands::StaticDirectory,
    config::Config,
    handlers::{
        get_agent, health_check, list_agents, read_file, restart_server, send_console_command,
        server_status, start_server, stop_server, write_file,
    },
    session::{websocket_handler, GatewayState},
};

#[tokio::main]
async fn main() {
    // Default to INFO if RUST_LOG is not set; connect/disconnect lines are
    // the gateway's primary operational record.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    if let Some(Commands::Agent {
        url,
        agent_id,
        token,
        fail_with,
    }) = cli.command
    {
        if let Err(err) = cli::run_debug_agent(url, agent_id, token, fail_with).await {
            error!("debug agent error: {}", err);
            std::process::exit(1);
        }
        return;
    }

    let config = Config::from_env();
    info!("starting Helm agent gateway on port {}", config.port);
    info!(
        "heartbeat every {:?}, command timeout {:?}",
        config.heartbeat_interval, config.command_timeout
    );

    if config.agent_token.is_none() {
        error!("HELM_AGENT_TOKEN is not set; refusing to accept agent connections");
        std::process::exit(1);
    }

    let directory = match &config.server_map {
        Some(raw) => {
            let directory = StaticDirectory::parse(raw);
            info!("loaded {} server routing entries", directory.len());
            Arc::new(directory)
        }
        None => Arc::new(StaticDirectory::empty()),
    };

    let state = match GatewayState::new(config.clone(), directory) {
        Ok(state) => state,
        Err(err) => {
            error!("failed to initialize gateway state: {}", err);
            std::process::exit(1);
        }
    };

    // Live feed: mirror agent events into the log. An embedding panel would
    // subscribe its dashboard bridge here instead.
    let mut feed = state.events.subscribe();
    tokio::spawn(async move {
        while let Some(event) = feed.recv().await {
            info!(agent = %event.agent_id, event = %event.name, "agent event");
        }
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/agents", get(list_agents))
        .route("/agents/:id", get(get_agent))
        .route("/servers/:id/start", post(start_server))
        .route("/servers/:id/stop", post(stop_server))
        .route("/servers/:id/restart", post(restart_server))
        .route("/servers/:id/status", get(server_status))
        .route("/servers/:id/console", post(send_console_command))
        .route("/servers/:id/files", get(read_file).put(write_file))
        .route("/ws/agent", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {}", addr, err);
            std::process::exit(1);
        }
    };

    info!("helm-gate listening on {}", addr);

    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        error!("server error: {}", err);
        std::process::exit(1);
    }
}
