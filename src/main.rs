//! # ctun
//!
//! Cluster tunnel gateway. Each node fronts a copy of the same local
//! service; one **master** accepts user traffic and exposes every connected
//! **slave**'s service through itself over persistent WebSocket tunnels.
//!
//! ## Subcommands
//!
//! - `ctun serve` (default) — run the gateway
//!
//! ## API surface
//!
//! | Method | Path                            | Auth    | Description                      |
//! |--------|---------------------------------|---------|----------------------------------|
//! | GET    | `/api/cluster/status`           | No      | Mode and connected-slave summary |
//! | GET    | `/api/cluster/slaves`           | Yes     | All nodes, local first (master)  |
//! | GET    | `/api/cluster/slaves/{id}`      | Yes     | One node (master)                |
//! | GET    | `/api/cluster/slaves/{id}/health` | Yes   | Node liveness (master)           |
//! | GET    | `/cluster/tunnel`               | In-band | Slave control WebSocket (master) |
//! | GET    | `/ws`, `/shell`                 | Token*  | User WebSockets, `?_slave=<id>`  |
//! | *      | anything else                   | Token*  | Proxied; `X-Target-Slave` forwards |
//!
//! *User tokens are transported to the local service, never validated here.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, router setup, shutdown
//! auth.rs          — Bearer token middleware, constant-time comparison
//! config.rs        — TOML + env-var configuration
//! protocol.rs      — control-connection frame schema
//! forward.rs       — X-Target-Slave routing middleware
//! routes/
//!   cluster.rs     — GET /api/cluster/*
//!   local_proxy.rs — fallback reverse proxy to the local service
//! tunnel/
//!   registry.rs    — connected slaves, eviction on re-registration
//!   correlator.rs  — pending forwarded requests
//!   mux.rs         — tunnel-id -> user WebSocket routing
//!   manager.rs     — control-connection accept, handshake, dispatch
//!   client.rs      — slave side: dial, reconnect, local forwarding
//! ws/
//!   mod.rs         — /ws and /shell upgrades, local bridge or tunnel
//! ```

use std::sync::Arc;

use axum::{middleware, routing::get, Extension, Router};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use ctun::config::DeploymentMode;
use ctun::tunnel::manager::TunnelManager;
use ctun::{auth, forward, routes, tunnel, ws, ApiKey, AppState, Config};

/// Cluster tunnel gateway.
#[derive(Parser)]
#[command(name = "ctun", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => {
            // Backward compat: no subcommand but --config may be passed
            let args: Vec<String> = std::env::args().collect();
            let config_path = args
                .windows(2)
                .find(|w| w[0] == "--config")
                .map(|w| w[1].clone());
            run_server(config_path.as_deref()).await;
        }
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("ctun v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Mode: {}", config.cluster.mode.as_str());
    info!("Local service port: {}", config.server.local_port);
    info!("Listening on {}", config.server.listen);

    if config.auth.api_key == "change-me" {
        warn!("Using default API key — set CTUN_API_KEY or update config");
    }

    let mut state = AppState::new(config);

    let mut slave_settings = None;
    match state.config.cluster.mode {
        DeploymentMode::Master => {
            match state.config.cluster.secret.clone().filter(|s| !s.is_empty()) {
                Some(secret) => {
                    info!("Master mode enabled, accepting slaves at /cluster/tunnel");
                    state.tunnel = Some(Arc::new(TunnelManager::new(
                        secret,
                        state.config.auth_timeout(),
                        state.config.request_timeout(),
                    )));
                }
                None => {
                    warn!("CLUSTER_SECRET not set, starting without cluster mode");
                }
            }
        }
        DeploymentMode::Slave => match state.config.slave_settings() {
            Ok(settings) => {
                info!(
                    slave_id = %settings.slave_id,
                    master = %settings.master_url,
                    "Slave mode enabled"
                );
                slave_settings = Some(settings);
            }
            Err(e) => {
                error!("Invalid slave configuration: {e}");
                std::process::exit(1);
            }
        },
        DeploymentMode::Standalone => {}
    }

    // Build router
    let public_routes =
        Router::new().route("/api/cluster/status", get(routes::cluster::status));

    let admin_routes = Router::new()
        .route("/api/cluster/slaves", get(routes::cluster::list_slaves))
        .route("/api/cluster/slaves/{id}", get(routes::cluster::get_slave))
        .route(
            "/api/cluster/slaves/{id}/health",
            get(routes::cluster::slave_health),
        )
        .layer(middleware::from_fn(auth::require_api_key));

    let user_ws_routes = Router::new()
        .route("/ws", get(ws::ws_upgrade))
        .route("/shell", get(ws::shell_upgrade));

    let mut app = Router::new()
        .merge(public_routes)
        .merge(admin_routes)
        .merge(user_ws_routes);

    if state.tunnel.is_some() {
        app = app.route("/cluster/tunnel", get(tunnel::manager::control_upgrade));
    }

    let app = app
        .fallback(routes::local_proxy::proxy)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            forward::route_to_slave,
        ))
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Gateway ready");

    // Slave mode: keep a control connection to the master alive forever.
    let _client_task = slave_settings.map(|settings| {
        tunnel::client::spawn(settings, state.tunnel_stats.clone(), state.local_http.clone())
    });

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down...");
}
