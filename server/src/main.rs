use std::net::SocketAddr;
use std::sync::Arc;
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use lanchat_server::clock::{Clock, SystemClock};
use lanchat_server::config::{generate_config_template, Cli, Config, StorageBackend};
use lanchat_server::store::{MemoryStore, SqliteStore, Store};
use lanchat_server::{chat, db, routes, state};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Handle --generate-config: print template and exit
    if cli.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load(&cli)?;

    // Initialize tracing/logging
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lanchat_server=info"))
    };
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter()).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter()).init();
    }

    tracing::info!("LAN chat server v{} starting", env!("CARGO_PKG_VERSION"));

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = open_store(&config, clock.clone());

    let (app_state, hub_server) = state::AppState::new(
        store.clone(),
        clock,
        config.chat.clone(),
        config.chat_title.clone(),
        config.trust_forwarded_for,
    );

    // Connection registry task
    tokio::spawn(hub_server.run());

    // Periodic removal of users that have gone quiet
    chat::sweep::spawn_inactive_user_sweep(
        store,
        config.chat.inactive_after(),
        config.chat.sweep_interval(),
    );
    tracing::info!(
        "Inactive user sweep started (every {}s, cutoff {}s)",
        config.chat.sweep_interval_secs,
        config.chat.inactive_user_secs
    );

    // Build router
    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Pick the configured store. A database that cannot be opened is not fatal:
/// the server keeps running on the in-memory store.
fn open_store(config: &Config, clock: Arc<dyn Clock>) -> Store {
    match config.storage {
        StorageBackend::Memory => {
            tracing::info!("Using in-memory storage");
            Arc::new(MemoryStore::new(clock))
        }
        StorageBackend::Sqlite => match db::init_db(&config.data_dir) {
            Ok(pool) => Arc::new(SqliteStore::new(pool, clock)),
            Err(e) => {
                tracing::warn!(
                    "Failed to open database in {}: {}. Falling back to in-memory storage",
                    config.data_dir,
                    e
                );
                Arc::new(MemoryStore::new(clock))
            }
        },
    }
}
