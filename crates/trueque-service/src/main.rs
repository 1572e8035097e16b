use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use trueque_adapters::BINANCE_P2P_ENDPOINT;
use trueque_service::{build_router, ServiceConfig, ServiceState};
use trueque_storage::StorageConfig;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "truequed", version, about = "Trueque marketplace REST service")]
struct Cli {
    /// Socket address to bind, e.g. 0.0.0.0:8080
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,
    /// Persistence backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "TRUEQUE_STORAGE")]
    storage: StorageMode,
    /// PostgreSQL url for marketplace persistence.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 16, env = "TRUEQUE_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Directory where uploaded media lands.
    #[arg(long, default_value = "./media", env = "MEDIA_ROOT")]
    media_root: PathBuf,
    /// Public URL prefix that serves the media directory.
    #[arg(long, default_value = "/media", env = "MEDIA_BASE_URL")]
    media_base_url: String,
    /// Binance P2P advert search endpoint for the USDT/BOB quote.
    #[arg(long, default_value = BINANCE_P2P_ENDPOINT, env = "P2P_ENDPOINT")]
    p2p_endpoint: String,
}

fn resolve_storage(cli: &Cli) -> anyhow::Result<StorageConfig> {
    let storage = match cli.storage {
        StorageMode::Memory => StorageConfig::Memory,
        StorageMode::Postgres => {
            let database_url = cli.database_url.clone().ok_or_else(|| {
                anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL")
            })?;
            StorageConfig::postgres(database_url, cli.pg_max_connections)
        }
        StorageMode::Auto => {
            if let Some(database_url) = cli.database_url.clone() {
                StorageConfig::postgres(database_url, cli.pg_max_connections)
            } else {
                StorageConfig::Memory
            }
        }
    };

    Ok(storage)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| {
                "truequed=info,trueque_service=info,info".to_string()
            }),
        )
        .init();

    let cli = Cli::parse();
    let storage = resolve_storage(&cli)?;
    let config = ServiceConfig {
        storage,
        media_root: cli.media_root,
        media_base_url: cli.media_base_url,
        p2p_endpoint: cli.p2p_endpoint,
    };
    info!(backend = config.storage.label(), "starting trueque-service");
    let state = ServiceState::bootstrap(config).await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("trueque-service listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
