use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use toolgate_broker::{
    default_catalog_dir, Broker, CatalogSearch, CatalogStore, ChildProcessLauncher,
    LifecycleManager, ServerRegistry,
};

mod http;
mod stdio;

/// Broker for tool servers: starts them on demand and serves discovery
/// from a persistent catalog.
#[derive(Debug, Parser)]
#[command(name = "toolgate", version, about)]
struct Cli {
    /// Path to the server configuration file.
    #[arg(long, env = "TOOLGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for the persisted tool catalog.
    #[arg(long, env = "TOOLGATE_CATALOG_DIR")]
    catalog_dir: Option<PathBuf>,

    /// Serve the broker protocol on stdin/stdout (default when --listen is
    /// not given).
    #[arg(long)]
    stdio: bool,

    /// Network listen address, e.g. 127.0.0.1:8650.
    #[arg(long, env = "TOOLGATE_LISTEN")]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(ServerRegistry::default_path);
    let catalog_dir = cli.catalog_dir.unwrap_or_else(default_catalog_dir);
    info!(
        "starting with config {} and catalog {}",
        config_path.display(),
        catalog_dir.display()
    );

    let registry = Arc::new(ServerRegistry::load(&config_path).await?);
    let store = Arc::new(CatalogStore::open(&catalog_dir).await?);
    let search = Arc::new(CatalogSearch::new(Arc::clone(&store)));
    let manager = LifecycleManager::new(
        Arc::clone(&registry),
        Arc::new(ChildProcessLauncher),
        Arc::clone(&store),
        Arc::clone(&search),
    );
    let _reaper = Arc::clone(&manager).spawn_idle_reaper();
    let broker = Arc::new(Broker::new(
        Arc::clone(&manager),
        registry,
        store,
        search,
    ));

    let http_task = cli
        .listen
        .map(|addr| tokio::spawn(http::serve(addr, Arc::clone(&broker))));

    if cli.stdio || cli.listen.is_none() {
        // Runs until stdin closes, the embedding host's shutdown signal.
        stdio::serve(Arc::clone(&broker)).await?;
    } else {
        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");
    }

    // No server subprocess outlives the broker.
    manager.shutdown().await;
    if let Some(task) = http_task {
        task.abort();
    }
    Ok(())
}
