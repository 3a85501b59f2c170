use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use message_relay::{
    cli::{Cli, Command},
    client, dashboard,
    server::Server,
    store::MemoryStore,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let config = args.resolve().context("invalid configuration")?;
            let store = Arc::new(MemoryStore::new());
            let server = Server::bind(&config, store.clone()).await?;
            let addr = server.local_addr()?;
            info!("relay listening on {}", addr);

            tokio::spawn(dashboard::run(store, server.subscribe()));
            server.run_until_ctrl_c().await;
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
