use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use qset::{
    cli::{Cli, Command, ServeArgs},
    client,
    store::{MemoryStore, StoreServer},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, filter::LevelFilter};

    // Logs go to stderr so `list` output stays pipeable.
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

async fn serve(args: ServeArgs) -> Result<()> {
    let store = match &args.data {
        Some(path) => MemoryStore::open(path)
            .with_context(|| format!("failed to open journal {}", path.display()))?,
        None => {
            warn!("no --data journal given; sets are lost when the server stops");
            MemoryStore::new()
        }
    };
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    let server = StoreServer::new(listener, store);
    info!(addr = %server.local_addr()?, "store server listening");
    server.run_until_ctrl_c().await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::Set(args) => client::set(args).await,
        Command::List(target) => client::list(target).await,
        Command::Watch(args) => client::watch(args).await,
    }
}
