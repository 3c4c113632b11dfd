use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use chch::{
    channels::load_channel_names,
    cli::{Cli, Command},
    client,
    registry::Registry,
    server::Server,
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
        Command::Server(args) => {
            let names = load_channel_names(&args.channels)?;
            info!(count = names.len(), "loaded channels");
            let listener = TcpListener::bind(("0.0.0.0", args.port))
                .await
                .with_context(|| format!("failed to bind port {}", args.port))?;
            let server = Server::new(listener, Registry::new(names));
            let addr = server.local_addr()?;
            info!("server listening on {}", addr);
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
