use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use live_vote::{
    cli::{Cli, Command},
    config::ServerConfig,
    server::Server,
    simulate,
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
            let config = ServerConfig::from(args);
            let listener = TcpListener::bind(config.listen)
                .await
                .with_context(|| format!("failed to bind {}", config.listen))?;
            let server = Server::new(listener, Arc::new(MemoryStore::new()), &config);
            let addr = server.local_addr()?;
            info!("live-vote listening on {}", addr);
            info!(
                max_attempts = config.retry.max_attempts,
                backoff = ?config.retry.backoff,
                "vote retry policy"
            );
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Simulate(args) => {
            let report = simulate::run(args).await?;
            println!(
                "counted={} contention={} failed={} highest_count={}",
                report.counted,
                report.contention,
                report.failed,
                report
                    .highest_count
                    .map_or_else(|| "-".to_string(), |count| count.to_string())
            );
        }
    }

    Ok(())
}
