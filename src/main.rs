use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use portico::config::ProxyConfig;
use portico::server::Server;
use tracing::info;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to a JSON configuration file; flags below are ignored if set.
    #[clap(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to accept Kafka clients on.
    #[clap(short, long, default_value = "127.0.0.1:9192")]
    listen: String,

    /// Upstream bootstrap server.
    #[clap(
        short,
        long,
        value_name = "BOOTSTRAP_SERVER",
        env = "PORTICO_UPSTREAM",
        default_value = "localhost:9092"
    )]
    upstream: String,
}

#[tokio::main]
async fn run(args: Args) -> Result<()> {
    let config = match args.config {
        Some(path) => ProxyConfig::from_file(path)?,
        None => ProxyConfig::new(args.listen, args.upstream),
    };
    info!(upstream = %config.upstream, "starting proxy");
    Server::transparent(config)?.listen().await?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    run(Args::parse())
}
