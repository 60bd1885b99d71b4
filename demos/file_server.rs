use clap::Parser;
use clap_derive::Parser;
use filexfer::config::ServerConfig;
use filexfer::server::Server;
use tracing::Level;

#[derive(Parser)]
struct Args {
    /// address to listen on, e.g. 0.0.0.0:9000
    bind_address: String,
    /// directory for uploaded files and the source of downloads
    storage_dir: String,

    #[clap(long, default_value_t = 1400)]
    chunk_size: usize,

    #[clap(long, default_value_t = 8)]
    window_size: u32,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut config = ServerConfig::new(args.bind_address.parse()?, args.storage_dir);
    config.transfer.chunk_size = args.chunk_size;
    config.transfer.window_size = args.window_size;

    let server = Server::bind(config).await?;
    server.run().await;
    Ok(())
}
