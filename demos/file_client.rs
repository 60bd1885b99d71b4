use std::path::PathBuf;
use clap::Parser;
use clap_derive::{Parser, Subcommand};
use filexfer::client::Client;
use filexfer::config::ClientConfig;
use filexfer::error::TransferError;
use tracing::{error, info, Level};

#[derive(Parser)]
struct Args {
    server_address: String,

    #[clap(subcommand)]
    command: ClientCommand,

    #[clap(long, default_value_t = 1400)]
    chunk_size: usize,

    #[clap(long, default_value_t = 8)]
    window_size: u32,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[derive(Subcommand)]
enum ClientCommand {
    Echo { text: Vec<String> },
    Time,
    Upload { local: PathBuf, remote: Option<String> },
    Download { remote: String, local: Option<PathBuf> },
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

    let mut config = ClientConfig::new(args.server_address.parse()?);
    config.transfer.chunk_size = args.chunk_size;
    config.transfer.window_size = args.window_size;
    let client = Client::new(config)?;

    let result = match args.command {
        ClientCommand::Echo { text } => {
            println!("{}", client.echo(&text.join(" ")).await?);
            return Ok(());
        }
        ClientCommand::Time => {
            println!("{}", client.time().await?);
            return Ok(());
        }
        ClientCommand::Upload { local, remote } => {
            let remote = match remote {
                Some(remote) => remote,
                None => match local.file_name() {
                    Some(name) => name.to_string_lossy().into_owned(),
                    None => anyhow::bail!("{:?} has no file name", local),
                },
            };
            client.upload(&local, &remote).await
        }
        ClientCommand::Download { remote, local } => {
            let local = local.unwrap_or_else(|| PathBuf::from(&remote));
            client.download(&remote, &local).await
        }
    };

    match result {
        Ok(report) => {
            info!("{}", report);
            Ok(())
        }
        Err(e) => {
            if let Some(transfer_error) = e.downcast_ref::<TransferError>() {
                if transfer_error.is_transient() {
                    error!("transfer interrupted, run the same command again to resume");
                }
            }
            Err(e)
        }
    }
}
