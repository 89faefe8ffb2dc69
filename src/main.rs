use anyhow::bail;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use zaptorrent::download;
use zaptorrent::metainfo::Torrent;

/// A CLI based torrent client.
#[derive(Debug, Parser)]
#[command(name = "zap")]
struct Args {
    /// Parse and display metadata of the given .torrent file, including file
    /// details and tracker URLs.
    #[arg(long, short, value_name = "path to .torrent file")]
    parse: Option<PathBuf>,

    /// Start downloading files from the given .torrent file using the
    /// BitTorrent protocol.
    #[arg(long, short, value_name = "path to .torrent file")]
    download: Option<PathBuf>,

    /// Directory where the downloaded files should be saved.
    #[arg(long, short, value_name = "download destination", default_value = "Downloads")]
    output: PathBuf,

    /// Enable detailed logging.
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    if let Some(path) = args.download {
        let torrent = Torrent::read(&path).await?;
        if args.verbose {
            println!("{torrent}");
        }
        download::run(Arc::new(torrent), args.output).await?;
    } else if let Some(path) = args.parse {
        let torrent = Torrent::read(&path).await?;
        println!("{torrent}");
    } else {
        bail!("nothing to do: pass --parse or --download");
    }
    Ok(())
}
