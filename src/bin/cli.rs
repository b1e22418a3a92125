use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use rs_leech::{DownloadConfig, Downloader, Error, TorrentMetadata, announce, generate_peer_id};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Download the single file described by a .torrent
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The .torrent metadata file.
    #[arg(short, long)]
    file: PathBuf,

    /// Where to write the downloaded content.
    #[arg(short, long, required_unless_present = "decode")]
    output: Option<PathBuf>,

    /// Print the decoded metadata and exit without downloading.
    #[arg(short, long)]
    decode: bool,

    /// Seconds allowed to connect to a peer.
    #[arg(long, default_value_t = 3)]
    connect_timeout: u64,

    /// Seconds allowed for a handshake or a whole piece.
    #[arg(long, default_value_t = 30)]
    piece_timeout: u64,

    /// Port reported to the tracker.
    #[arg(short, long, default_value_t = 6881)]
    port: u16,
}

impl Args {
    fn config(&self) -> DownloadConfig {
        DownloadConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout),
            piece_timeout: Duration::from_secs(self.piece_timeout),
            port: self.port,
            ..DownloadConfig::default()
        }
    }
}

async fn run(args: Args) -> Result<(), Error> {
    let torrent = TorrentMetadata::from_file(&args.file)?;
    info!(
        name = %torrent.name,
        length = torrent.length,
        pieces = torrent.piece_count(),
        "loaded torrent"
    );

    if args.decode {
        println!("{torrent}");
        return Ok(());
    }
    let Some(output) = args.output.as_deref() else {
        return Ok(());
    };

    let config = args.config();
    let peer_id = generate_peer_id();
    let peers = announce(&torrent, &peer_id, config.port).await?;

    let downloader = Downloader::new(torrent, peer_id, config);
    let content = downloader.download(peers).await?;

    tokio::fs::write(output, &content).await?;
    info!(
        path = %output.display(),
        bytes = content.len(),
        "download complete"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
