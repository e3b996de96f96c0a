//! CLI command implementations

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::Subcommand;
use shoal_core::torrent::test_data::create_test_torrent;
use shoal_core::torrent::{PieceIndex, parse_compact_peers};
use shoal_core::{
    DownloadSummary, FileSink, PieceScheduler, ShoalConfig, ShoalError, TorrentError,
    TorrentMetadata,
};
use shoal_sim::{PeerBehavior, SimulatedSwarm};
use tokio::fs;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Download a torrent from the given peers
    Fetch {
        /// Path to the JSON metadata document
        #[arg(short, long)]
        metadata: PathBuf,
        /// Peer address (repeatable)
        #[arg(short, long = "peer")]
        peers: Vec<SocketAddr>,
        /// File holding a compact peer list (6 bytes per peer)
        #[arg(long)]
        peers_file: Option<PathBuf>,
        /// Where to write the downloaded file
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Show the contents of a metadata document
    Inspect {
        /// Path to the JSON metadata document
        #[arg(short, long)]
        metadata: PathBuf,
    },
    /// Download generated data from simulated peers on localhost
    Simulate {
        /// Number of pieces to generate
        #[arg(long, default_value = "16")]
        pieces: u32,
        /// Bytes per piece
        #[arg(long, default_value = "65536")]
        piece_length: u32,
        /// Number of simulated peers
        #[arg(short, long, default_value = "4")]
        peers: usize,
        /// Make the first peer corrupt this piece
        #[arg(long)]
        corrupt_piece: Option<u32>,
        /// Where to write the downloaded file
        #[arg(short, long)]
        output: PathBuf,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Fetch {
            metadata,
            peers,
            peers_file,
            output,
        } => fetch(&metadata, peers, peers_file.as_deref(), &output).await,
        Commands::Inspect { metadata } => inspect(&metadata).await,
        Commands::Simulate {
            pieces,
            piece_length,
            peers,
            corrupt_piece,
            output,
        } => simulate(pieces, piece_length, peers, corrupt_piece, &output).await,
    }
}

/// Download a torrent described by a metadata document
///
/// # Errors
/// - Metadata unreadable or invalid
/// - No peers given, or every peer failed
/// - Output file could not be written
pub async fn fetch(
    metadata_path: &Path,
    mut peers: Vec<SocketAddr>,
    peers_file: Option<&Path>,
    output: &Path,
) -> anyhow::Result<()> {
    let metadata = load_metadata(metadata_path).await?;

    if let Some(path) = peers_file {
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("Failed to read peer list {}", path.display()))?;
        peers.extend(parse_compact_peers(&bytes).map_err(ShoalError::from)?);
    }

    if peers.is_empty() {
        bail!("No peers given; use --peer or --peers-file");
    }
    tracing::debug!("Peer candidates: {peers:?}");

    let config = ShoalConfig::from_env();
    config.validate()?;

    println!(
        "Downloading {} ({} pieces) from {} peers",
        metadata.name,
        metadata.piece_count(),
        peers.len()
    );
    let summary = download(metadata, config, peers, output).await?;
    print_summary(&summary, output);
    Ok(())
}

/// Print a metadata document in human-readable form
///
/// # Errors
/// - Metadata unreadable or invalid
pub async fn inspect(metadata_path: &Path) -> anyhow::Result<()> {
    let metadata = load_metadata(metadata_path).await?;
    let last_piece = PieceIndex::new(metadata.piece_count().saturating_sub(1) as u32);

    println!("Torrent: {}", metadata.name);
    println!("{:-<60}", "");
    println!("  Info hash:    {}", metadata.info_hash);
    if !metadata.announce.is_empty() {
        println!("  Announce:     {}", metadata.announce);
    }
    println!("  Total size:   {} bytes", metadata.total_length);
    println!("  Piece length: {} bytes", metadata.piece_length);
    println!("  Pieces:       {}", metadata.piece_count());
    println!("  Last piece:   {} bytes", metadata.piece_size(last_piece));
    Ok(())
}

/// Run a download against a local simulated swarm and verify the result
///
/// # Errors
/// - Simulated peers could not be started
/// - Download failed or produced data that does not match the source
pub async fn simulate(
    pieces: u32,
    piece_length: u32,
    peer_count: usize,
    corrupt_piece: Option<u32>,
    output: &Path,
) -> anyhow::Result<()> {
    if pieces == 0 || piece_length == 0 || peer_count == 0 {
        bail!("pieces, piece length and peers must all be at least 1");
    }

    let torrent = create_test_torrent(piece_length, pieces as u64 * piece_length as u64);
    let mut behaviors = vec![PeerBehavior::honest(); peer_count];
    if let Some(piece) = corrupt_piece {
        if piece >= pieces {
            bail!("--corrupt-piece {piece} is outside 0..{pieces}");
        }
        behaviors[0] = PeerBehavior::honest().corrupt(piece);
    }

    let swarm = SimulatedSwarm::spawn(torrent, behaviors)
        .await
        .context("Failed to start simulated peers")?;
    println!(
        "Simulating {} peers serving {} pieces of {} bytes",
        peer_count, pieces, piece_length
    );

    let config = ShoalConfig::from_env();
    config.validate()?;
    let metadata = swarm.torrent().metadata.clone();
    let summary = download(metadata, config, swarm.addresses(), output).await?;

    let written = fs::read(output)
        .await
        .with_context(|| format!("Failed to read back {}", output.display()))?;
    if written != swarm.torrent().content {
        bail!("Downloaded data does not match the simulated torrent");
    }

    print_summary(&summary, output);
    println!("  Verified against source ({} blocks served)", swarm.blocks_served());
    Ok(())
}

async fn load_metadata(path: &Path) -> anyhow::Result<TorrentMetadata> {
    let json = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read metadata {}", path.display()))?;
    Ok(TorrentMetadata::from_json(&json).map_err(ShoalError::from)?)
}

async fn download(
    metadata: TorrentMetadata,
    config: ShoalConfig,
    peers: Vec<SocketAddr>,
    output: &Path,
) -> anyhow::Result<DownloadSummary> {
    let sink = FileSink::create(output, metadata.total_length)
        .await
        .map_err(ShoalError::from)
        .with_context(|| format!("Failed to create {}", output.display()))?;

    match PieceScheduler::new(metadata, config, sink).run(peers).await {
        Ok(summary) => Ok(summary),
        Err(e @ TorrentError::InsufficientPeers { .. }) => {
            bail!(ShoalError::from(e).user_message())
        }
        Err(e) => Err(ShoalError::from(e).into()),
    }
}

fn print_summary(summary: &DownloadSummary, output: &Path) {
    println!("Download complete: {}", output.display());
    println!("  Pieces:       {}", summary.pieces);
    println!("  Bytes:        {}", summary.bytes_written);
    println!(
        "  Peers:        {} used, {} failed",
        summary.peers_attempted, summary.peers_failed
    );
    println!("  Elapsed:      {:.2?}", summary.elapsed);
}
