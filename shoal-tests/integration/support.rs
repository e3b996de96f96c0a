//! Shared helpers for integration tests.

use std::net::SocketAddr;
use std::sync::Once;
use std::time::Duration;

use shoal_core::torrent::TorrentMetadata;
use shoal_core::{DownloadSummary, MemorySink, PieceScheduler, ShoalConfig, TorrentError};

/// Upper bound for any single download in these tests.
pub const RUN_DEADLINE: Duration = Duration::from_secs(20);

static TRACING: Once = Once::new();

/// Installs a test-friendly subscriber once; honours `RUST_LOG`.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Downloads into a fresh [`MemorySink`] and returns it with the outcome.
pub async fn download_to_memory(
    metadata: &TorrentMetadata,
    config: ShoalConfig,
    peers: Vec<SocketAddr>,
) -> (Result<DownloadSummary, TorrentError>, MemorySink) {
    init_test_tracing();
    let sink = MemorySink::new(metadata.total_length);
    let scheduler = PieceScheduler::new(metadata.clone(), config, sink.clone());

    let result = tokio::time::timeout(RUN_DEADLINE, scheduler.run(peers))
        .await
        .expect("download did not finish in time");
    (result, sink)
}

/// Asserts the sink holds `content`, written once per piece.
pub fn assert_written_once(sink: &MemorySink, metadata: &TorrentMetadata, content: &[u8]) {
    let mut offsets: Vec<u64> = sink.writes().iter().map(|write| write.offset).collect();
    offsets.sort_unstable();

    let expected: Vec<u64> = (0..metadata.piece_count() as u64)
        .map(|i| i * metadata.piece_length as u64)
        .collect();
    assert_eq!(offsets, expected);
    assert_eq!(sink.bytes_written(), metadata.total_length);
    assert!(sink.contents() == content, "downloaded bytes differ from source");
    assert!(sink.is_finalized());
}
