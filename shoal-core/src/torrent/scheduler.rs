//! Piece scheduling across a swarm of peers.
//!
//! Builds the work queue from metadata, spawns one worker per peer address,
//! and acts as the single writer to the output sink. Workers hand verified
//! pieces back over a channel; the run ends when every piece is written or
//! when no worker is left to make progress.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::Instrument;

use super::protocol::PeerId;
use super::work_queue::WorkQueue;
use super::worker::{PeerWorker, WorkerReport};
use super::{PieceResult, TorrentError, TorrentMetadata};
use crate::ShoalError;
use crate::config::ShoalConfig;
use crate::storage::PieceSink;

/// Verified pieces buffered between workers and the sink writer.
const RESULT_CHANNEL_CAPACITY: usize = 32;

/// Statistics for a finished download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSummary {
    pub pieces: usize,
    pub bytes_written: u64,
    pub peers_attempted: usize,
    pub peers_failed: usize,
    pub elapsed: Duration,
}

/// Downloads one torrent from a list of peers into a sink.
pub struct PieceScheduler<S: PieceSink> {
    metadata: Arc<TorrentMetadata>,
    config: Arc<ShoalConfig>,
    peer_id: PeerId,
    sink: S,
}

#[derive(Debug, Default)]
struct WorkerTally {
    failed: usize,
}

impl WorkerTally {
    fn record(&mut self, joined: Result<Result<WorkerReport, TorrentError>, tokio::task::JoinError>) {
        match joined {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => self.failed += 1,
            Err(e) => {
                tracing::error!("Peer worker task ended abnormally: {e}");
                self.failed += 1;
            }
        }
    }
}

impl<S: PieceSink> PieceScheduler<S> {
    /// Creates a scheduler with a fresh local peer id for this run.
    pub fn new(metadata: TorrentMetadata, config: ShoalConfig, sink: S) -> Self {
        let peer_id = PeerId::generate(config.download.client_id);
        Self {
            metadata: Arc::new(metadata),
            config: Arc::new(config),
            peer_id,
            sink,
        }
    }

    /// Local peer id sent in every handshake of this run.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn metadata(&self) -> &TorrentMetadata {
        &self.metadata
    }

    /// Downloads every piece, writing each verified piece to the sink once.
    ///
    /// Duplicate addresses are ignored, as are addresses beyond
    /// `max_peer_connections`.
    ///
    /// # Errors
    /// - `TorrentError::InvalidConfiguration` - Download settings are unusable
    /// - `TorrentError::InvalidMetadata` - Metadata is inconsistent
    /// - `TorrentError::InsufficientPeers` - Every peer failed with pieces outstanding
    /// - `TorrentError::Storage` - Sink rejected a write or failed to finalize
    pub async fn run(mut self, peers: Vec<SocketAddr>) -> Result<DownloadSummary, TorrentError> {
        let started = Instant::now();
        if let Err(e) = self.config.validate() {
            let reason = match e {
                ShoalError::Configuration { reason } => reason,
                other => other.to_string(),
            };
            return Err(TorrentError::InvalidConfiguration { reason });
        }
        let work = self.metadata.piece_work()?;
        let total = work.len();

        let peers = self.select_peers(peers);
        if peers.is_empty() {
            tracing::error!("No peers supplied; {total} pieces cannot be downloaded");
            return Err(TorrentError::InsufficientPeers { remaining: total });
        }

        tracing::info!(
            "Downloading {} ({} pieces, {} bytes) from {} peers",
            self.metadata.name,
            total,
            self.metadata.total_length,
            peers.len()
        );

        let queue = Arc::new(WorkQueue::new(work));
        let (results_sender, mut results) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        let mut workers = JoinSet::new();

        for address in &peers {
            let worker = PeerWorker::new(
                *address,
                self.metadata.info_hash,
                self.peer_id,
                Arc::clone(&self.config),
                queue.register_worker(),
                results_sender.clone(),
            );
            let span = tracing::info_span!("peer", address = %address);
            workers.spawn(worker.run().instrument(span));
        }
        // Channel closes once every worker has exited.
        drop(results_sender);

        let mut written = vec![false; total];
        let mut completed = 0usize;
        let mut bytes_written = 0u64;

        let outcome = loop {
            if completed == total {
                break Ok(());
            }

            let Some(PieceResult { index, data }) = results.recv().await else {
                break Err(TorrentError::InsufficientPeers {
                    remaining: total - completed,
                });
            };

            let Some(slot) = written.get_mut(index.as_usize()) else {
                tracing::warn!("Ignoring result for unknown piece {index}");
                continue;
            };
            if *slot {
                tracing::warn!("Ignoring duplicate result for piece {index}");
                continue;
            }

            let offset = self.metadata.piece_offset(index);
            if let Err(e) = self.sink.write_at(offset, &data).await {
                break Err(e.into());
            }
            *slot = true;
            completed += 1;
            bytes_written += data.len() as u64;

            tracing::info!(
                "Piece {index} stored ({completed}/{total}, {:.1}%)",
                completed as f64 * 100.0 / total as f64
            );
        };

        queue.shutdown();
        results.close();
        let tally = self.join_workers(&mut workers).await;

        if let Err(e) = outcome {
            tracing::error!("Download of {} failed: {e}", self.metadata.name);
            return Err(e);
        }

        self.sink.finalize().await?;

        let summary = DownloadSummary {
            pieces: completed,
            bytes_written,
            peers_attempted: peers.len(),
            peers_failed: tally.failed,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            "Download of {} complete: {} bytes in {:?}, {} of {} peers failed",
            self.metadata.name,
            summary.bytes_written,
            summary.elapsed,
            summary.peers_failed,
            summary.peers_attempted
        );
        Ok(summary)
    }

    fn select_peers(&self, peers: Vec<SocketAddr>) -> Vec<SocketAddr> {
        let limit = self.config.network.max_peer_connections;
        let mut seen = HashSet::new();
        let mut selected: Vec<SocketAddr> = peers
            .into_iter()
            .filter(|address| seen.insert(*address))
            .collect();

        if selected.len() > limit {
            tracing::debug!(
                "Using {limit} of {} peers; the rest are ignored for this run",
                selected.len()
            );
            selected.truncate(limit);
        }
        selected
    }

    async fn join_workers(
        &self,
        workers: &mut JoinSet<Result<WorkerReport, TorrentError>>,
    ) -> WorkerTally {
        let grace = self.config.network.shutdown_grace;
        let mut tally = WorkerTally::default();

        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = workers.join_next().await {
                tally.record(joined);
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                "{} peer workers still running after {grace:?}; aborting",
                workers.len()
            );
            workers.abort_all();
            while let Some(joined) = workers.join_next().await {
                if !matches!(&joined, Err(e) if e.is_cancelled()) {
                    tally.record(joined);
                }
            }
        }
        tally
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::storage::MemorySink;
    use crate::torrent::test_data::create_test_torrent;

    #[tokio::test]
    async fn test_empty_peer_list_is_insufficient() {
        let torrent = create_test_torrent(16_384, 16_384 * 4);
        let sink = MemorySink::new(torrent.metadata.total_length);
        let scheduler =
            PieceScheduler::new(torrent.metadata, ShoalConfig::for_testing(), sink.clone());

        let result = scheduler.run(Vec::new()).await;
        assert!(matches!(
            result,
            Err(TorrentError::InsufficientPeers { remaining: 4 })
        ));
        assert!(sink.writes().is_empty());
        assert!(!sink.is_finalized());
    }

    #[tokio::test]
    async fn test_unreachable_peers_are_insufficient() {
        let torrent = create_test_torrent(16_384, 16_384 * 2);
        let sink = MemorySink::new(torrent.metadata.total_length);
        let scheduler =
            PieceScheduler::new(torrent.metadata, ShoalConfig::for_testing(), sink.clone());

        let mut peers = Vec::new();
        for _ in 0..2 {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            peers.push(listener.local_addr().unwrap());
        }
        // Listeners are dropped here, so connections are refused.

        let result = tokio::time::timeout(Duration::from_secs(5), scheduler.run(peers))
            .await
            .unwrap();
        assert!(matches!(
            result,
            Err(TorrentError::InsufficientPeers { remaining: 2 })
        ));
    }

    #[tokio::test]
    async fn test_invalid_metadata_fails_before_connecting() {
        let mut metadata = create_test_torrent(16_384, 16_384 * 2).metadata;
        metadata.piece_hashes.clear();
        let scheduler = PieceScheduler::new(
            metadata,
            ShoalConfig::for_testing(),
            MemorySink::new(16_384 * 2),
        );

        let result = scheduler.run(vec!["127.0.0.1:1".parse().unwrap()]).await;
        assert!(matches!(result, Err(TorrentError::InvalidMetadata { .. })));
    }

    #[tokio::test]
    async fn test_zero_block_size_is_rejected_before_spawning_workers() {
        let torrent = create_test_torrent(16_384, 16_384 * 2);
        let mut config = ShoalConfig::for_testing();
        config.download.block_size = 0;
        let sink = MemorySink::new(torrent.metadata.total_length);
        let scheduler = PieceScheduler::new(torrent.metadata, config, sink.clone());

        let result = scheduler.run(vec!["127.0.0.1:1".parse().unwrap()]).await;
        match result {
            Err(TorrentError::InvalidConfiguration { reason }) => {
                assert!(reason.contains("block size"));
            }
            other => panic!("expected InvalidConfiguration, got {other:?}"),
        }
        assert!(sink.writes().is_empty());
    }

    #[test]
    fn test_select_peers_dedupes_and_caps() {
        let torrent = create_test_torrent(16_384, 16_384);
        let mut config = ShoalConfig::for_testing();
        config.network.max_peer_connections = 2;
        let scheduler = PieceScheduler::new(torrent.metadata, config, MemorySink::new(16_384));

        let a: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:6881".parse().unwrap();
        let c: SocketAddr = "10.0.0.3:6881".parse().unwrap();

        assert_eq!(scheduler.select_peers(vec![a, a, b, a, c]), vec![a, b]);
        assert_eq!(&scheduler.peer_id().as_bytes()[..8], b"-SH0001-");
    }
}
