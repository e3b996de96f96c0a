//! Per-peer download worker.
//!
//! A worker owns exactly one [`PeerConnection`]. It pulls piece work from the
//! shared [`WorkQueue`](super::WorkQueue), pipelines block requests, verifies
//! each assembled piece and hands verified bytes to the scheduler. Any fatal
//! error returns the claimed piece to the queue and ends the worker.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use sha1::{Digest, Sha1};
use tokio::sync::futures::Notified;
use tokio::sync::mpsc;

use super::peer_connection::PeerConnection;
use super::protocol::{MessageCodec, PeerId, PeerMessage};
use super::work_queue::{Claim, WorkerSlot};
use super::{InfoHash, PieceResult, PieceWork, TorrentError};
use crate::config::ShoalConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Missing,
    Requested,
    Received,
}

/// Outcome of a worker that exited cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    pub address: SocketAddr,
    pub pieces: usize,
}

/// Downloads pieces from a single peer until the run ends or the peer fails.
pub struct PeerWorker {
    address: SocketAddr,
    info_hash: InfoHash,
    peer_id: PeerId,
    config: Arc<ShoalConfig>,
    slot: WorkerSlot,
    results: mpsc::Sender<PieceResult>,
}

impl PeerWorker {
    pub fn new(
        address: SocketAddr,
        info_hash: InfoHash,
        peer_id: PeerId,
        config: Arc<ShoalConfig>,
        slot: WorkerSlot,
        results: mpsc::Sender<PieceResult>,
    ) -> Self {
        Self {
            address,
            info_hash,
            peer_id,
            config,
            slot,
            results,
        }
    }

    /// Connects to the peer and downloads until the run finishes.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` / `TorrentError::PeerTimeout` - Transport failed
    /// - `TorrentError::ProtocolError` - Peer misbehaved
    /// - `TorrentError::PieceHashMismatch` - Peer served corrupt data
    pub async fn run(self) -> Result<WorkerReport, TorrentError> {
        let connection = PeerConnection::connect(
            self.address,
            self.info_hash,
            self.peer_id,
            &self.config.network,
        )
        .await?;

        self.run_with_connection(connection).await
    }

    /// Downloads over an already established connection.
    ///
    /// # Errors
    /// Same as [`PeerWorker::run`], minus connection establishment.
    pub async fn run_with_connection(
        self,
        mut connection: PeerConnection,
    ) -> Result<WorkerReport, TorrentError> {
        let result = self.download_loop(&mut connection).await;
        connection.close();

        match &result {
            Ok(report) => tracing::debug!(
                "Worker for {} finished after {} pieces",
                self.address,
                report.pieces
            ),
            Err(e) if e.is_piece_fatal() => {
                tracing::warn!("Dropping peer {} after corrupt data: {e}", self.address)
            }
            Err(e) => tracing::warn!("Peer {} failed: {e}", self.address),
        }
        result
    }

    async fn download_loop(
        &self,
        connection: &mut PeerConnection,
    ) -> Result<WorkerReport, TorrentError> {
        connection.announce_interest().await?;

        let queue = self.slot.queue();
        let mut pieces = 0;
        let mut idle_since: Option<Instant> = None;

        loop {
            // Register interest before looking at the queue so a change
            // between the claim and the wait still wakes us.
            let notified = queue.changed();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if queue.is_finished() {
                break;
            }

            if !connection.is_choked() {
                match queue.claim(connection.bitfield()) {
                    Claim::Finished => break,
                    Claim::Piece(work) => {
                        idle_since = None;
                        self.fetch_piece(connection, work).await?;
                        pieces += 1;
                        continue;
                    }
                    Claim::Unavailable => {}
                }
            }

            let since = *idle_since.get_or_insert_with(Instant::now);
            self.wait_idle(connection, notified, since).await?;
        }

        Ok(WorkerReport {
            address: self.address,
            pieces,
        })
    }

    /// Parks until the queue changes or the peer says something useful.
    ///
    /// A read deadline while parked sends a KeepAlive, unless every live
    /// worker is parked with work left, in which case the worker gives up.
    async fn wait_idle(
        &self,
        connection: &mut PeerConnection,
        notified: Pin<&mut Notified<'_>>,
        idle_since: Instant,
    ) -> Result<(), TorrentError> {
        let queue = self.slot.queue();
        let read_timeout = self.config.network.read_timeout;
        let _parked = queue.park();

        tokio::select! {
            () = notified => Ok(()),
            message = connection.receive_message() => match message {
                Ok(PeerMessage::Have { .. } | PeerMessage::Unchoke) => Ok(()),
                Ok(_) if queue.is_stalled() && idle_since.elapsed() >= read_timeout => {
                    Err(TorrentError::PeerTimeout {
                        operation: "idle",
                        after: idle_since.elapsed(),
                    })
                }
                Ok(_) => Ok(()),
                Err(TorrentError::PeerTimeout { .. }) if !queue.is_stalled() => {
                    connection.send_message(PeerMessage::KeepAlive).await
                }
                Err(e) => Err(e),
            },
        }
    }

    async fn fetch_piece(
        &self,
        connection: &mut PeerConnection,
        work: PieceWork,
    ) -> Result<(), TorrentError> {
        let queue = self.slot.queue();
        let index = work.index;

        let verified = match self.download_piece(connection, &work).await {
            Ok(data) => verify_piece(&work, data),
            Err(e) => Err(e),
        };

        let data = match verified {
            Ok(data) => data,
            Err(e) => {
                queue.release(work);
                return Err(e);
            }
        };

        tracing::debug!("Piece {index} verified from {}", self.address);
        if queue.complete(index)
            && self
                .results
                .send(PieceResult { index, data })
                .await
                .is_err()
        {
            tracing::debug!("Scheduler stopped before piece {index} was stored");
        }

        connection.send_have(index).await
    }

    async fn download_piece(
        &self,
        connection: &mut PeerConnection,
        work: &PieceWork,
    ) -> Result<Vec<u8>, TorrentError> {
        let block_size = self.config.download.block_size;
        let pipeline_depth = self.config.download.pipeline_depth;
        let progress_timeout = self.config.network.read_timeout;
        let block_count = work.length.div_ceil(block_size) as usize;

        let mut buffer = vec![0u8; work.length as usize];
        let mut blocks = vec![BlockState::Missing; block_count];
        let mut in_flight = 0usize;
        let mut received = 0usize;
        // Keep-alives reset the read deadline but not this one.
        let mut last_progress = Instant::now();

        tracing::trace!(
            "Downloading piece {} ({} blocks) from {}",
            work.index,
            block_count,
            self.address
        );

        while received < block_count {
            if !connection.is_choked() {
                while in_flight < pipeline_depth {
                    let Some(block) = blocks.iter().position(|b| *b == BlockState::Missing)
                    else {
                        break;
                    };
                    let begin = block as u32 * block_size;
                    let length = block_size.min(work.length - begin);
                    connection.send_request(work.index, begin, length).await?;
                    blocks[block] = BlockState::Requested;
                    in_flight += 1;
                }
            }

            let was_choked = connection.is_choked();
            let message = connection.receive_message().await?;
            match &message {
                PeerMessage::Unchoke if was_choked => last_progress = Instant::now(),
                PeerMessage::Choke => {
                    // Outstanding requests are void; re-issue after Unchoke.
                    for block in blocks.iter_mut() {
                        if *block == BlockState::Requested {
                            *block = BlockState::Missing;
                        }
                    }
                    in_flight = 0;
                }
                PeerMessage::Piece { offset, data, .. } => {
                    MessageCodec::parse_piece(work.index, &mut buffer, &message)?;
                    let block = block_position(work, block_size, *offset, data.len())?;
                    match blocks[block] {
                        BlockState::Received => {}
                        BlockState::Requested => {
                            in_flight -= 1;
                            blocks[block] = BlockState::Received;
                            received += 1;
                            last_progress = Instant::now();
                        }
                        BlockState::Missing => {
                            blocks[block] = BlockState::Received;
                            received += 1;
                            last_progress = Instant::now();
                        }
                    }
                }
                _ => {}
            }

            if received < block_count && last_progress.elapsed() >= progress_timeout {
                return Err(TorrentError::PeerTimeout {
                    operation: "piece",
                    after: last_progress.elapsed(),
                });
            }
        }

        Ok(buffer)
    }
}

/// Maps a received block onto the request grid of `work`.
fn block_position(
    work: &PieceWork,
    block_size: u32,
    offset: u32,
    length: usize,
) -> Result<usize, TorrentError> {
    let expected = block_size.min(work.length.saturating_sub(offset)) as usize;
    if offset % block_size != 0 || length != expected {
        return Err(TorrentError::protocol(format!(
            "Block of {length} bytes at offset {offset} does not match request grid of piece {}",
            work.index
        )));
    }
    Ok((offset / block_size) as usize)
}

fn verify_piece(work: &PieceWork, data: Vec<u8>) -> Result<Vec<u8>, TorrentError> {
    let digest = Sha1::digest(&data);
    if digest.as_slice() == work.hash.as_slice() {
        Ok(data)
    } else {
        Err(TorrentError::PieceHashMismatch { index: work.index })
    }
}
