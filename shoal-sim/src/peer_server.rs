//! BitTorrent peer server for simulation
//!
//! Spawns real TCP listeners that speak the peer wire protocol and serve
//! pieces from an in-memory [`TestTorrent`]. Each server can be told to
//! misbehave so download failure paths run against actual sockets.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use shoal_core::torrent::test_data::TestTorrent;
use shoal_core::torrent::{
    Bitfield, HandshakeCodec, InfoHash, MessageCodec, PeerHandshake, PeerId, PeerMessage,
    PieceIndex, TorrentError,
};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// How long a peer stays choked after a mid-transfer choke.
const RECHOKE_PAUSE: Duration = Duration::from_millis(50);

/// Fault injection knobs for one simulated peer.
///
/// The default is an honest seed that holds and serves every piece.
#[derive(Debug, Clone, Default)]
pub struct PeerBehavior {
    /// Pieces left out of the bitfield and never served
    pub missing_pieces: BTreeSet<u32>,
    /// Pieces served with their first byte flipped
    pub corrupt_pieces: BTreeSet<u32>,
    /// Delay between the client's Interested and our Unchoke
    pub unchoke_delay: Duration,
    /// Send Choke after serving this many blocks, then unchoke shortly after
    pub choke_after_blocks: Option<usize>,
    /// Unchoke but silently drop every request
    pub stall: bool,
    /// Reply to the handshake with a different info hash
    pub wrong_info_hash: bool,
    /// Announce missing pieces with Have after this delay and serve them afterwards
    pub announce_missing_after: Option<Duration>,
    /// Send KeepAlive at this interval regardless of anything else
    pub keep_alive_interval: Option<Duration>,
}

impl PeerBehavior {
    pub fn honest() -> Self {
        Self::default()
    }

    pub fn corrupt(mut self, piece: u32) -> Self {
        self.corrupt_pieces.insert(piece);
        self
    }

    pub fn missing(mut self, pieces: impl IntoIterator<Item = u32>) -> Self {
        self.missing_pieces.extend(pieces);
        self
    }

    pub fn unchoke_after(mut self, delay: Duration) -> Self {
        self.unchoke_delay = delay;
        self
    }

    pub fn choke_after(mut self, blocks: usize) -> Self {
        self.choke_after_blocks = Some(blocks);
        self
    }

    pub fn stalled(mut self) -> Self {
        self.stall = true;
        self
    }

    pub fn wrong_info_hash(mut self) -> Self {
        self.wrong_info_hash = true;
        self
    }

    pub fn announce_missing_after(mut self, delay: Duration) -> Self {
        self.announce_missing_after = Some(delay);
        self
    }

    pub fn keep_alive_every(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = Some(interval);
        self
    }
}

/// Errors raised while serving a simulated connection.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("Failed to bind simulated peer on {address}: {source}")]
    Bind {
        address: SocketAddr,
        source: std::io::Error,
    },

    #[error("Client asked for a different torrent ({info_hash})")]
    UnknownTorrent { info_hash: InfoHash },

    #[error("Wire protocol error: {0}")]
    Protocol(#[from] TorrentError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Counters shared between a peer's connections and its handle.
#[derive(Debug, Default)]
pub struct PeerStats {
    connections: AtomicUsize,
    blocks_served: AtomicUsize,
    corrupt_blocks_served: AtomicUsize,
}

impl PeerStats {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn blocks_served(&self) -> usize {
        self.blocks_served.load(Ordering::Relaxed)
    }

    pub fn corrupt_blocks_served(&self) -> usize {
        self.corrupt_blocks_served.load(Ordering::Relaxed)
    }
}

/// Peer that serves a single torrent.
#[derive(Debug, Clone)]
pub struct SimulatedPeer {
    torrent: Arc<TestTorrent>,
    behavior: PeerBehavior,
    stats: Arc<PeerStats>,
}

/// Running peer server; the listener stops when the handle is dropped.
#[derive(Debug)]
pub struct SimulatedPeerHandle {
    address: SocketAddr,
    stats: Arc<PeerStats>,
    task: JoinHandle<()>,
}

impl SimulatedPeerHandle {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn stats(&self) -> &PeerStats {
        &self.stats
    }

    /// Stops accepting new connections.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for SimulatedPeerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl SimulatedPeer {
    pub fn new(torrent: Arc<TestTorrent>, behavior: PeerBehavior) -> Self {
        Self {
            torrent,
            behavior,
            stats: Arc::new(PeerStats::default()),
        }
    }

    /// Binds `listen_address` and serves connections in a background task.
    ///
    /// Use port 0 to let the OS pick a free port; the chosen address is
    /// available from the returned handle.
    ///
    /// # Errors
    ///
    /// - `SimError::Bind` - If the listener could not be bound
    pub async fn spawn(self, listen_address: SocketAddr) -> Result<SimulatedPeerHandle, SimError> {
        let listener = TcpListener::bind(listen_address)
            .await
            .map_err(|source| SimError::Bind {
                address: listen_address,
                source,
            })?;
        let address = listener.local_addr()?;
        let stats = Arc::clone(&self.stats);

        tracing::debug!(
            "Simulated peer for {} listening on {address}",
            self.torrent.metadata.info_hash
        );

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let peer = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = peer.handle_connection(stream, peer_addr).await {
                                tracing::debug!("Connection from {peer_addr} ended: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept connection: {e}");
                        break;
                    }
                }
            }
        });

        Ok(SimulatedPeerHandle {
            address,
            stats,
            task,
        })
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), SimError> {
        self.stats.connections.fetch_add(1, Ordering::Relaxed);
        let (mut reader, mut writer) = stream.into_split();
        let info_hash = self.torrent.metadata.info_hash;

        let handshake = HandshakeCodec::read_handshake(&mut reader).await?;
        if handshake.info_hash != info_hash {
            return Err(SimError::UnknownTorrent {
                info_hash: handshake.info_hash,
            });
        }

        let reply_hash = if self.behavior.wrong_info_hash {
            InfoHash::new([0xEE; 20])
        } else {
            info_hash
        };
        let reply = PeerHandshake::new(reply_hash, PeerId::generate("-SS0001-"));
        writer
            .write_all(&HandshakeCodec::serialize_handshake(&reply))
            .await?;
        if self.behavior.wrong_info_hash {
            return Ok(());
        }

        let piece_count = self.torrent.metadata.piece_count();
        let mut available = Bitfield::with_piece_count(piece_count);
        for index in 0..piece_count {
            if !self.behavior.missing_pieces.contains(&(index as u32)) {
                available.set_piece(index);
            }
        }
        send(
            &mut writer,
            &PeerMessage::Bitfield {
                bitfield: Bytes::copy_from_slice(available.as_bytes()),
            },
        )
        .await?;
        tracing::debug!("Handshake completed with {peer_addr}");

        let (inbox_sender, mut inbox) = mpsc::channel(64);
        let reader_task = tokio::spawn(async move {
            loop {
                let message = MessageCodec::read_message(&mut reader).await;
                let failed = message.is_err();
                if inbox_sender.send(message).await.is_err() || failed {
                    break;
                }
            }
        });

        let result = self
            .serve(&mut writer, &mut inbox, available, peer_addr)
            .await;
        reader_task.abort();
        result
    }

    async fn serve(
        &self,
        writer: &mut OwnedWriteHalf,
        inbox: &mut mpsc::Receiver<Result<PeerMessage, TorrentError>>,
        mut available: Bitfield,
        peer_addr: SocketAddr,
    ) -> Result<(), SimError> {
        let mut choked = true;
        let mut served_here = 0usize;
        let mut rechoked = false;
        let mut unchoke_at: Option<Instant> = None;
        let mut announce_at = self
            .behavior
            .announce_missing_after
            .map(|delay| Instant::now() + delay);
        let keep_alive_interval = self.behavior.keep_alive_interval;
        let mut keep_alive_at = keep_alive_interval.map(|interval| Instant::now() + interval);

        loop {
            let next_timer = [unchoke_at, announce_at, keep_alive_at]
                .into_iter()
                .flatten()
                .min();

            tokio::select! {
                message = inbox.recv() => {
                    let message = match message {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => {
                            tracing::debug!("Peer {peer_addr} went away: {e}");
                            return Ok(());
                        }
                        None => return Ok(()),
                    };

                    match message {
                        PeerMessage::Interested if choked && unchoke_at.is_none() => {
                            unchoke_at = Some(Instant::now() + self.behavior.unchoke_delay);
                        }
                        PeerMessage::Request { piece_index, offset, length } => {
                            if choked || self.behavior.stall {
                                continue;
                            }
                            if !self.serve_block(writer, &available, piece_index, offset, length).await? {
                                continue;
                            }
                            served_here += 1;

                            if !rechoked && self.behavior.choke_after_blocks == Some(served_here) {
                                rechoked = true;
                                choked = true;
                                send(writer, &PeerMessage::Choke).await?;
                                unchoke_at = Some(Instant::now() + RECHOKE_PAUSE);
                                tracing::debug!("Choked {peer_addr} after {served_here} blocks");
                            }
                        }
                        other => tracing::trace!("Ignoring {other} from {peer_addr}"),
                    }
                }
                () = sleep_until_next(next_timer), if next_timer.is_some() => {
                    let now = Instant::now();
                    if unchoke_at.is_some_and(|at| at <= now) {
                        unchoke_at = None;
                        choked = false;
                        send(writer, &PeerMessage::Unchoke).await?;
                    }
                    if announce_at.is_some_and(|at| at <= now) {
                        announce_at = None;
                        for &index in &self.behavior.missing_pieces {
                            available.set_piece(index as usize);
                            send(writer, &MessageCodec::have(PieceIndex::new(index))).await?;
                        }
                    }
                    if let Some(interval) = keep_alive_interval
                        && keep_alive_at.is_some_and(|at| at <= now)
                    {
                        keep_alive_at = Some(now + interval);
                        send(writer, &PeerMessage::KeepAlive).await?;
                    }
                }
            }
        }
    }

    /// Sends one requested block. Returns false if the request was dropped.
    async fn serve_block(
        &self,
        writer: &mut OwnedWriteHalf,
        available: &Bitfield,
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    ) -> Result<bool, SimError> {
        if !available.has_piece(piece_index.as_usize()) {
            tracing::debug!("Dropping request for piece {piece_index} we do not have");
            return Ok(false);
        }

        let piece = self.torrent.piece_data(piece_index);
        let start = offset as usize;
        let end = start.saturating_add(length as usize).min(piece.len());
        if start >= end {
            tracing::warn!(
                "Invalid request: offset {start} length {length} in piece of {}",
                piece.len()
            );
            return Ok(false);
        }

        let mut block = piece[start..end].to_vec();
        if self.behavior.corrupt_pieces.contains(&piece_index.as_u32()) {
            block[0] ^= 0xFF;
            self.stats
                .corrupt_blocks_served
                .fetch_add(1, Ordering::Relaxed);
        }

        send(
            writer,
            &PeerMessage::Piece {
                piece_index,
                offset,
                data: Bytes::from(block),
            },
        )
        .await?;
        self.stats.blocks_served.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }
}

async fn send(writer: &mut OwnedWriteHalf, message: &PeerMessage) -> Result<(), SimError> {
    writer
        .write_all(&MessageCodec::serialize_message(message))
        .await?;
    Ok(())
}

async fn sleep_until_next(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(deadline).await;
    }
}
