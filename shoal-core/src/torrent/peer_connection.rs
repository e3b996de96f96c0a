//! Per-peer connection state machine.
//!
//! A connection walks Connecting -> Handshaking -> ExchangingBitfield ->
//! Active and ends in Closed. Every blocking step runs under a deadline from
//! [`NetworkConfig`]; any failure closes the connection for good.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::bitfield::Bitfield;
use super::protocol::{HandshakeCodec, MessageCodec, PeerHandshake, PeerId, PeerMessage};
use super::{InfoHash, PieceIndex, TorrentError};
use crate::config::NetworkConfig;

/// Messages buffered between the reader task and the owning worker.
const INBOX_CAPACITY: usize = 64;

type PeerWriter = Box<dyn AsyncWrite + Send + Unpin>;
type InboxItem = Result<PeerMessage, TorrentError>;

/// Lifecycle of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    ExchangingBitfield,
    Active,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::ExchangingBitfield => "exchanging bitfield",
            ConnectionState::Active => "active",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Logs a failed setup step and hands the error back.
fn setup_failed(address: SocketAddr, state: ConnectionState, error: TorrentError) -> TorrentError {
    tracing::debug!("Peer {address} failed while {state}: {error}");
    error
}

/// An established connection to one peer.
///
/// Owned exclusively by a single worker. The read half lives in a reader
/// task that decodes frames into a channel, so waiting for the next message
/// can be raced against other events without tearing a frame.
pub struct PeerConnection {
    address: SocketAddr,
    state: ConnectionState,
    writer: PeerWriter,
    inbox: mpsc::Receiver<InboxItem>,
    reader_task: JoinHandle<()>,
    choked: bool,
    bitfield: Bitfield,
    remote_peer_id: PeerId,
    read_timeout: Duration,
}

impl PeerConnection {
    /// Dials the peer, then performs handshake and bitfield exchange.
    ///
    /// # Errors
    /// - `TorrentError::PeerTimeout` - Connect, handshake, or bitfield deadline expired
    /// - `TorrentError::PeerConnectionError` - TCP connection refused or reset
    /// - `TorrentError::ProtocolError` - Handshake or bitfield invalid
    pub async fn connect(
        address: SocketAddr,
        info_hash: InfoHash,
        peer_id: PeerId,
        network: &NetworkConfig,
    ) -> Result<Self, TorrentError> {
        let state = ConnectionState::Connecting;
        tracing::trace!("Peer {address}: {state}");

        let stream =
            match tokio::time::timeout(network.connect_timeout, TcpStream::connect(address)).await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    let error = TorrentError::PeerConnectionError {
                        reason: format!("Failed to connect to {address}: {e}"),
                    };
                    return Err(setup_failed(address, state, error));
                }
                Err(_) => {
                    let error = TorrentError::PeerTimeout {
                        operation: "connect",
                        after: network.connect_timeout,
                    };
                    return Err(setup_failed(address, state, error));
                }
            };

        Self::establish(address, stream, info_hash, peer_id, network).await
    }

    /// Runs the handshake and bitfield exchange over an already open stream.
    ///
    /// # Errors
    /// - `TorrentError::PeerTimeout` - Handshake or bitfield deadline expired
    /// - `TorrentError::PeerConnectionError` - Stream failed
    /// - `TorrentError::ProtocolError` - Info hash mismatch or first message not a Bitfield
    pub async fn establish<S>(
        address: SocketAddr,
        mut stream: S,
        info_hash: InfoHash,
        peer_id: PeerId,
        network: &NetworkConfig,
    ) -> Result<Self, TorrentError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut state = ConnectionState::Handshaking;
        tracing::trace!("Peer {address}: {state}");
        let handshake = PeerHandshake::new(info_hash, peer_id);
        let reply = HandshakeCodec::exchange(&mut stream, &handshake, network.handshake_timeout)
            .await
            .map_err(|e| setup_failed(address, state, e))?;

        state = ConnectionState::ExchangingBitfield;
        tracing::trace!("Peer {address}: {state}");
        let bitfield = Self::receive_bitfield(&mut stream, network.bitfield_timeout)
            .await
            .map_err(|e| setup_failed(address, state, e))?;
        tracing::debug!(
            "Peer {address} connected, advertising {} pieces",
            bitfield.count()
        );

        let (read_half, write_half) = tokio::io::split(stream);
        let (inbox_sender, inbox) = mpsc::channel(INBOX_CAPACITY);
        let reader_task = tokio::spawn(forward_messages(read_half, inbox_sender));

        Ok(Self {
            address,
            state: ConnectionState::Active,
            writer: Box::new(write_half),
            inbox,
            reader_task,
            choked: true,
            bitfield,
            remote_peer_id: reply.peer_id,
            read_timeout: network.read_timeout,
        })
    }

    async fn receive_bitfield<S>(stream: &mut S, deadline: Duration) -> Result<Bitfield, TorrentError>
    where
        S: AsyncRead + Unpin,
    {
        let message = tokio::time::timeout(deadline, MessageCodec::read_message(stream))
            .await
            .map_err(|_| TorrentError::PeerTimeout {
                operation: "bitfield",
                after: deadline,
            })??;

        match message {
            PeerMessage::Bitfield { bitfield } => Ok(Bitfield::from_bytes(bitfield.to_vec())),
            other => Err(TorrentError::protocol(format!(
                "Expected Bitfield after handshake, got {}",
                other.name()
            ))),
        }
    }

    /// Returns the socket address of the connected peer.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// True until the peer sends Unchoke.
    pub fn is_choked(&self) -> bool {
        self.choked
    }

    /// Locally tracked copy of the peer's availability.
    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    /// Peer id announced in the peer's handshake.
    pub fn remote_peer_id(&self) -> PeerId {
        self.remote_peer_id
    }

    /// Sends one message to the peer.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Connection closed or write failed
    /// - `TorrentError::PeerTimeout` - Peer stopped draining its socket
    pub async fn send_message(&mut self, message: PeerMessage) -> Result<(), TorrentError> {
        if self.state == ConnectionState::Closed {
            return Err(TorrentError::PeerConnectionError {
                reason: format!("Connection to {} is closed", self.address),
            });
        }

        tracing::trace!("-> {}: {message}", self.address);
        let frame = MessageCodec::serialize_message(&message);
        let result = match tokio::time::timeout(self.read_timeout, self.writer.write_all(&frame))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TorrentError::PeerConnectionError {
                reason: format!("Failed to send {} to {}: {e}", message.name(), self.address),
            }),
            Err(_) => Err(TorrentError::PeerTimeout {
                operation: "write",
                after: self.read_timeout,
            }),
        };
        result.map_err(|e| self.fail(e))
    }

    /// Announces that we will serve nothing but want data.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Write failed
    pub async fn announce_interest(&mut self) -> Result<(), TorrentError> {
        self.send_message(PeerMessage::Unchoke).await?;
        self.send_message(PeerMessage::Interested).await
    }

    /// Requests a block of a piece.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Write failed
    pub async fn send_request(
        &mut self,
        index: PieceIndex,
        begin: u32,
        length: u32,
    ) -> Result<(), TorrentError> {
        self.send_message(MessageCodec::request(index, begin, length))
            .await
    }

    /// Tells the peer we now hold `index`.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Write failed
    pub async fn send_have(&mut self, index: PieceIndex) -> Result<(), TorrentError> {
        self.send_message(MessageCodec::have(index)).await
    }

    /// Waits for the next message under the per-read deadline.
    ///
    /// Choke, Unchoke and Have update the connection state before the message
    /// is returned. Cancelling this future never loses part of a frame.
    ///
    /// # Errors
    /// - `TorrentError::PeerTimeout` - Nothing arrived before the deadline
    /// - `TorrentError::PeerConnectionError` - Peer hung up or read failed
    /// - `TorrentError::ProtocolError` - Malformed frame or unexpected Bitfield
    pub async fn receive_message(&mut self) -> Result<PeerMessage, TorrentError> {
        if self.state == ConnectionState::Closed {
            return Err(TorrentError::PeerConnectionError {
                reason: format!("Connection to {} is closed", self.address),
            });
        }

        let received = match tokio::time::timeout(self.read_timeout, self.inbox.recv()).await {
            Ok(Some(received)) => received,
            Ok(None) => Err(TorrentError::PeerConnectionError {
                reason: format!("Reader for {} stopped", self.address),
            }),
            // Deadline expiry leaves the connection usable; the caller decides
            // whether an idle peer is fatal.
            Err(_) => {
                return Err(TorrentError::PeerTimeout {
                    operation: "read",
                    after: self.read_timeout,
                });
            }
        };

        match received.and_then(|message| self.apply(message)) {
            Ok(message) => Ok(message),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn apply(&mut self, message: PeerMessage) -> Result<PeerMessage, TorrentError> {
        tracing::trace!("<- {}: {message}", self.address);

        match &message {
            PeerMessage::Choke => self.choked = true,
            PeerMessage::Unchoke => self.choked = false,
            PeerMessage::Have { .. } => {
                let index = MessageCodec::parse_have(&message)?;
                self.bitfield.set_piece(index.as_usize());
            }
            PeerMessage::Bitfield { .. } => {
                return Err(TorrentError::protocol(
                    "Bitfield is only allowed directly after the handshake",
                ));
            }
            PeerMessage::KeepAlive
            | PeerMessage::Interested
            | PeerMessage::NotInterested
            | PeerMessage::Request { .. }
            | PeerMessage::Cancel { .. }
            | PeerMessage::Piece { .. } => {}
        }

        Ok(message)
    }

    /// Closes the connection; later sends and receives fail.
    pub fn close(&mut self) {
        if self.state != ConnectionState::Closed {
            tracing::trace!("Closing connection to {}", self.address);
            self.state = ConnectionState::Closed;
            self.reader_task.abort();
            self.inbox.close();
        }
    }

    fn fail(&mut self, error: TorrentError) -> TorrentError {
        tracing::debug!("Connection to {} failed: {error}", self.address);
        self.close();
        error
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn forward_messages<R>(mut reader: R, inbox: mpsc::Sender<InboxItem>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let result = MessageCodec::read_message(&mut reader).await;
        let failed = result.is_err();
        if inbox.send(result).await.is_err() || failed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, DuplexStream};

    use super::*;
    use crate::config::ShoalConfig;

    const INFO_HASH: InfoHash = InfoHash([7u8; 20]);

    fn network() -> NetworkConfig {
        ShoalConfig::for_testing().network
    }

    fn address() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    async fn write_message(remote: &mut DuplexStream, message: PeerMessage) {
        remote
            .write_all(&MessageCodec::serialize_message(&message))
            .await
            .unwrap();
    }

    /// Plays the remote side of the handshake and sends `first_message`.
    async fn remote_greeting(remote: &mut DuplexStream, first_message: PeerMessage) {
        let handshake = HandshakeCodec::read_handshake(remote).await.unwrap();
        assert_eq!(handshake.info_hash, INFO_HASH);
        let reply = PeerHandshake::new(INFO_HASH, PeerId::new([9u8; 20]));
        remote
            .write_all(&HandshakeCodec::serialize_handshake(&reply))
            .await
            .unwrap();
        write_message(remote, first_message).await;
    }

    async fn open_connection(bitfield: &[u8]) -> (PeerConnection, DuplexStream) {
        let (local, mut remote) = tokio::io::duplex(64 * 1024);
        let bitfield = PeerMessage::Bitfield {
            bitfield: Bytes::copy_from_slice(bitfield),
        };
        let network = network();
        let (connection, ()) = tokio::join!(
            PeerConnection::establish(
                address(),
                local,
                INFO_HASH,
                PeerId::generate("-SH0001-"),
                &network
            ),
            remote_greeting(&mut remote, bitfield),
        );
        (connection.unwrap(), remote)
    }

    #[tokio::test]
    async fn test_establish_records_bitfield_and_starts_choked() {
        let (connection, _remote) = open_connection(&[0b1010_0000]).await;

        assert_eq!(connection.state(), ConnectionState::Active);
        assert!(connection.is_choked());
        assert!(connection.bitfield().has_piece(0));
        assert!(!connection.bitfield().has_piece(1));
        assert!(connection.bitfield().has_piece(2));
        assert_eq!(connection.remote_peer_id(), PeerId::new([9u8; 20]));
    }

    #[tokio::test]
    async fn test_establish_requires_bitfield_first() {
        let (local, mut remote) = tokio::io::duplex(64 * 1024);
        let network = network();
        let (connection, ()) = tokio::join!(
            PeerConnection::establish(
                address(),
                local,
                INFO_HASH,
                PeerId::generate("-SH0001-"),
                &network
            ),
            remote_greeting(&mut remote, PeerMessage::Unchoke),
        );
        assert!(matches!(connection, Err(TorrentError::ProtocolError { .. })));
    }

    #[tokio::test]
    async fn test_establish_times_out_without_bitfield() {
        let (local, mut remote) = tokio::io::duplex(64 * 1024);
        let greeting = async {
            let _ = HandshakeCodec::read_handshake(&mut remote).await.unwrap();
            let reply = PeerHandshake::new(INFO_HASH, PeerId::new([9u8; 20]));
            remote
                .write_all(&HandshakeCodec::serialize_handshake(&reply))
                .await
                .unwrap();
        };
        let network = network();
        let (connection, ()) = tokio::join!(
            PeerConnection::establish(
                address(),
                local,
                INFO_HASH,
                PeerId::generate("-SH0001-"),
                &network
            ),
            greeting,
        );
        assert!(matches!(
            connection,
            Err(TorrentError::PeerTimeout {
                operation: "bitfield",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_state_messages_update_connection() {
        let (mut connection, mut remote) = open_connection(&[0b0000_0000]).await;

        write_message(&mut remote, PeerMessage::Unchoke).await;
        assert_eq!(
            connection.receive_message().await.unwrap(),
            PeerMessage::Unchoke
        );
        assert!(!connection.is_choked());

        write_message(&mut remote, MessageCodec::have(PieceIndex::new(3))).await;
        connection.receive_message().await.unwrap();
        assert!(connection.bitfield().has_piece(3));

        // Out of range Have is accepted and ignored
        write_message(&mut remote, MessageCodec::have(PieceIndex::new(500))).await;
        connection.receive_message().await.unwrap();
        assert!(!connection.bitfield().has_piece(500));

        write_message(&mut remote, PeerMessage::Choke).await;
        connection.receive_message().await.unwrap();
        assert!(connection.is_choked());

        for ignored in [
            PeerMessage::KeepAlive,
            PeerMessage::Interested,
            PeerMessage::NotInterested,
        ] {
            write_message(&mut remote, ignored.clone()).await;
            assert_eq!(connection.receive_message().await.unwrap(), ignored);
        }
        assert_eq!(connection.state(), ConnectionState::Active);
    }

    #[tokio::test]
    async fn test_read_deadline_leaves_connection_open() {
        let (mut connection, _remote) = open_connection(&[0xFF]).await;

        let result = connection.receive_message().await;
        assert!(matches!(
            result,
            Err(TorrentError::PeerTimeout {
                operation: "read",
                ..
            })
        ));
        assert_eq!(connection.state(), ConnectionState::Active);
    }

    #[tokio::test]
    async fn test_second_bitfield_closes_connection() {
        let (mut connection, mut remote) = open_connection(&[0xFF]).await;

        write_message(
            &mut remote,
            PeerMessage::Bitfield {
                bitfield: Bytes::from_static(&[0x00]),
            },
        )
        .await;
        assert!(matches!(
            connection.receive_message().await,
            Err(TorrentError::ProtocolError { .. })
        ));
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(connection.send_have(PieceIndex::new(0)).await.is_err());
    }

    #[tokio::test]
    async fn test_peer_hangup_is_transport_error() {
        let (mut connection, remote) = open_connection(&[0xFF]).await;
        drop(remote);

        let error = connection.receive_message().await.unwrap_err();
        assert!(error.is_transport());
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_announce_interest_and_request_frames() {
        let (mut connection, mut remote) = open_connection(&[0xFF]).await;

        connection.announce_interest().await.unwrap();
        connection
            .send_request(PieceIndex::new(2), 16384, 16384)
            .await
            .unwrap();

        let mut expected = MessageCodec::serialize_message(&PeerMessage::Unchoke);
        expected.extend(MessageCodec::serialize_message(&PeerMessage::Interested));
        expected.extend(MessageCodec::serialize_message(&MessageCodec::request(
            PieceIndex::new(2),
            16384,
            16384,
        )));

        let mut received = vec![0u8; expected.len()];
        remote.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        // Bind then drop a listener so the port is almost certainly closed.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed = listener.local_addr().unwrap();
        drop(listener);

        let result = PeerConnection::connect(
            closed,
            INFO_HASH,
            PeerId::generate("-SH0001-"),
            &network(),
        )
        .await;
        assert!(matches!(result, Err(e) if e.is_transport()));
    }

    #[test]
    fn test_connection_state_names() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::Handshaking.to_string(), "handshaking");
        assert_eq!(
            ConnectionState::ExchangingBitfield.to_string(),
            "exchanging bitfield"
        );
        assert_eq!(ConnectionState::Closed.to_string(), "closed");
    }
}
