//! Runs that end because no usable peer remains.

use shoal_core::torrent::test_data::create_test_torrent;
use shoal_core::{ShoalConfig, TorrentError};
use shoal_sim::{PeerBehavior, SimulatedSwarm};

use crate::support::download_to_memory;

#[tokio::test]
async fn test_unreachable_peers_end_the_run() {
    let torrent = create_test_torrent(16_384, 16_384 * 5);

    let mut peers = Vec::new();
    for _ in 0..3 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        peers.push(listener.local_addr().unwrap());
    }

    let (result, sink) =
        download_to_memory(&torrent.metadata, ShoalConfig::for_testing(), peers).await;

    assert!(matches!(
        result,
        Err(TorrentError::InsufficientPeers { remaining: 5 })
    ));
    assert!(sink.writes().is_empty());
    assert!(!sink.is_finalized());
}

#[tokio::test]
async fn test_piece_nobody_has_stalls_the_run() {
    let torrent = create_test_torrent(16_384, 16_384 * 5);
    let swarm = SimulatedSwarm::spawn(
        torrent,
        vec![
            PeerBehavior::honest().missing([3]),
            PeerBehavior::honest().missing([3]),
        ],
    )
    .await
    .unwrap();
    let metadata = &swarm.torrent().metadata;

    let (result, sink) =
        download_to_memory(metadata, ShoalConfig::for_testing(), swarm.addresses()).await;

    assert!(matches!(
        result,
        Err(TorrentError::InsufficientPeers { remaining: 1 })
    ));
    // Everything that could be fetched was still written.
    assert_eq!(sink.writes().len(), 4);
    assert!(!sink.is_finalized());
}

#[tokio::test]
async fn test_every_holder_corrupting_a_piece_exhausts_peers() {
    let torrent = create_test_torrent(16_384, 16_384 * 3);
    let swarm = SimulatedSwarm::spawn(
        torrent,
        vec![
            PeerBehavior::honest().corrupt(1),
            PeerBehavior::honest().corrupt(1),
        ],
    )
    .await
    .unwrap();
    let metadata = &swarm.torrent().metadata;

    let (result, sink) =
        download_to_memory(metadata, ShoalConfig::for_testing(), swarm.addresses()).await;

    match result {
        Err(TorrentError::InsufficientPeers { remaining }) => assert!(remaining >= 1),
        other => panic!("expected InsufficientPeers, got {other:?}"),
    }
    let piece_one_offset = metadata.piece_length as u64;
    assert!(
        sink.writes()
            .iter()
            .all(|write| write.offset != piece_one_offset)
    );
}

#[tokio::test]
async fn test_empty_peer_list() {
    let torrent = create_test_torrent(16_384, 16_384 * 2);
    let (result, _sink) =
        download_to_memory(&torrent.metadata, ShoalConfig::for_testing(), Vec::new()).await;

    assert!(matches!(
        result,
        Err(TorrentError::InsufficientPeers { remaining: 2 })
    ));
}
