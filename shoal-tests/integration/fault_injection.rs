//! Downloads that survive misbehaving peers.

use std::time::Duration;

use shoal_core::ShoalConfig;
use shoal_core::torrent::test_data::create_test_torrent;
use shoal_sim::{PeerBehavior, SimulatedSwarm};

use crate::support::{assert_written_once, download_to_memory};

#[tokio::test]
async fn test_corrupt_piece_is_refetched_from_another_peer() {
    let torrent = create_test_torrent(16_384, 16_384 * 6);
    let corrupt_piece = 3;

    // The corrupt peer only holds piece 3 and is unchoked first, so it is
    // guaranteed to serve that piece before the honest peers wake up.
    let corrupt = PeerBehavior::honest()
        .missing([0, 1, 2, 4, 5])
        .corrupt(corrupt_piece);
    let slow_honest = PeerBehavior::honest().unchoke_after(Duration::from_millis(300));

    let swarm = SimulatedSwarm::spawn(torrent, vec![corrupt, slow_honest.clone(), slow_honest])
        .await
        .unwrap();
    let metadata = &swarm.torrent().metadata;

    let (result, sink) =
        download_to_memory(metadata, ShoalConfig::for_testing(), swarm.addresses()).await;
    let summary = result.unwrap();

    assert_eq!(summary.pieces, 6);
    assert_eq!(summary.peers_failed, 1);
    assert_eq!(swarm.peers()[0].stats().corrupt_blocks_served(), 1);
    assert_written_once(&sink, metadata, &swarm.torrent().content);
}

#[tokio::test]
async fn test_stalled_peer_work_is_reassigned() {
    let torrent = create_test_torrent(16_384, 16_384 * 4);
    let swarm = SimulatedSwarm::spawn(
        torrent,
        vec![PeerBehavior::honest().stalled(), PeerBehavior::honest()],
    )
    .await
    .unwrap();
    let metadata = &swarm.torrent().metadata;

    let (result, sink) =
        download_to_memory(metadata, ShoalConfig::for_testing(), swarm.addresses()).await;
    let summary = result.unwrap();

    assert_eq!(summary.peers_failed, 1);
    assert_eq!(swarm.peers()[0].stats().blocks_served(), 0);
    assert_written_once(&sink, metadata, &swarm.torrent().content);
}

#[tokio::test]
async fn test_keep_alive_only_peer_cannot_hold_a_piece() {
    let torrent = create_test_torrent(16_384, 16_384 * 4);
    // The honest peer unchokes late so the silent one claims a piece first.
    let silent = PeerBehavior::honest()
        .stalled()
        .keep_alive_every(Duration::from_millis(100));
    let slow_honest = PeerBehavior::honest().unchoke_after(Duration::from_millis(300));
    let swarm = SimulatedSwarm::spawn(torrent, vec![silent, slow_honest])
        .await
        .unwrap();
    let metadata = &swarm.torrent().metadata;

    let (result, sink) =
        download_to_memory(metadata, ShoalConfig::for_testing(), swarm.addresses()).await;
    let summary = result.unwrap();

    assert_eq!(summary.pieces, 4);
    assert_eq!(summary.peers_failed, 1);
    assert_eq!(swarm.peers()[0].stats().blocks_served(), 0);
    assert_written_once(&sink, metadata, &swarm.torrent().content);
}

#[tokio::test]
async fn test_mid_transfer_choke_reissues_requests() {
    // Four blocks per piece; the peer chokes after the second block.
    let torrent = create_test_torrent(65_536, 65_536 * 2);
    let swarm = SimulatedSwarm::spawn(torrent, vec![PeerBehavior::honest().choke_after(2)])
        .await
        .unwrap();
    let metadata = &swarm.torrent().metadata;

    let (result, sink) =
        download_to_memory(metadata, ShoalConfig::for_testing(), swarm.addresses()).await;

    assert_eq!(result.unwrap().peers_failed, 0);
    assert_written_once(&sink, metadata, &swarm.torrent().content);
}

#[tokio::test]
async fn test_wrong_info_hash_peer_is_skipped() {
    let torrent = create_test_torrent(16_384, 16_384 * 3);
    let swarm = SimulatedSwarm::spawn(
        torrent,
        vec![
            PeerBehavior::honest().wrong_info_hash(),
            PeerBehavior::honest(),
        ],
    )
    .await
    .unwrap();
    let metadata = &swarm.torrent().metadata;

    let (result, sink) =
        download_to_memory(metadata, ShoalConfig::for_testing(), swarm.addresses()).await;

    assert_eq!(result.unwrap().peers_failed, 1);
    assert_written_once(&sink, metadata, &swarm.torrent().content);
}

#[tokio::test]
async fn test_parked_worker_resumes_on_have() {
    let torrent = create_test_torrent(16_384, 16_384 * 4);
    let late = PeerBehavior::honest()
        .missing([2])
        .announce_missing_after(Duration::from_millis(200));
    let swarm = SimulatedSwarm::spawn(torrent, vec![late]).await.unwrap();
    let metadata = &swarm.torrent().metadata;

    let (result, sink) =
        download_to_memory(metadata, ShoalConfig::for_testing(), swarm.addresses()).await;

    assert_eq!(result.unwrap().pieces, 4);
    assert_written_once(&sink, metadata, &swarm.torrent().content);
}
