//! End-to-end downloads from well-behaved swarms.

use shoal_core::storage::test_fixtures::create_temp_output;
use shoal_core::torrent::test_data::create_test_torrent;
use shoal_core::{FileSink, PieceScheduler, ShoalConfig};
use shoal_sim::{PeerBehavior, SimulatedSwarm};

use crate::support::{RUN_DEADLINE, assert_written_once, download_to_memory, init_test_tracing};

#[tokio::test]
async fn test_download_from_several_peers_writes_each_piece_once() {
    // 12 pieces, the last one short
    let torrent = create_test_torrent(32_768, 32_768 * 11 + 5_000);
    let swarm = SimulatedSwarm::honest(torrent, 4).await.unwrap();
    let metadata = &swarm.torrent().metadata;

    let (result, sink) =
        download_to_memory(metadata, ShoalConfig::for_testing(), swarm.addresses()).await;
    let summary = result.unwrap();

    assert_eq!(summary.pieces, 12);
    assert_eq!(summary.bytes_written, metadata.total_length);
    assert_eq!(summary.peers_attempted, 4);
    assert_eq!(summary.peers_failed, 0);
    assert_written_once(&sink, metadata, &swarm.torrent().content);
}

#[tokio::test]
async fn test_download_to_file() {
    init_test_tracing();
    let torrent = create_test_torrent(65_536, 65_536 * 5);
    let swarm = SimulatedSwarm::honest(torrent, 2).await.unwrap();
    let metadata = swarm.torrent().metadata.clone();
    let (_dir, path) = create_temp_output("downloads/test.bin");

    let sink = FileSink::create(&path, metadata.total_length).await.unwrap();
    let scheduler = PieceScheduler::new(metadata, ShoalConfig::for_testing(), sink);
    let summary = tokio::time::timeout(RUN_DEADLINE, scheduler.run(swarm.addresses()))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(summary.pieces, 5);
    let written = std::fs::read(&path).unwrap();
    assert!(written == swarm.torrent().content);
}

#[tokio::test]
async fn test_peers_with_disjoint_pieces_complete_together() {
    let torrent = create_test_torrent(16_384, 16_384 * 8);
    let swarm = SimulatedSwarm::spawn(
        torrent,
        vec![
            PeerBehavior::honest().missing([0, 2, 4, 6]),
            PeerBehavior::honest().missing([1, 3, 5, 7]),
        ],
    )
    .await
    .unwrap();
    let metadata = &swarm.torrent().metadata;

    let (result, sink) =
        download_to_memory(metadata, ShoalConfig::for_testing(), swarm.addresses()).await;

    assert_eq!(result.unwrap().peers_failed, 0);
    assert_written_once(&sink, metadata, &swarm.torrent().content);
    for peer in swarm.peers() {
        assert_eq!(peer.stats().blocks_served(), 4);
    }
}

#[tokio::test]
async fn test_small_blocks_and_shallow_pipeline() {
    let torrent = create_test_torrent(20_000, 20_000 * 3 + 1);
    let swarm = SimulatedSwarm::honest(torrent, 1).await.unwrap();
    let metadata = &swarm.torrent().metadata;

    let mut config = ShoalConfig::for_testing();
    config.download.block_size = 4_096;
    config.download.pipeline_depth = 2;

    let (result, sink) = download_to_memory(metadata, config, swarm.addresses()).await;

    assert_eq!(result.unwrap().pieces, 4);
    assert_written_once(&sink, metadata, &swarm.torrent().content);
    // 5 blocks for each full piece plus one for the single trailing byte
    assert_eq!(swarm.blocks_served(), 16);
}

#[tokio::test]
async fn test_duplicate_addresses_share_one_connection() {
    let torrent = create_test_torrent(16_384, 16_384 * 2);
    let swarm = SimulatedSwarm::honest(torrent, 1).await.unwrap();
    let metadata = &swarm.torrent().metadata;
    let address = swarm.addresses()[0];

    let (result, _sink) = download_to_memory(
        metadata,
        ShoalConfig::for_testing(),
        vec![address, address, address],
    )
    .await;

    assert_eq!(result.unwrap().peers_attempted, 1);
    assert_eq!(swarm.peers()[0].stats().connections(), 1);
}
