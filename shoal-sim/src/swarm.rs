//! Groups of simulated peers serving one torrent.

use std::net::SocketAddr;
use std::sync::Arc;

use shoal_core::torrent::test_data::TestTorrent;

use crate::peer_server::{PeerBehavior, SimError, SimulatedPeer, SimulatedPeerHandle};

/// A set of running peers on localhost, one per behavior.
#[derive(Debug)]
pub struct SimulatedSwarm {
    torrent: Arc<TestTorrent>,
    peers: Vec<SimulatedPeerHandle>,
}

impl SimulatedSwarm {
    /// Starts one peer per entry of `behaviors` on ephemeral loopback ports.
    ///
    /// # Errors
    ///
    /// - `SimError::Bind` - If a listener could not be bound
    pub async fn spawn(
        torrent: TestTorrent,
        behaviors: Vec<PeerBehavior>,
    ) -> Result<Self, SimError> {
        let torrent = Arc::new(torrent);
        let listen_address = SocketAddr::from(([127, 0, 0, 1], 0));

        let mut peers = Vec::with_capacity(behaviors.len());
        for behavior in behaviors {
            let handle = SimulatedPeer::new(Arc::clone(&torrent), behavior)
                .spawn(listen_address)
                .await?;
            peers.push(handle);
        }

        tracing::info!(
            "Spawned {} simulated peers for {}",
            peers.len(),
            torrent.metadata.info_hash
        );
        Ok(Self { torrent, peers })
    }

    /// Starts `count` honest seeds.
    ///
    /// # Errors
    ///
    /// - `SimError::Bind` - If a listener could not be bound
    pub async fn honest(torrent: TestTorrent, count: usize) -> Result<Self, SimError> {
        Self::spawn(torrent, vec![PeerBehavior::honest(); count]).await
    }

    pub fn torrent(&self) -> &TestTorrent {
        &self.torrent
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.peers.iter().map(SimulatedPeerHandle::address).collect()
    }

    pub fn peers(&self) -> &[SimulatedPeerHandle] {
        &self.peers
    }

    /// Total blocks served by every peer in the swarm.
    pub fn blocks_served(&self) -> usize {
        self.peers
            .iter()
            .map(|peer| peer.stats().blocks_served())
            .sum()
    }
}
