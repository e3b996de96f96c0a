//! Shoal Simulation - in-process BitTorrent peers for exercising downloads.
//!
//! Spawns real TCP peers on loopback that serve a deterministic
//! [`TestTorrent`](shoal_core::torrent::test_data::TestTorrent). Each peer can
//! inject a fault (corrupt data, missing pieces, delayed unchoke, mid-transfer
//! choke, stalled requests, wrong info hash) so failure handling runs over
//! actual sockets.
//!
//! # Example
//!
//! ```rust,no_run
//! use shoal_core::torrent::test_data::create_test_torrent;
//! use shoal_sim::{PeerBehavior, SimulatedSwarm};
//!
//! # async fn demo() -> Result<(), shoal_sim::SimError> {
//! let torrent = create_test_torrent(16_384, 16_384 * 8);
//! let swarm = SimulatedSwarm::spawn(
//!     torrent,
//!     vec![PeerBehavior::honest(), PeerBehavior::honest().corrupt(3)],
//! )
//! .await?;
//! println!("peers: {:?}", swarm.addresses());
//! # Ok(())
//! # }
//! ```

pub mod peer_server;
pub mod swarm;

pub use peer_server::{PeerBehavior, PeerStats, SimError, SimulatedPeer, SimulatedPeerHandle};
pub use swarm::SimulatedSwarm;
