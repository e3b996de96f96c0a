//! Integration tests for Shoal
//!
//! These tests run the full download engine against simulated peers on
//! loopback sockets: end-to-end transfers, fault injection, and runs that
//! end without enough usable peers.

#[path = "integration/support.rs"]
mod support;

#[path = "integration/download.rs"]
mod download;
#[path = "integration/fault_injection.rs"]
mod fault_injection;
#[path = "integration/insufficient_peers.rs"]
mod insufficient_peers;
