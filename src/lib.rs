//! Request-intercepting cache with offline write support.
//!
//! Reads go through [`CacheStrategyEngine`], which picks a caching strategy
//! per route class. Writes that cannot reach the network are held by
//! [`OfflineMutationQueue`] and replayed when [`NetworkStatusMonitor`] sees
//! connectivity return. [`OfflineClient`] wires the three together.

pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod http;
pub mod network;
pub mod offline;

#[cfg(test)]
mod testing;

pub use client::{OfflineClient, WriteOutcome};
pub use config::Config;
pub use engine::CacheStrategyEngine;
pub use network::NetworkStatusMonitor;
pub use offline::OfflineMutationQueue;
