//! Distributed commit mining.
//!
//! A repository list is split across worker nodes ([`splitter`]), each node
//! walks its repositories' histories and records commits whose messages
//! match a pattern set ([`miner`]), the per-node shards are collected and
//! merged into size-bounded files ([`aggregator`]), and results are pushed to
//! a shared git repository ([`publisher`]).

pub mod aggregator;
pub mod config;
pub mod error;
pub mod history;
pub mod logging;
pub mod miner;
pub mod model;
pub mod patterns;
pub mod publisher;
pub mod ratelimit;
pub mod shard;
pub mod splitter;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{MinerError, Result};
