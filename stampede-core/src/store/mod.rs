//! Replicated, versioned key-value file store.
//!
//! Placement is a 1024-slot consistent-hash ring overlaid on the live
//! membership ([`hash_ring`]). Each node hosts a per-file version table
//! ([`file_table`]) and a byte-bounded LFU payload cache ([`cache`]).
//! [`node`] serves the replica-side operations and runs the delete-pool
//! and convergence cron; [`client`] fans operations out to the replica
//! set and waits for quorums, with [`task`] carrying the tagged
//! task/result envelopes.

pub mod cache;
pub mod client;
pub mod file_table;
pub mod hash_ring;
pub mod node;
pub mod task;

pub use client::KvsClient;
pub use node::KvsNode;
