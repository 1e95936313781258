//! Core subsystems of the Stampede inference-serving cluster.
//!
//! Three tightly coupled pieces live here:
//!
//! - [`ring`]: the UDP membership ring: gossip-style pings, failure
//!   suspicion with a delayed expiration pool, voluntary leave, and
//!   leader election by earliest join time.
//! - [`store`]: the replicated versioned key-value file store: a
//!   1024-slot consistent-hash ring overlaid on the membership list, a
//!   per-file version table ordered by leader-issued sequences, an LFU
//!   payload cache, quorum-based client operations and post-membership
//!   replica convergence.
//! - [`serve`]: the fair-share serving layer: job admission and batch
//!   partitioning on the coordinator, two fair-time allocation
//!   algorithms, graceful worker preemption, and the worker agent that
//!   shuttles batches between the coordinator, the store and the
//!   external model runner.
//!
//! [`directory`] is the tiny leader-directory client gluing new joiners
//! and service clients to the current leader; [`rpc`] is the shared
//! HTTP/JSON transport.

pub mod directory;
pub mod error;
pub mod ring;
pub mod rpc;
pub mod serve;
pub mod store;
pub mod util;

pub use error::{Error, Result};
