//! Fair-share serving layer: coordinator, scheduler and worker agent.
//!
//! The coordinator ([`coordinator`]) admits jobs, partitions datasets
//! into batches and drives the periodic loops; the scheduler
//! ([`scheduler`]) owns the batch state machine and the reallocation
//! pass over the worker pool ([`resource`]), fed by the two fair-time
//! allocators ([`ralloc`]). Every node also runs a worker agent
//! ([`worker`]) that polls the coordinator for batches and forwards them
//! to the external model runner. [`model_store`] maps trained models to
//! their datasets and [`status`] renders operator-facing state.

pub mod coordinator;
pub mod model_store;
pub mod ralloc;
pub mod resource;
pub mod scheduler;
pub mod status;
pub mod worker;

pub use coordinator::Coordinator;
pub use scheduler::{FairnessMode, Scheduler};
pub use worker::WorkerAgent;
