//! Process wiring for Stampede nodes and the leader directory.
//!
//! The binaries are thin: everything they assemble (service
//! construction, the axum routers, the operator REPL) lives here so
//! integration tests can boot whole in-process clusters.

pub mod cli;
pub mod directory;
pub mod node;
pub mod routes;
