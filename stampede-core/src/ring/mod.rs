//! UDP membership ring with failure suspicion and leader election.
//!
//! Membership state transitions live in [`membership`] as pure
//! operations so the merge rules are testable without sockets; the
//! datagram plumbing, periodic pings and the join/leave flows live in
//! [`server`].

pub mod membership;
pub mod server;

pub use membership::{MemberUpdate, MembershipState};
pub use server::{MemberUpdateFn, RingServer};
