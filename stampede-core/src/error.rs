use thiserror::Error;

/// Error surface of the core subsystems. Each variant family has its own
/// propagation policy: transport failures are retried by the owning
/// periodic loop, `NotConverged` makes clients retry, `NotFound` and
/// quorum timeouts surface to the caller, admission and misroute errors
/// carry a descriptive message back over the wire.
#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("datagram dropped by fault injection")]
    DatagramDropped,

    #[error("deadline elapsed waiting for {0}")]
    Deadline(&'static str),

    #[error("ring is not converged")]
    NotConverged,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("quorum timeout for {op}: received {received} of {required} acks")]
    QuorumTimeout {
        op: &'static str,
        received: usize,
        required: usize,
    },

    #[error("no leader registered in the directory")]
    NoLeader,

    #[error("admission rejected: {0}")]
    Admission(String),

    #[error("misrouted request: {0}")]
    Misroute(String),

    #[error("peer returned error status for {0}")]
    PeerStatus(&'static str),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
