//! Wire contracts shared by every Stampede node and client.
//!
//! Everything that crosses a socket lives here: the membership datagram
//! envelope, the RPC request/response pairs for the directory, the
//! key-value store, the coordinator and the workers, and the job/batch
//! data model with its derived scheduling metrics. All types serialize
//! with serde; the transports (UDP datagrams, HTTP/JSON bodies) are
//! chosen by the `stampede-core` and `stampede-server` crates.

pub mod envelope;
pub mod job;
pub mod process;
pub mod rpc;
pub mod seq;

pub use envelope::{ACK_MESSAGE, Envelope, MAX_DATAGRAM};
pub use job::{BatchInput, BatchOutput, BatchState, BatchStatus, EvalResult, Job};
pub use process::{Process, ProcessStatus};
pub use rpc::ResponseStatus;
pub use seq::{Sequence, WriteId};
