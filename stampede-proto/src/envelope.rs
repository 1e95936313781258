use serde::{Deserialize, Serialize};

use crate::process::Process;

/// Ack payload carried by every [`Envelope::Ack`].
pub const ACK_MESSAGE: &str = "PONG";

/// Receive-buffer size for membership datagrams. Ping payloads carry the
/// full membership list, which stays well under this for the cluster
/// sizes the ring is designed for.
pub const MAX_DATAGRAM: usize = 2048;

/// Tagged envelope for every membership datagram.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Ping { processes: Vec<Process> },
    Ack { received: String },
    Join { process: Process },
    Leave { process: Process },
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn ack() -> Self {
        Envelope::Ack {
            received: ACK_MESSAGE.to_string(),
        }
    }

    /// True for an ack that carries the expected payload.
    pub fn is_valid_ack(&self) -> bool {
        matches!(self, Envelope::Ack { received } if received == ACK_MESSAGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_round_trips() {
        let envelope = Envelope::Ping {
            processes: vec![Process::new("127.0.0.1", 5000)],
        };
        let bytes = envelope.encode().expect("encode");
        assert!(bytes.len() < MAX_DATAGRAM);

        match Envelope::decode(&bytes).expect("decode") {
            Envelope::Ping { processes } => {
                assert_eq!(processes.len(), 1);
                assert_eq!(processes[0].address(), "127.0.0.1:5000");
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn ack_validation() {
        assert!(Envelope::ack().is_valid_ack());
        let bogus = Envelope::Ack {
            received: "PING".to_string(),
        };
        assert!(!bogus.is_valid_ack());
    }
}
