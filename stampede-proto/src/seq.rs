use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A total-order stamp issued by the cluster leader.
///
/// `time` is the issuing leader's join time, so sequences from a later
/// leader epoch always rank after sequences from an earlier one; `count`
/// breaks ties within an epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence {
    pub time: DateTime<Utc>,
    pub count: u64,
}

impl Ord for Sequence {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.count.cmp(&other.count))
    }
}

impl PartialOrd for Sequence {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Uniquely identifies one client write attempt, so replicas can detect
/// retried writes and keep inserts idempotent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteId {
    pub ip: String,
    pub port: u16,
    pub create_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn seq(secs: i64, count: u64) -> Sequence {
        Sequence {
            time: Utc.timestamp_opt(secs, 0).single().expect("timestamp"),
            count,
        }
    }

    #[test]
    fn orders_by_epoch_then_count() {
        assert!(seq(10, 5) < seq(11, 0));
        assert!(seq(10, 5) < seq(10, 6));
        assert_eq!(seq(10, 5), seq(10, 5));

        let mut seqs = vec![seq(12, 1), seq(10, 9), seq(10, 2), seq(11, 0)];
        seqs.sort();
        assert_eq!(seqs, vec![seq(10, 2), seq(10, 9), seq(11, 0), seq(12, 1)]);
    }
}
