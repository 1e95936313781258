use std::hash::Hasher;

use chrono::{DateTime, Utc};
use fnv::FnvHasher;
use rand::Rng;
use stampede_proto::Sequence;

/// FNV-1a hash of a placement key. Deterministic across nodes, which the
/// consistent-hash ring depends on.
pub fn hash(key: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(key.as_bytes());
    hasher.finish()
}

/// On-disk name of one file version: `[name][seq-millis][seq-count]`.
/// The sequence components keep concurrent versions of the same file
/// distinct and filesystem-safe.
pub fn concat_filename(filename: &str, seq: &Sequence) -> String {
    format!("[{}][{}][{}]", filename, seq.time.timestamp_millis(), seq.count)
}

/// Deterministic job id: `prefix:<unix-seconds>`.
pub fn create_id(prefix: &str, now: DateTime<Utc>) -> String {
    format!("{}:{}", prefix, now.timestamp())
}

/// Scratch-file name unlikely to collide with user data.
pub fn temp_filename(now: DateTime<Utc>) -> String {
    format!("[tmp-{}]", now.timestamp_nanos_opt().unwrap_or_default())
}

/// Fault-injection hook: true when an outgoing datagram should be
/// dropped instead of sent.
pub fn should_drop(probability: f64) -> bool {
    probability > 0.0 && rand::rng().random::<f64>() <= probability
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash("host-1:5000"), hash("host-1:5000"));
        assert_ne!(hash("host-1:5000"), hash("host-2:5000"));
    }

    #[test]
    fn concat_names_distinguish_versions() {
        let time = Utc.timestamp_opt(1_700_000_000, 0).single().expect("time");
        let first = concat_filename("model.bin", &Sequence { time, count: 1 });
        let second = concat_filename("model.bin", &Sequence { time, count: 2 });
        assert_ne!(first, second);
        assert!(first.starts_with("[model.bin]["));
    }

    #[test]
    fn drop_probability_bounds() {
        assert!(!should_drop(0.0));
        assert!(should_drop(1.0));
    }
}
