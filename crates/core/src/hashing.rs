//! Deterministic hash partitioning of visitor keys into the unit interval.

use sha2::{Digest, Sha256};

/// Number of distinct buckets a key can land in.
const PARTITION_RESOLUTION: u64 = 1_000_000;

/// First 64 bits of the SHA-256 digest of `key`, big-endian.
pub fn hash_u64(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Map `key` to a uniform value in [0, 1). Same key, same value, on every node.
pub fn partition(key: &str) -> f64 {
    (hash_u64(key) % PARTITION_RESOLUTION) as f64 / PARTITION_RESOLUTION as f64
}

/// Key for the total-traffic gate.
pub fn gate_key(visitor_id: &str, experiment_id: &str) -> String {
    format!("{visitor_id}{experiment_id}")
}

/// Key for the HASH/RULE bucket draw, salted so it is independent of the gate.
pub fn bucket_key(salt: &str, visitor_id: &str, experiment_id: &str) -> String {
    format!("{salt}:{visitor_id}{experiment_id}")
}
