use chrono::{DateTime, Utc};
use sha3::{Digest, Keccak256};

use crate::models::AccountAddress;

/// Keccak256 digest of raw bytes.
pub fn keccak256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Keccak256 digest as a 0x-prefixed hex string.
pub fn keccak256_hex(data: &[u8]) -> String {
    format!("0x{}", hex::encode(keccak256(data)))
}

/// Dedup key for a portfolio sync: hash of `{account}:{fetchedAt millis}`.
///
/// The account is hashed in lowercase so a differently-cased address never
/// produces a second key for the same snapshot.
pub fn idempotency_key(account: &AccountAddress, fetched_at: &DateTime<Utc>) -> String {
    let material = format!(
        "{}:{}",
        account.checksummed().to_ascii_lowercase(),
        fetched_at.timestamp_millis()
    );
    keccak256_hex(material.as_bytes())
}
