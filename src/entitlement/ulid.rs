//! Minimal ULID support: 128-bit, lexicographically sortable ids seeded
//! from an event timestamp, used throughout the reconciler and storage
//! layers as the cursor type for "ordered record id".

use base32::Alphabet;
use chrono::{DateTime, Utc};
use rand::RngCore;

const ENCODED_LEN: usize = 26;

/// Generate a ULID string seeded from `at`: the first 48 bits encode the
/// millisecond timestamp, the remaining 80 bits are random. Encoded with
/// the `base32` crate (also used elsewhere for license-key and
/// MFA-secret encoding), using the Crockford alphabet ULIDs specify.
pub fn ulid(at: DateTime<Utc>) -> String {
    let ms = at.timestamp_millis().max(0) as u64;
    let mut bytes = [0u8; 16];
    bytes[0..6].copy_from_slice(&ms.to_be_bytes()[2..8]);
    rand::thread_rng().fill_bytes(&mut bytes[6..16]);
    base32::encode(Alphabet::Crockford, &bytes)
}

/// Parse the timestamp-ms component back out of a ULID string, if well-formed.
pub fn timestamp_ms(id: &str) -> Option<i64> {
    if id.len() != ENCODED_LEN {
        return None;
    }
    let bytes = base32::decode(Alphabet::Crockford, id)?;
    if bytes.len() < 6 {
        return None;
    }
    let mut ms_bytes = [0u8; 8];
    ms_bytes[2..8].copy_from_slice(&bytes[0..6]);
    Some(u64::from_be_bytes(ms_bytes) as i64)
}

/// Treats `""` as "no record id observed" — the empty string is a valid
/// `Option::None`-like sentinel carried over from the source's `||`
/// coercion semantics.
pub fn non_empty(id: &str) -> Option<&str> {
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}
