//! Message identifiers.
//!
//! Every stored message gets a ULID: 26 Crockford base32 characters,
//! 48 bits of millisecond timestamp followed by 80 random bits. IDs minted
//! for the same millisecond sort by their random suffix only.

use rand::Rng;

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

pub const LEN: usize = 26;

/// Mint an ID for a message stored at `timestamp_ms`.
pub fn generate_at(timestamp_ms: u64) -> String {
    let mut rng = rand::thread_rng();
    let random: u128 = rng.r#gen::<u128>() & ((1u128 << 80) - 1);
    let value = ((timestamp_ms as u128 & ((1u128 << 48) - 1)) << 80) | random;

    let mut out = [0u8; LEN];
    let mut rest = value;
    for slot in out.iter_mut().rev() {
        *slot = CROCKFORD[(rest & 0x1F) as usize];
        rest >>= 5;
    }
    out.iter().map(|&b| b as char).collect()
}

/// Recover the millisecond timestamp encoded in an ID.
pub fn timestamp_ms(id: &str) -> Option<u64> {
    if id.len() != LEN {
        return None;
    }
    let mut value: u128 = 0;
    for c in id.bytes() {
        let digit = CROCKFORD.iter().position(|&d| d == c)?;
        value = (value << 5) | digit as u128;
    }
    Some((value >> 80) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_timestamp_prefix() {
        let id = generate_at(1_700_000_000_123);
        assert_eq!(id.len(), LEN);
        assert_eq!(timestamp_ms(&id), Some(1_700_000_000_123));
    }

    #[test]
    fn later_timestamps_sort_later() {
        let a = generate_at(1_000);
        let b = generate_at(1_001);
        assert!(a < b, "{a} should sort before {b}");
    }

    #[test]
    fn ids_are_unique_within_a_millisecond() {
        assert_ne!(generate_at(42), generate_at(42));
    }

    #[test]
    fn rejects_foreign_ids() {
        assert_eq!(timestamp_ms("short"), None);
        assert_eq!(timestamp_ms("IIIIIIIIIIIIIIIIIIIIIIIIII"), None);
    }
}
