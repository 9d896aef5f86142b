//! Slot model: key hashing and slot-scoped key prefixes.
//!
//! The keyspace is partitioned into 16384 slots. A key's slot is the
//! CRC16/XMODEM of the key (or of its hash-tag substring) masked to 14 bits,
//! and every metadata record of a slot lives under a byte prefix derived from
//! `(namespace, slot)` so migration can scan a slot without re-hashing.

pub type SlotId = u16;

/// Number of hash slots in the cluster keyspace.
pub const HASH_SLOTS: u16 = 16384;

/// Largest valid slot id.
pub const MAX_SLOT_ID: SlotId = HASH_SLOTS - 1;

/// CRC16/XMODEM (poly 0x1021, init 0, no reflection).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Compute the slot a key hashes to, honoring `{hash-tag}` sections.
///
/// When the key contains a non-empty `{...}` section, only the bytes between
/// the first `{` and the next `}` are hashed so related keys can be pinned to
/// one slot.
pub fn key_slot(key: &[u8]) -> SlotId {
    let hashed = match hash_tag(key) {
        Some(tag) => tag,
        None => key,
    };
    crc16(hashed) & (HASH_SLOTS - 1)
}

fn hash_tag(key: &[u8]) -> Option<&[u8]> {
    let open = key.iter().position(|b| *b == b'{')?;
    let close = key[open + 1..].iter().position(|b| *b == b'}')?;
    // An empty tag ("{}") falls back to hashing the whole key.
    if close == 0 {
        return None;
    }
    Some(&key[open + 1..open + 1 + close])
}

/// Byte prefix under which every metadata key of `(namespace, slot)` sorts:
/// `[ns_len u8][namespace][slot u16 BE]`.
pub fn compose_slot_prefix(namespace: &[u8], slot: SlotId) -> Vec<u8> {
    debug_assert!(namespace.len() <= u8::MAX as usize);
    let mut out = Vec::with_capacity(1 + namespace.len() + 2);
    out.push(namespace.len() as u8);
    out.extend_from_slice(namespace);
    out.extend_from_slice(&slot.to_be_bytes());
    out
}

/// Full metadata key for a user key: slot prefix followed by the key bytes.
pub fn compose_metadata_key(namespace: &[u8], slot: SlotId, user_key: &[u8]) -> Vec<u8> {
    let mut out = compose_slot_prefix(namespace, slot);
    out.extend_from_slice(user_key);
    out
}

/// Split a metadata key back into `(slot, user_key)`.
pub fn split_metadata_key(bytes: &[u8]) -> anyhow::Result<(SlotId, &[u8])> {
    anyhow::ensure!(!bytes.is_empty(), "metadata key is empty");
    let ns_len = bytes[0] as usize;
    anyhow::ensure!(
        bytes.len() >= 1 + ns_len + 2,
        "metadata key shorter than its namespace prefix"
    );
    let slot = u16::from_be_bytes([bytes[1 + ns_len], bytes[1 + ns_len + 1]]);
    Ok((slot, &bytes[1 + ns_len + 2..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_matches_xmodem_check_value() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
        assert_eq!(key_slot(b"123456789"), 0x31C3 & (HASH_SLOTS - 1));
    }

    #[test]
    fn hash_tag_pins_related_keys_to_one_slot() {
        assert_eq!(
            key_slot(b"{user1000}.following"),
            key_slot(b"{user1000}.followers")
        );
        assert_eq!(key_slot(b"{tag}a"), key_slot(b"tag"));
    }

    #[test]
    fn empty_hash_tag_hashes_whole_key() {
        assert_eq!(key_slot(b"foo{}bar"), crc16(b"foo{}bar") & (HASH_SLOTS - 1));
    }

    #[test]
    fn metadata_key_round_trips() {
        let key = compose_metadata_key(b"__default", 77, b"user:1");
        let (slot, user_key) = split_metadata_key(&key).unwrap();
        assert_eq!(slot, 77);
        assert_eq!(user_key, b"user:1");
        assert!(key.starts_with(&compose_slot_prefix(b"__default", 77)));
    }

    #[test]
    fn slot_prefixes_do_not_collide_across_slots() {
        let a = compose_slot_prefix(b"__default", 1);
        let b = compose_slot_prefix(b"__default", 258);
        assert_ne!(a, b);
    }
}
