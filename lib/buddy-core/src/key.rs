//! Key encodings for the three logical tables sharing one KV namespace:
//! the hash table (raw 32-byte digest keys), the free list
//! (`free_{class}_{block_num}`), and the temp list (`t_{class}_{block_num}`).
//!
//! `block_num` is encoded as decimal ASCII, not fixed-width, so lexicographic
//! key order is not numeric order. The allocator only ever prefix-scans and
//! takes whichever match comes back, so this is not relied upon.

use crate::size_class::SizeClass;

pub const FREE_PREFIX: &str = "free_";
pub const TEMP_PREFIX: &str = "t_";

/// Which list a free/temp key belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ListKind {
    Free,
    Temp,
}

impl ListKind {
    fn prefix(self) -> &'static str {
        match self {
            ListKind::Free => FREE_PREFIX,
            ListKind::Temp => TEMP_PREFIX,
        }
    }
}

/// Builds the key for a free-list or temp-list entry.
pub fn list_key(kind: ListKind, class: SizeClass, block_num: u64) -> Vec<u8> {
    format!("{}{}_{}", kind.prefix(), class.short(), block_num).into_bytes()
}

/// Prefix for scanning every entry of a list at a given class.
pub fn class_prefix(kind: ListKind, class: SizeClass) -> Vec<u8> {
    format!("{}{}_", kind.prefix(), class.short()).into_bytes()
}

/// Prefix for scanning every temp entry, across all classes (used by
/// `recover_temp`).
pub fn temp_scan_prefix() -> Vec<u8> {
    TEMP_PREFIX.as_bytes().to_vec()
}

/// Recovers `(kind, class, block_num)` from a free/temp key.
pub fn parse_list_key(key: &[u8]) -> Option<(ListKind, SizeClass, u64)> {
    let s = std::str::from_utf8(key).ok()?;
    let (kind, rest) = if let Some(rest) = s.strip_prefix(FREE_PREFIX) {
        (ListKind::Free, rest)
    } else if let Some(rest) = s.strip_prefix(TEMP_PREFIX) {
        (ListKind::Temp, rest)
    } else {
        return None;
    };
    let (class_str, num_str) = rest.split_once('_')?;
    let class = SizeClass::from_short(class_str)?;
    let block_num = num_str.parse::<u64>().ok()?;
    Some((kind, class, block_num))
}

/// Encodes the little-endian `buddy_num` free/temp list value.
pub fn encode_buddy(buddy_num: u64) -> [u8; 8] {
    buddy_num.to_le_bytes()
}

pub fn decode_buddy(value: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = value.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}
