//! The hash-table value: block metadata for an occupied block.
//!
//! Wire layout, 25 bytes total:
//!
//! ```text
//! u8(size_class_ordinal) || u64_le(block_num) || u64_le(buddy_num) || u64_le(data_size)
//! ```
//!
//! # Warning
//!
//! This layout is an external compatibility contract (spec.md §6): two
//! processes sharing a metadata store must agree on it byte-for-byte. Do not
//! reorder, add, or remove fields without a migration plan.

use crate::size_class::SizeClass;
use snafu::{OptionExt, Snafu};

pub const ENCODED_LEN: usize = 1 + 8 + 8 + 8;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockMetadata {
    pub size_class: SizeClass,
    pub block_num: u64,
    pub buddy_num: u64,
    pub data_size: u64,
}

impl BlockMetadata {
    pub fn offset(&self) -> u64 {
        crate::size_class::offset(self.size_class, self.block_num)
    }

    pub fn encode(&self) -> [u8; ENCODED_LEN] {
        let mut buf = [0u8; ENCODED_LEN];
        buf[0] = self.size_class.ordinal();
        buf[1..9].copy_from_slice(&self.block_num.to_le_bytes());
        buf[9..17].copy_from_slice(&self.buddy_num.to_le_bytes());
        buf[17..25].copy_from_slice(&self.data_size.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, InvalidMetadata> {
        snafu::ensure!(
            bytes.len() == ENCODED_LEN,
            BadLengthSnafu {
                expected: ENCODED_LEN,
                actual: bytes.len(),
            }
        );
        let size_class =
            SizeClass::from_ordinal(bytes[0]).ok().context(BadClassSnafu { ordinal: bytes[0] })?;
        let block_num = u64::from_le_bytes(bytes[1..9].try_into().unwrap());
        let buddy_num = u64::from_le_bytes(bytes[9..17].try_into().unwrap());
        let data_size = u64::from_le_bytes(bytes[17..25].try_into().unwrap());
        Ok(Self {
            size_class,
            block_num,
            buddy_num,
            data_size,
        })
    }
}

#[derive(Debug, Snafu)]
pub enum InvalidMetadata {
    #[snafu(display("metadata record has length {actual}, expected {expected}"))]
    BadLength { expected: usize, actual: usize },
    #[snafu(display("metadata record has unknown size class ordinal {ordinal}"))]
    BadClass { ordinal: u8 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let meta = BlockMetadata {
            size_class: SizeClass::K64,
            block_num: 7,
            buddy_num: 6,
            data_size: 12345,
        };
        let encoded = meta.encode();
        assert_eq!(encoded.len(), ENCODED_LEN);
        let decoded = BlockMetadata::decode(&encoded).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn rejects_wrong_length() {
        let err = BlockMetadata::decode(&[0u8; 24]).unwrap_err();
        assert!(matches!(err, InvalidMetadata::BadLength { .. }));
    }

    #[test]
    fn rejects_unknown_class() {
        let mut buf = [0u8; ENCODED_LEN];
        buf[0] = 200;
        let err = BlockMetadata::decode(&buf).unwrap_err();
        assert!(matches!(err, InvalidMetadata::BadClass { .. }));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn encode_decode_round_trip(
            ordinal in 0u8..9,
            block_num in any::<u64>(),
            buddy_num in any::<u64>(),
            data_size in any::<u64>(),
        ) {
            let meta = BlockMetadata {
                size_class: SizeClass::from_ordinal(ordinal).unwrap(),
                block_num,
                buddy_num,
                data_size,
            };
            let decoded = BlockMetadata::decode(&meta.encode()).unwrap();
            prop_assert_eq!(decoded, meta);
        }
    }
}
