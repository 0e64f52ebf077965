//! The buddy allocator (spec.md §4.D): split/merge over the persistent
//! free list, temp-list reservation, and crash recovery. Every mutating
//! operation here runs inside a transaction opened by the caller (the batch
//! controller) so a cycle's worth of operations commits atomically.

use snafu::{OptionExt, ResultExt};

use crate::data_file::DataFile;
use crate::error::{
    AllocationFailedSnafu, AllocatorError, BlockAlreadyExistsSnafu, BlockNotFoundSnafu,
    CorruptKeySnafu, DataFileSnafu, InvalidMetadataRecordSnafu, InvariantViolationSnafu, StoreSnafu,
};
use crate::key::{class_prefix, decode_buddy, encode_buddy, list_key, parse_list_key, temp_scan_prefix, ListKind, FREE_PREFIX, TEMP_PREFIX};
use crate::metadata::BlockMetadata;
use crate::size_class::{buddy_of, SizeClass};
use crate::store::Transaction;

/// Safety bound on the extend-and-retry loop in `allocate_to_temp`; a real
/// deployment should never come close to exhausting it.
const MAX_EXTEND_ATTEMPTS: usize = 64;

fn parse_entry(key: &[u8], value: &[u8]) -> Result<(SizeClass, u64, u64), AllocatorError> {
    let (_, class, block_num) =
        parse_list_key(key).context(CorruptKeySnafu { key: key.to_vec() })?;
    let buddy_num = decode_buddy(value).context(CorruptKeySnafu { key: key.to_vec() })?;
    Ok((class, block_num, buddy_num))
}

fn take_free(txn: &mut dyn Transaction, class: SizeClass) -> Result<Option<(u64, u64)>, AllocatorError> {
    let prefix = class_prefix(ListKind::Free, class);
    match txn.seek_ge(&prefix).context(StoreSnafu)? {
        Some((key, value)) if key.starts_with(&prefix) => {
            let (_, block_num, buddy_num) = parse_entry(&key, &value)?;
            txn.delete(&key).context(StoreSnafu)?;
            Ok(Some((block_num, buddy_num)))
        }
        _ => Ok(None),
    }
}

fn insert_free(txn: &mut dyn Transaction, class: SizeClass, block_num: u64, buddy_num: u64) -> Result<(), AllocatorError> {
    let key = list_key(ListKind::Free, class, block_num);
    txn.put(&key, &encode_buddy(buddy_num)).context(StoreSnafu)?;
    Ok(())
}

fn insert_temp(txn: &mut dyn Transaction, meta: BlockMetadata) -> Result<(), AllocatorError> {
    let key = list_key(ListKind::Temp, meta.size_class, meta.block_num);
    txn.put(&key, &encode_buddy(meta.buddy_num)).context(StoreSnafu)?;
    Ok(())
}

/// Repeatedly halves a donor block from `(donor_class, donor_block_num)` down
/// to `target`, seeding a new free entry at every level, and reserves the
/// left-hand leaf as a temp entry (spec.md §4.D.1 "split-down").
fn split_down(
    txn: &mut dyn Transaction,
    donor_class: SizeClass,
    donor_block_num: u64,
    target: SizeClass,
) -> Result<BlockMetadata, AllocatorError> {
    let mut class = donor_class;
    let mut block_num = donor_block_num;
    while class != target {
        let child = class.split().expect("donor above target must be splittable");
        let left_num = 2 * block_num;
        let right_num = 2 * block_num + 1;
        insert_free(txn, child, right_num, buddy_of(right_num))?;
        class = child;
        block_num = left_num;
    }
    let meta = BlockMetadata {
        size_class: class,
        block_num,
        buddy_num: buddy_of(block_num),
        data_size: 0,
    };
    insert_temp(txn, meta)?;
    Ok(meta)
}

/// Extends the data file by one chunk and seeds free entries at the 512 KiB
/// class for every slot the extension created (spec.md §4.D.3).
fn extend_and_seed(txn: &mut dyn Transaction, data_file: &dyn DataFile) -> Result<(), AllocatorError> {
    let old_size = data_file.size();
    let chunk = data_file.chunk_bytes();
    data_file.extend(chunk).context(DataFileSnafu)?;

    let half_mb = SizeClass::K512.bytes();
    let base = old_size / half_mb;
    let count = chunk / half_mb;
    for i in 0..count {
        let block_num = base + i;
        insert_free(txn, SizeClass::K512, block_num, buddy_of(block_num))?;
    }
    Ok(())
}

/// Picks (or constructs, by splitting or extending) a free block of `class`
/// and moves it to the temp list.
pub fn allocate_to_temp(
    txn: &mut dyn Transaction,
    data_file: &dyn DataFile,
    class: SizeClass,
) -> Result<BlockMetadata, AllocatorError> {
    for _ in 0..MAX_EXTEND_ATTEMPTS {
        if let Some((block_num, buddy_num)) = take_free(txn, class)? {
            let meta = BlockMetadata {
                size_class: class,
                block_num,
                buddy_num,
                data_size: 0,
            };
            insert_temp(txn, meta)?;
            return Ok(meta);
        }

        let mut donor = class.merge();
        while let Some(c) = donor {
            if let Some((block_num, _buddy)) = take_free(txn, c)? {
                return split_down(txn, c, block_num, class);
            }
            donor = c.merge();
        }

        extend_and_seed(txn, data_file)?;
    }
    AllocationFailedSnafu.fail()
}

/// Removes the matching temp entry and inserts the hash-table entry. Fails
/// with `block-already-exists` if `hash` is already occupied.
pub fn occupy_from_temp(
    txn: &mut dyn Transaction,
    hash: &[u8; 32],
    meta: BlockMetadata,
) -> Result<(), AllocatorError> {
    if txn.get(hash).context(StoreSnafu)?.is_some() {
        return BlockAlreadyExistsSnafu.fail();
    }
    let temp_key = list_key(ListKind::Temp, meta.size_class, meta.block_num);
    txn.delete(&temp_key).context(StoreSnafu)?;
    txn.put(hash, &meta.encode()).context(StoreSnafu)?;
    Ok(())
}

/// Recursively merges a freed block with its buddy, bottoming out at the
/// macro block or the first non-free buddy (spec.md §4.D.2).
fn release_block(txn: &mut dyn Transaction, mut class: SizeClass, mut block_num: u64) -> Result<(), AllocatorError> {
    loop {
        if class == SizeClass::M1 {
            insert_free(txn, class, block_num, buddy_of(block_num))?;
            return Ok(());
        }

        let buddy_num = buddy_of(block_num);
        let buddy_key = list_key(ListKind::Free, class, buddy_num);
        if txn.get(&buddy_key).context(StoreSnafu)?.is_some() {
            let own_key = list_key(ListKind::Free, class, block_num);
            txn.delete(&own_key).context(StoreSnafu)?;
            txn.delete(&buddy_key).context(StoreSnafu)?;
            class = class.merge().expect("checked not M1 above");
            block_num /= 2;
        } else {
            insert_free(txn, class, block_num, buddy_num)?;
            return Ok(());
        }
    }
}

/// Removes the hash-table entry and returns the block to the free list,
/// merging upward where possible.
pub fn release(txn: &mut dyn Transaction, hash: &[u8; 32]) -> Result<(), AllocatorError> {
    let value = txn.get(hash).context(StoreSnafu)?.context(BlockNotFoundSnafu)?;
    let meta = BlockMetadata::decode(&value).context(InvalidMetadataRecordSnafu)?;
    txn.delete(hash).context(StoreSnafu)?;
    release_block(txn, meta.size_class, meta.block_num)
}

/// Read-only lookup; fails `block-not-found` if absent.
pub fn get(txn: &mut dyn Transaction, hash: &[u8; 32]) -> Result<BlockMetadata, AllocatorError> {
    let value = txn.get(hash).context(StoreSnafu)?.context(BlockNotFoundSnafu)?;
    BlockMetadata::decode(&value).context(InvalidMetadataRecordSnafu)
}

pub fn has(txn: &mut dyn Transaction, hash: &[u8; 32]) -> Result<bool, AllocatorError> {
    Ok(txn.get(hash).context(StoreSnafu)?.is_some())
}

/// Moves every temp entry back to the free list. Must run once at startup,
/// before any other allocator operation or any accepted connection
/// (spec.md §4.D.4).
pub fn recover_temp(txn: &mut dyn Transaction) -> Result<(), AllocatorError> {
    let prefix = temp_scan_prefix();
    loop {
        match txn.seek_ge(&prefix).context(StoreSnafu)? {
            Some((key, value)) if key.starts_with(&prefix) => {
                let (class, block_num, buddy_num) = parse_entry(&key, &value)?;
                insert_free(txn, class, block_num, buddy_num)?;
                txn.delete(&key).context(StoreSnafu)?;
            }
            _ => return Ok(()),
        }
    }
}

/// Free/temp/occupied counts per size class, as produced by
/// `startup_self_check`.
#[derive(Debug, Clone, Copy)]
pub struct ClassCounts {
    pub free: [u64; SizeClass::COUNT],
    pub temp: [u64; SizeClass::COUNT],
    pub occupied: [u64; SizeClass::COUNT],
}

impl ClassCounts {
    fn zeroed() -> Self {
        Self {
            free: [0; SizeClass::COUNT],
            temp: [0; SizeClass::COUNT],
            occupied: [0; SizeClass::COUNT],
        }
    }
}

/// Counts entries at or past `prefix` that still match it, without mutating
/// the table: each match advances the cursor to one byte past its own key,
/// since `seek_ge` only ever hands back the smallest key `>= cursor`.
fn count_prefix(txn: &mut dyn Transaction, prefix: &[u8]) -> Result<u64, AllocatorError> {
    let mut cursor = prefix.to_vec();
    let mut count = 0u64;
    loop {
        match txn.seek_ge(&cursor).context(StoreSnafu)? {
            Some((key, _)) if key.starts_with(prefix) => {
                count += 1;
                cursor = key;
                cursor.push(0);
            }
            _ => return Ok(count),
        }
    }
}

/// Walks every key in the table, classifying anything outside the free/temp
/// prefixes as a hash-table entry and tallying it by size class.
fn count_occupied_by_class(txn: &mut dyn Transaction) -> Result<[u64; SizeClass::COUNT], AllocatorError> {
    let mut counts = [0u64; SizeClass::COUNT];
    let mut cursor = Vec::new();
    loop {
        match txn.seek_ge(&cursor).context(StoreSnafu)? {
            Some((key, value)) => {
                if !key.starts_with(FREE_PREFIX.as_bytes()) && !key.starts_with(TEMP_PREFIX.as_bytes()) {
                    if let Ok(meta) = BlockMetadata::decode(&value) {
                        counts[meta.size_class.ordinal() as usize] += 1;
                    }
                }
                cursor = key;
                cursor.push(0);
            }
            None => return Ok(counts),
        }
    }
}

/// Validates invariant 5 (file size is a non-negative multiple of the
/// macro-block chunk used by the extender) and tallies free/temp/occupied
/// blocks per class. Run once at startup, after `recover_temp` and before
/// any worker accepts connections.
pub fn startup_self_check(txn: &mut dyn Transaction, data_file: &dyn DataFile) -> Result<ClassCounts, AllocatorError> {
    let size = data_file.size();
    let chunk = data_file.chunk_bytes();
    if chunk != 0 && size % chunk != 0 {
        return InvariantViolationSnafu {
            detail: format!("data file size {size} is not a multiple of the macro chunk {chunk}"),
        }
        .fail();
    }

    let mut counts = ClassCounts::zeroed();
    for class in SizeClass::ALL {
        let ordinal = class.ordinal() as usize;
        counts.free[ordinal] = count_prefix(txn, &class_prefix(ListKind::Free, class))?;
        counts.temp[ordinal] = count_prefix(txn, &class_prefix(ListKind::Temp, class))?;
    }
    counts.occupied = count_occupied_by_class(txn)?;
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_file::FileDataController;
    use crate::store::StoreError;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// An in-memory `Transaction` used only for allocator unit tests.
    struct MemTxn<'a> {
        table: &'a Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    }

    impl<'a> Transaction for MemTxn<'a> {
        fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
            Ok(self.table.lock().unwrap().get(key).cloned())
        }

        fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
            self.table.lock().unwrap().insert(key.to_vec(), value.to_vec());
            Ok(())
        }

        fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
            self.table.lock().unwrap().remove(key);
            Ok(())
        }

        fn seek_ge(&mut self, prefix: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
            Ok(self
                .table
                .lock()
                .unwrap()
                .range(prefix.to_vec()..)
                .next()
                .map(|(k, v)| (k.clone(), v.clone())))
        }

        fn commit(self: Box<Self>) -> Result<(), StoreError> {
            Ok(())
        }

        fn abort(self: Box<Self>) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn new_table() -> Mutex<BTreeMap<Vec<u8>, Vec<u8>>> {
        Mutex::new(BTreeMap::new())
    }

    #[test]
    fn allocate_extends_on_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let data_file = FileDataController::open(dir.path().join("data"), 1).unwrap();
        let table = new_table();
        let mut txn = MemTxn { table: &table };

        let meta = allocate_to_temp(&mut txn, &data_file, SizeClass::K4).unwrap();
        assert_eq!(meta.size_class, SizeClass::K4);
        assert_eq!(data_file.size(), SizeClass::M1.bytes());
    }

    #[test]
    fn split_down_seeds_intermediate_free_entries() {
        let dir = tempfile::tempdir().unwrap();
        let data_file = FileDataController::open(dir.path().join("data"), 1).unwrap();
        let table = new_table();
        let mut txn = MemTxn { table: &table };

        let meta = allocate_to_temp(&mut txn, &data_file, SizeClass::K4).unwrap();
        assert_eq!(meta.block_num, 0);

        // Every level between 1 MiB and 4 KiB should have a free right-hand entry.
        for class in [
            SizeClass::K8,
            SizeClass::K16,
            SizeClass::K32,
            SizeClass::K64,
            SizeClass::K128,
            SizeClass::K256,
            SizeClass::K512,
        ] {
            let key = list_key(ListKind::Free, class, 1);
            assert!(table.lock().unwrap().contains_key(&key), "missing free entry at {:?}", class);
        }
    }

    #[test]
    fn occupy_then_release_returns_block_to_free_list() {
        let dir = tempfile::tempdir().unwrap();
        let data_file = FileDataController::open(dir.path().join("data"), 1).unwrap();
        let table = new_table();
        let mut txn = MemTxn { table: &table };

        let meta = allocate_to_temp(&mut txn, &data_file, SizeClass::K4).unwrap();
        let hash = [1u8; 32];
        let occupied = BlockMetadata { data_size: 10, ..meta };
        occupy_from_temp(&mut txn, &hash, occupied).unwrap();

        assert!(has(&mut txn, &hash).unwrap());
        assert_eq!(get(&mut txn, &hash).unwrap().data_size, 10);

        release(&mut txn, &hash).unwrap();
        assert!(!has(&mut txn, &hash).unwrap());
        assert!(matches!(get(&mut txn, &hash).unwrap_err(), AllocatorError::BlockNotFound));
    }

    #[test]
    fn duplicate_occupy_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let data_file = FileDataController::open(dir.path().join("data"), 1).unwrap();
        let table = new_table();
        let mut txn = MemTxn { table: &table };

        let meta = allocate_to_temp(&mut txn, &data_file, SizeClass::K4).unwrap();
        let hash = [2u8; 32];
        occupy_from_temp(&mut txn, &hash, BlockMetadata { data_size: 1, ..meta }).unwrap();

        let meta2 = allocate_to_temp(&mut txn, &data_file, SizeClass::K4).unwrap();
        let err = occupy_from_temp(&mut txn, &hash, BlockMetadata { data_size: 1, ..meta2 }).unwrap_err();
        assert!(matches!(err, AllocatorError::BlockAlreadyExists));
    }

    #[test]
    fn buddies_merge_on_double_release() {
        let dir = tempfile::tempdir().unwrap();
        let data_file = FileDataController::open(dir.path().join("data"), 1).unwrap();
        let table = new_table();
        let mut txn = MemTxn { table: &table };

        let a = allocate_to_temp(&mut txn, &data_file, SizeClass::K4).unwrap();
        let b = allocate_to_temp(&mut txn, &data_file, SizeClass::K4).unwrap();
        assert_eq!((a.block_num, b.block_num), (0, 1));

        let hash_a = [3u8; 32];
        let hash_b = [4u8; 32];
        occupy_from_temp(&mut txn, &hash_a, BlockMetadata { data_size: 1, ..a }).unwrap();
        occupy_from_temp(&mut txn, &hash_b, BlockMetadata { data_size: 1, ..b }).unwrap();

        release(&mut txn, &hash_a).unwrap();
        release(&mut txn, &hash_b).unwrap();

        assert!(!table.lock().unwrap().contains_key(&list_key(ListKind::Free, SizeClass::K4, 0)));
        assert!(!table.lock().unwrap().contains_key(&list_key(ListKind::Free, SizeClass::K4, 1)));
        assert!(table.lock().unwrap().contains_key(&list_key(ListKind::Free, SizeClass::K8, 0)));
    }

    #[test]
    fn recover_temp_reclaims_orphaned_reservation() {
        let dir = tempfile::tempdir().unwrap();
        let data_file = FileDataController::open(dir.path().join("data"), 1).unwrap();
        let table = new_table();
        let mut txn = MemTxn { table: &table };

        let meta = allocate_to_temp(&mut txn, &data_file, SizeClass::K4).unwrap();
        // Simulate a crash: the worker never calls occupy_from_temp.
        assert!(table.lock().unwrap().contains_key(&list_key(ListKind::Temp, meta.size_class, meta.block_num)));

        recover_temp(&mut txn).unwrap();
        assert!(!table.lock().unwrap().contains_key(&list_key(ListKind::Temp, meta.size_class, meta.block_num)));
        assert!(table.lock().unwrap().contains_key(&list_key(ListKind::Free, meta.size_class, meta.block_num)));

        // The reclaimed block is reused for the next allocation at the same class.
        let reused = allocate_to_temp(&mut txn, &data_file, SizeClass::K4).unwrap();
        assert_eq!(reused.block_num, meta.block_num);
    }

    #[test]
    fn startup_self_check_counts_free_temp_occupied_per_class() {
        let dir = tempfile::tempdir().unwrap();
        let data_file = FileDataController::open(dir.path().join("data"), 1).unwrap();
        let table = new_table();
        let mut txn = MemTxn { table: &table };

        let a = allocate_to_temp(&mut txn, &data_file, SizeClass::K4).unwrap();
        let b = allocate_to_temp(&mut txn, &data_file, SizeClass::K4).unwrap();
        occupy_from_temp(&mut txn, &[9u8; 32], BlockMetadata { data_size: 1, ..a }).unwrap();
        // b stays on the temp list, as if the worker had crashed before occupying it.

        let counts = startup_self_check(&mut txn, &data_file).unwrap();
        assert_eq!(counts.occupied[SizeClass::K4.ordinal() as usize], 1);
        assert_eq!(counts.temp[SizeClass::K4.ordinal() as usize], 1);
        // Splitting K4 out of the M1 donor left a free entry at every
        // intermediate class.
        assert_eq!(counts.free[SizeClass::K8.ordinal() as usize], 1);
        let _ = b;
    }

    #[test]
    fn startup_self_check_rejects_file_size_not_a_multiple_of_chunk() {
        struct FixedSizeDataFile;
        impl DataFile for FixedSizeDataFile {
            fn size(&self) -> u64 {
                SizeClass::M1.bytes() + 1
            }
            fn extend(&self, _additional_bytes: u64) -> Result<(), crate::data_file::DataFileError> {
                unimplemented!()
            }
            fn chunk_bytes(&self) -> u64 {
                SizeClass::M1.bytes()
            }
        }

        let table = new_table();
        let mut txn = MemTxn { table: &table };
        let err = startup_self_check(&mut txn, &FixedSizeDataFile).unwrap_err();
        assert!(matches!(err, AllocatorError::InvariantViolation { .. }));
    }
}
