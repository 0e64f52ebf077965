//! The per-worker block pool (spec.md §4.H): a cache of pre-reserved block
//! metadata, one pool per poolable size class (4 KiB–512 KiB; 1 MiB is
//! allocator-internal and never pooled).

use std::collections::VecDeque;

use buddy_core::{BlockMetadata, SizeClass};

/// A single size class's reservation cache.
pub struct BlockPool {
    class: SizeClass,
    target_free: usize,
    blocks: VecDeque<BlockMetadata>,
}

impl BlockPool {
    pub fn new(class: SizeClass, target_free: usize) -> Self {
        Self {
            class,
            target_free,
            blocks: VecDeque::new(),
        }
    }

    pub fn size(&self) -> SizeClass {
        self.class
    }

    pub fn depth(&self) -> usize {
        self.blocks.len()
    }

    pub fn acquire(&mut self) -> Option<BlockMetadata> {
        self.blocks.pop_front()
    }

    pub fn release(&mut self, metadata: BlockMetadata) {
        debug_assert_eq!(metadata.size_class, self.class, "block pool class mismatch");
        self.blocks.push_back(metadata);
    }

    pub fn needs_refill(&self) -> bool {
        self.blocks.len() < self.target_free
    }
}

/// One [`BlockPool`] per poolable size class, indexed by [`SizeClass::ordinal`].
pub struct PoolSet {
    pools: [BlockPool; SizeClass::POOLABLE.len()],
}

impl PoolSet {
    /// `target_free` is indexed the same way as [`SizeClass::POOLABLE`].
    pub fn new(target_free: [usize; SizeClass::POOLABLE.len()]) -> Self {
        let mut classes = SizeClass::POOLABLE.into_iter();
        Self {
            pools: target_free.map(|target| BlockPool::new(classes.next().unwrap(), target)),
        }
    }

    fn index_of(class: SizeClass) -> usize {
        SizeClass::POOLABLE
            .iter()
            .position(|c| *c == class)
            .expect("class must be poolable (not the macro block)")
    }

    pub fn pool_mut(&mut self, class: SizeClass) -> &mut BlockPool {
        &mut self.pools[Self::index_of(class)]
    }

    pub fn pool(&self, class: SizeClass) -> &BlockPool {
        &self.pools[Self::index_of(class)]
    }

    /// Classes whose pool is below its refill threshold, in class order.
    pub fn classes_needing_refill(&self) -> impl Iterator<Item = SizeClass> + '_ {
        self.pools.iter().filter(|p| p.needs_refill()).map(|p| p.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(class: SizeClass, block_num: u64) -> BlockMetadata {
        BlockMetadata {
            size_class: class,
            block_num,
            buddy_num: block_num ^ 1,
            data_size: 0,
        }
    }

    #[test]
    fn acquire_release_round_trip() {
        let mut pool = BlockPool::new(SizeClass::K4, 2);
        assert!(pool.acquire().is_none());
        pool.release(meta(SizeClass::K4, 0));
        assert_eq!(pool.depth(), 1);
        assert_eq!(pool.acquire(), Some(meta(SizeClass::K4, 0)));
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn needs_refill_tracks_target() {
        let mut pool = BlockPool::new(SizeClass::K8, 2);
        assert!(pool.needs_refill());
        pool.release(meta(SizeClass::K8, 0));
        assert!(pool.needs_refill());
        pool.release(meta(SizeClass::K8, 2));
        assert!(!pool.needs_refill());
    }

    #[test]
    fn pool_set_indexes_by_class() {
        let mut set = PoolSet::new([2; SizeClass::POOLABLE.len()]);
        set.pool_mut(SizeClass::K64).release(meta(SizeClass::K64, 9));
        assert_eq!(set.pool(SizeClass::K64).depth(), 1);
        assert_eq!(set.pool(SizeClass::K4).depth(), 0);

        let needing: Vec<_> = set.classes_needing_refill().collect();
        assert!(needing.contains(&SizeClass::K4));
        assert!(!needing.contains(&SizeClass::K64));
    }
}
