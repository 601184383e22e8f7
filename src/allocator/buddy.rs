//! Buddy allocator over the mapped space.
//!
//! Blocks are power-of-two sized and self-aligned, with orders between
//! [`MIN_ORDER`](super::MIN_ORDER) and [`MAX_ORDER`](super::MAX_ORDER). Free
//! blocks of each order sit in an address-ordered set; an allocation miss
//! splits the next order up, and when even the top order is empty the space
//! grows by one max-order block. The bitmap is the persistent record: on
//! reload the free sets are rebuilt from it.

use super::bitmap::BlockBitmap;
use super::{MAX_BLOCK_SIZE, MIN_ORDER, ORDER_COUNT};
use crate::error::{Result, StorageError};
use crate::mapper::SpaceMapper;
use std::collections::BTreeSet;

pub struct Buddy<M> {
    mapper: M,
    space_size: usize,
    used_size: usize,
    mapped_size: usize,
    allocated_size: usize,
    bitmap: BlockBitmap,
    /// Free blocks per order, keyed by block offset.
    free_blocks: [BTreeSet<i64>; ORDER_COUNT],
}

/// State read back from a file header, fed to [`Buddy::restore`].
pub(crate) struct BuddySnapshot {
    pub space_size: usize,
    pub used_size: usize,
    pub mapped_size: usize,
    pub allocated_size: usize,
    pub bitmap: Vec<u8>,
}

impl<M: SpaceMapper> Buddy<M> {
    pub fn new(mapper: M) -> Self {
        Buddy {
            mapper,
            space_size: 0,
            used_size: 0,
            mapped_size: 0,
            allocated_size: 0,
            bitmap: BlockBitmap::new(),
            free_blocks: std::array::from_fn(|_| BTreeSet::new()),
        }
    }

    /// Adopt previously persisted state. The mapping must already cover
    /// `mapped_size`; no I/O happens here.
    pub(crate) fn restore(&mut self, snapshot: BuddySnapshot) {
        self.space_size = snapshot.space_size;
        self.used_size = snapshot.used_size;
        self.mapped_size = snapshot.mapped_size;
        self.allocated_size = snapshot.allocated_size;
        self.bitmap = BlockBitmap::from_bytes(snapshot.bitmap);

        let bitmap = &self.bitmap;
        let free_blocks = &mut self.free_blocks;
        bitmap.for_each_free_block(|block, order| {
            free_blocks[(order - MIN_ORDER) as usize].insert(block);
        });
    }

    /// Allocate a block of at least `block_size` bytes; returns the block
    /// offset and its actual (power-of-two) size.
    pub fn allocate_block(&mut self, block_size: usize) -> Result<(i64, usize)> {
        if block_size > MAX_BLOCK_SIZE {
            return Err(StorageError::BlockTooLarge(block_size));
        }

        let index = free_list_index(block_size);
        let block = self.pop_free_block(index);
        let actual_size = order_size(index);
        self.allocated_size += actual_size;
        self.bitmap.allocate_block(block, MIN_ORDER + index as u32);

        let block_end = block as usize + actual_size;
        if block_end > self.used_size {
            if block_end > self.mapped_size {
                if let Err(err) = self.map_space(block_end) {
                    let _ = self.free_block(block);
                    return Err(err);
                }
            }
            self.used_size = block_end;
        }

        Ok((block, actual_size))
    }

    /// Release the block at `block`, coalescing it with free buddies. When
    /// the freed block ends at the high-water mark, the mark walks back
    /// across the free tail and the mapping shrinks at half occupancy.
    pub fn free_block(&mut self, block: i64) -> Result<()> {
        if block < 0 || block as usize >= self.space_size {
            return Err(StorageError::InvalidBlock(block));
        }

        let order = self
            .bitmap
            .free_block(block)
            .ok_or(StorageError::InvalidBlock(block))?;
        let block_size = 1usize << order;
        let shrink_used = block as usize + block_size == self.used_size;
        let (mut block, index) = self.push_free_block(block, (order - MIN_ORDER) as usize);
        self.allocated_size -= block_size;

        if shrink_used {
            if index == ORDER_COUNT - 1 {
                // Step back across whole free max-order blocks first.
                loop {
                    let prev = block - MAX_BLOCK_SIZE as i64;
                    if !self.free_blocks[ORDER_COUNT - 1].contains(&prev) {
                        break;
                    }
                    block = prev;
                }
            }

            // Below a max-order boundary the free tail holds at most one
            // free block per order, in descending order.
            for lower in (0..index).rev() {
                let prev = block - order_size(lower) as i64;
                if self.free_blocks[lower].contains(&prev) {
                    block = prev;
                }
            }

            self.used_size = block as usize;

            if self.used_size < self.mapped_size / 2 {
                return self.map_space(self.used_size);
            }
        }

        Ok(())
    }

    /// The size of the block at `block`.
    pub fn block_size(&self, block: i64) -> Result<usize> {
        if block < 0 || block as usize >= self.space_size {
            return Err(StorageError::InvalidBlock(block));
        }

        match self.bitmap.block_order(block) {
            Some(order) => Ok(1 << order),
            None => Err(StorageError::InvalidBlock(block)),
        }
    }

    /// Discard trailing free max-order blocks from the space.
    pub fn shrink_space(&mut self) {
        while self.space_size > 0 {
            let block = (self.space_size - MAX_BLOCK_SIZE) as i64;
            if !self.free_blocks[ORDER_COUNT - 1].remove(&block) {
                return;
            }
            self.space_size -= MAX_BLOCK_SIZE;
            self.bitmap.shrink();
            tracing::trace!(space_size = self.space_size, "shrank space");
        }
    }

    pub fn space_size(&self) -> usize {
        self.space_size
    }

    pub fn used_size(&self) -> usize {
        self.used_size
    }

    pub fn mapped_size(&self) -> usize {
        self.mapped_size
    }

    pub fn allocated_size(&self) -> usize {
        self.allocated_size
    }

    pub(crate) fn bitmap_bytes(&self) -> &[u8] {
        self.bitmap.as_bytes()
    }

    pub fn mapper(&self) -> &M {
        &self.mapper
    }

    pub fn mapper_mut(&mut self) -> &mut M {
        &mut self.mapper
    }

    /// The mapped data region; invalidated by any call that remaps.
    pub fn space(&self) -> &[u8] {
        self.mapper.space()
    }

    pub fn space_mut(&mut self) -> &mut [u8] {
        self.mapper.space_mut()
    }

    fn pop_free_block(&mut self, index: usize) -> i64 {
        if let Some(block) = self.free_blocks[index].pop_first() {
            return block;
        }

        if index == ORDER_COUNT - 1 {
            return self.expand_space();
        }

        let block = self.pop_free_block(index + 1);
        let buddy = block + order_size(index) as i64;
        self.free_blocks[index].insert(buddy);
        block
    }

    fn push_free_block(&mut self, mut block: i64, mut index: usize) -> (i64, usize) {
        loop {
            if index == ORDER_COUNT - 1 {
                self.free_blocks[index].insert(block);
                return (block, index);
            }

            let buddy = block ^ order_size(index) as i64;
            if !self.free_blocks[index].remove(&buddy) {
                self.free_blocks[index].insert(block);
                return (block, index);
            }

            block = block.min(buddy);
            index += 1;
        }
    }

    fn expand_space(&mut self) -> i64 {
        let block = self.space_size as i64;
        self.space_size += MAX_BLOCK_SIZE;
        self.bitmap.expand();
        tracing::trace!(space_size = self.space_size, "expanded space");
        block
    }

    fn map_space(&mut self, used_size: usize) -> Result<()> {
        let mapped_size = next_power_of_two(used_size);
        self.mapper.map_space(mapped_size)?;
        self.mapped_size = mapped_size;
        Ok(())
    }
}

fn free_list_index(block_size: usize) -> usize {
    let mut index = 0;
    while order_size(index) < block_size {
        index += 1;
    }
    index
}

fn order_size(index: usize) -> usize {
    1 << (MIN_ORDER as usize + index)
}

fn next_power_of_two(n: usize) -> usize {
    if n == 0 {
        0
    } else {
        n.next_power_of_two()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::MIN_BLOCK_SIZE;
    use crate::mapper::NullSpaceMapper;
    use rand::prelude::*;

    fn make_buddy() -> (Buddy<NullSpaceMapper>, Vec<(i64, usize)>) {
        let mut rng = StdRng::seed_from_u64(0x5EED);
        let mut buddy = Buddy::new(NullSpaceMapper);
        let mut blocks = Vec::with_capacity(4000);

        for _ in 0..4000 {
            // Heavily skewed toward small blocks, with the odd giant.
            let base = rng.gen_range(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE);
            let mut f: f64 = rng.gen();
            for _ in 0..4 {
                f *= f;
            }
            let want = (base as f64 * f) as usize;
            let (block, size) = buddy.allocate_block(want).unwrap();
            assert!(size >= want);
            blocks.push((block, size));
        }

        (buddy, blocks)
    }

    #[test]
    fn test_allocated_blocks_are_disjoint_and_sized() {
        let (buddy, mut blocks) = make_buddy();
        blocks.sort_unstable();

        let mut last_end = 0i64;
        for &(block, size) in &blocks {
            assert!(block >= last_end);
            assert_eq!(buddy.block_size(block).unwrap(), size);
            last_end = block + size as i64;
        }
    }

    #[test]
    fn test_free_is_not_idempotent() {
        let (mut buddy, mut blocks) = make_buddy();
        blocks.shuffle(&mut StdRng::seed_from_u64(7));

        for &(block, _) in &blocks {
            buddy.free_block(block).unwrap();
            assert!(matches!(
                buddy.free_block(block),
                Err(StorageError::InvalidBlock(_))
            ));
            assert!(buddy.block_size(block).is_err());
        }

        // Everything coalesced back: the next allocation starts at zero.
        let (block, _) = buddy.allocate_block(0).unwrap();
        assert_eq!(block, 0);
    }

    #[test]
    fn test_shrink_space_reclaims_everything() {
        let (mut buddy, blocks) = make_buddy();
        for &(block, _) in &blocks {
            buddy.free_block(block).unwrap();
        }

        buddy.shrink_space();
        assert_eq!(buddy.space_size(), 0);
        assert_eq!(buddy.used_size(), 0);
        assert_eq!(buddy.allocated_size(), 0);
    }

    #[test]
    fn test_used_size_tracks_the_highest_live_block() {
        let (mut buddy, mut blocks) = make_buddy();
        blocks.sort_unstable();

        let survivor = blocks.len() / 2;
        for (i, &(block, _)) in blocks.iter().enumerate() {
            if i != survivor {
                buddy.free_block(block).unwrap();
            }
        }

        let (block, size) = blocks[survivor];
        assert_eq!(buddy.used_size(), block as usize + size);
        assert_eq!(buddy.allocated_size(), size);

        buddy.free_block(block).unwrap();
        assert_eq!(buddy.used_size(), 0);
        assert_eq!(buddy.allocated_size(), 0);
    }

    #[test]
    fn test_block_too_large() {
        let mut buddy = Buddy::new(NullSpaceMapper);
        assert!(buddy.allocate_block(MAX_BLOCK_SIZE).is_ok());
        assert!(matches!(
            buddy.allocate_block(MAX_BLOCK_SIZE + 1),
            Err(StorageError::BlockTooLarge(_))
        ));
    }

    #[test]
    fn test_restore_rebuilds_free_sets() {
        let mut buddy = Buddy::new(NullSpaceMapper);
        let (a, _) = buddy.allocate_block(MIN_BLOCK_SIZE).unwrap();
        let (b, _) = buddy.allocate_block(3 * MIN_BLOCK_SIZE).unwrap();
        buddy.free_block(a).unwrap();

        let snapshot = BuddySnapshot {
            space_size: buddy.space_size(),
            used_size: buddy.used_size(),
            mapped_size: buddy.mapped_size(),
            allocated_size: buddy.allocated_size(),
            bitmap: buddy.bitmap_bytes().to_vec(),
        };

        let mut reloaded = Buddy::new(NullSpaceMapper);
        reloaded.restore(snapshot);
        assert_eq!(reloaded.block_size(b).unwrap(), 4 * MIN_BLOCK_SIZE);

        // The freed low block is available again at its old offset.
        let (again, _) = reloaded.allocate_block(MIN_BLOCK_SIZE).unwrap();
        assert_eq!(again, a);

        reloaded.free_block(again).unwrap();
        reloaded.free_block(b).unwrap();
        reloaded.shrink_space();
        assert_eq!(reloaded.space_size(), 0);
    }
}
