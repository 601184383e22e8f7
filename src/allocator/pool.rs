//! Chunk pool over the buddy allocator.
//!
//! Requests below a block's worth of payload are carved out of shared
//! 4 KiB buddy blocks. Each pool block starts with a header (pooled-list
//! link, free-list anchor, counters, state byte) followed by chunks; free
//! chunks form a singly-linked list kept in ascending offset order, and
//! every chunk carries an 8-byte header (`next`, `size`). The low bits of a
//! returned offset encode the chunk position inside its block, so one i64
//! identifies either a whole buddy block or a chunk.
//!
//! Blocks that repeatedly fail to satisfy requests are dismissed from the
//! pooled list until a free gives them usable space again; blocks with no
//! free chunk left are parked as exhausted.

use super::buddy::Buddy;
use super::MIN_BLOCK_SIZE;
use crate::bytes::{get_i32, put_i32};
use crate::error::{Result, StorageError};
use crate::list::{MappedList, LINK_SIZE, LIST_STORE_SIZE};
use crate::mapper::SpaceMapper;

/// Pool blocks are single buddy blocks of the minimum order.
pub const BLOCK_SIZE: usize = MIN_BLOCK_SIZE;

/// Link record, free-list anchor (i32), total/max free sizes (i32 each),
/// miss count (i8), state (u8).
const BLOCK_HEADER_SIZE: usize = LINK_SIZE + 14;

/// `next` and `size`, each 4 bytes, ahead of every chunk payload.
pub const CHUNK_HEADER_SIZE: usize = 8;

const MIN_CHUNK_SIZE: usize = CHUNK_HEADER_SIZE + 8;

/// Largest chunk a pool block accepts: carving it must leave room for a
/// remainder chunk after the block header.
const MAX_CHUNK_SIZE: usize = BLOCK_SIZE - BLOCK_HEADER_SIZE - MIN_CHUNK_SIZE;

const MAX_MISS_COUNT: i8 = 3;

/// Sentinel stored in a chunk's `next` field while it is allocated.
const CHUNK_ALLOC_MARK: i32 = -0xBADBEEF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Pooled,
    Dismissed,
    Exhausted,
}

impl BlockState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => BlockState::Dismissed,
            2 => BlockState::Exhausted,
            _ => BlockState::Pooled,
        }
    }
}

pub struct Pool {
    pooled_blocks: MappedList,
    dismissed_space_size: usize,
}

impl Pool {
    pub fn new() -> Self {
        Pool {
            pooled_blocks: MappedList::new(),
            dismissed_space_size: 0,
        }
    }

    /// Rehydrate the pooled-block list and dismissed counter from header
    /// state; the link bytes themselves already sit inside their blocks.
    pub(crate) fn restore(&mut self, list_descriptor: &[u8], dismissed_space_size: usize) {
        self.pooled_blocks = MappedList::load(list_descriptor);
        self.dismissed_space_size = dismissed_space_size;
    }

    pub(crate) fn store_pooled_block_list(&self, buffer: &mut [u8; LIST_STORE_SIZE]) {
        self.pooled_blocks.store(buffer);
    }

    pub fn dismissed_space_size(&self) -> usize {
        self.dismissed_space_size
    }

    /// Allocate `space_size` bytes; returns the space offset and the actual
    /// usable size. Requests too large for a chunk go straight to the buddy
    /// allocator, so their offsets are block-aligned.
    ///
    /// # Panics
    ///
    /// Panics when `space_size` exceeds the maximum block size; callers are
    /// expected to size requests sanely.
    pub fn allocate_space<M: SpaceMapper>(
        &mut self,
        buddy: &mut Buddy<M>,
        space_size: usize,
    ) -> Result<(i64, usize)> {
        let want = CHUNK_HEADER_SIZE + space_size;
        if want <= MAX_CHUNK_SIZE {
            let want = want.max(MIN_CHUNK_SIZE);
            let (block, chunk, chunk_size) = self.allocate_chunk(buddy, want)?;
            return Ok((chunk_space(block, chunk), chunk_size - CHUNK_HEADER_SIZE));
        }

        match buddy.allocate_block(space_size) {
            Ok(allocation) => Ok(allocation),
            Err(err @ StorageError::BlockTooLarge(_)) => panic!("{err}"),
            Err(err) => Err(err),
        }
    }

    /// Release the space at `space`.
    ///
    /// # Panics
    ///
    /// Panics when `space` does not name a live allocation.
    pub fn free_space<M: SpaceMapper>(&mut self, buddy: &mut Buddy<M>, space: i64) {
        match parse_chunk_space(space) {
            Some((block, chunk)) => self.free_chunk(buddy, block, chunk),
            None => {
                if let Err(err) = buddy.free_block(space) {
                    panic!("freeing invalid space {space}: {err}");
                }
            }
        }
    }

    /// The usable size of the space at `space`.
    ///
    /// # Panics
    ///
    /// Panics when `space` does not name a live allocation.
    pub fn space_size<M: SpaceMapper>(&self, buddy: &Buddy<M>, space: i64) -> usize {
        match parse_chunk_space(space) {
            Some((block, chunk)) => {
                let space_bytes = buddy.space();
                if chunk_next(space_bytes, block, chunk) != CHUNK_ALLOC_MARK {
                    panic!("invalid chunk {chunk} in block {block}");
                }
                chunk_size(space_bytes, block, chunk) as usize - CHUNK_HEADER_SIZE
            }
            None => match buddy.block_size(space) {
                Ok(block_size) => block_size,
                Err(err) => panic!("sizing invalid space {space}: {err}"),
            },
        }
    }

    /// Scan the pooled blocks for one that can host a chunk of `want`
    /// bytes, creating a fresh block when none fits. Blocks that miss
    /// `MAX_MISS_COUNT` times in a row are dismissed from the list.
    fn allocate_chunk<M: SpaceMapper>(
        &mut self,
        buddy: &mut Buddy<M>,
        want: usize,
    ) -> Result<(i64, i32, usize)> {
        let mut cursor = self.pooled_blocks.cursor();

        loop {
            let space = buddy.space_mut();
            let Some(block) = cursor.next(space) else { break };

            // max_free of 0 means unknown; anything else is a hard bound.
            let cached_max = block_max_free(space, block);
            if !(cached_max >= 1 && want > cached_max as usize) {
                if let Some((chunk, chunk_size)) = self.split_chunk(space, block, want) {
                    set_block_miss_count(space, block, 0);
                    return Ok((block, chunk, chunk_size));
                }
            }

            let miss_count = block_miss_count(space, block) + 1;
            set_block_miss_count(space, block, miss_count);
            if miss_count < MAX_MISS_COUNT {
                continue;
            }

            set_block_state(space, block, BlockState::Dismissed);
            self.pooled_blocks.remove(space, block);
            self.dismissed_space_size += block_total_free(space, block) as usize;
            tracing::trace!(block, "dismissed pool block");
        }

        let (block, chunk) = self.allocate_block(buddy, want)?;
        Ok((block, chunk, want))
    }

    /// First-fit walk of `block`'s free-chunk list. A fitting chunk is
    /// marked allocated and its tail is split off as a remainder chunk when
    /// large enough to stand alone; the block moves to the list head. On a
    /// miss the cached max free size is refreshed from the chunks seen.
    fn split_chunk(
        &mut self,
        space: &mut [u8],
        block: i64,
        mut want: usize,
    ) -> Option<(i32, usize)> {
        let mut chunk = block_first_free(space, block);
        let mut prev_chunk: i32 = 0;
        let mut largest_seen = 0usize;

        loop {
            let size = chunk_size(space, block, chunk) as usize;
            let next = chunk_next(space, block, chunk);

            if size >= want {
                set_chunk_next(space, block, chunk, CHUNK_ALLOC_MARK);
                let mut remainder = size - want;
                let mut link = next;

                if remainder < MIN_CHUNK_SIZE {
                    want = size;
                    remainder = 0;
                } else {
                    set_chunk_size(space, block, chunk, want as i32);
                    let remainder_chunk = chunk + want as i32;
                    set_chunk_next(space, block, remainder_chunk, next);
                    set_chunk_size(space, block, remainder_chunk, remainder as i32);
                    link = remainder_chunk;
                }

                if prev_chunk == 0 {
                    set_block_first_free(space, block, link);
                } else {
                    set_chunk_next(space, block, prev_chunk, link);
                }

                let total = block_total_free(space, block) as usize - want;
                set_block_total_free(space, block, total as i32);
                self.pooled_blocks.set_head(space, block);

                if total == 0 {
                    set_block_max_free(space, block, 0);
                    set_block_state(space, block, BlockState::Exhausted);
                    self.pooled_blocks.remove(space, block);
                } else if remainder >= total - remainder {
                    set_block_max_free(space, block, remainder as i32);
                } else {
                    let cached_max = block_max_free(space, block);
                    if cached_max >= 1 && size == cached_max as usize {
                        // The chunk backing the cache is gone; force a rescan.
                        set_block_max_free(space, block, 0);
                    }
                }

                return Some((chunk, want));
            }

            largest_seen = largest_seen.max(size);
            prev_chunk = chunk;
            chunk = next;
            if chunk < 1 {
                break;
            }
        }

        set_block_max_free(space, block, largest_seen as i32);
        None
    }

    fn free_chunk<M: SpaceMapper>(&mut self, buddy: &mut Buddy<M>, block: i64, chunk: i32) {
        let release = {
            let space = buddy.space_mut();

            let miss_count = block_miss_count(space, block);
            if miss_count >= 1 {
                if block_state(space, block) == BlockState::Dismissed {
                    set_block_miss_count(space, block, 0);
                    set_block_state(space, block, BlockState::Pooled);
                    self.pooled_blocks.append(space, block);
                    self.dismissed_space_size -= block_total_free(space, block) as usize;
                    tracing::trace!(block, "restored dismissed pool block");
                } else {
                    set_block_miss_count(space, block, miss_count - 1);
                }
            }

            let merged_size = self.merge_chunk(space, block, chunk);
            if merged_size > MAX_CHUNK_SIZE {
                // The block is one free chunk again; hand it back whole.
                self.pooled_blocks.remove(space, block);
                true
            } else {
                false
            }
        };

        if release {
            if let Err(err) = buddy.free_block(block) {
                panic!("releasing pool block {block}: {err}");
            }
        }
    }

    /// Insert the freed chunk into the ascending free list, merging with an
    /// adjacent predecessor and/or successor. Returns the size of the chunk
    /// it ends up part of.
    fn merge_chunk(&mut self, space: &mut [u8], block: i64, mut chunk: i32) -> usize {
        if chunk_next(space, block, chunk) != CHUNK_ALLOC_MARK {
            panic!("invalid chunk {chunk} in block {block}");
        }

        let freed_size = chunk_size(space, block, chunk) as usize;
        let mut chunk_end = chunk + freed_size as i32;
        let mut current = block_first_free(space, block);
        let mut prev_chunk: i32 = 0;

        loop {
            if current < 1 {
                set_chunk_next(space, block, chunk, 0);
                if prev_chunk == 0 {
                    set_block_first_free(space, block, chunk);
                } else {
                    set_chunk_next(space, block, prev_chunk, chunk);
                }
                break;
            }

            let current_end = current + chunk_size(space, block, current);
            let current_next = chunk_next(space, block, current);

            if chunk_end <= current {
                if chunk_end < current {
                    set_chunk_next(space, block, chunk, current);
                } else {
                    // Absorb the successor.
                    set_chunk_next(space, block, chunk, current_next);
                    set_chunk_size(space, block, chunk, current_end - chunk);
                    chunk_end = current_end;
                }

                if prev_chunk == 0 {
                    set_block_first_free(space, block, chunk);
                } else {
                    set_chunk_next(space, block, prev_chunk, chunk);
                }
                break;
            }

            if chunk == current_end {
                // Absorb into the predecessor and keep walking for the
                // successor merge.
                set_chunk_size(space, block, current, chunk_end - current);
                set_chunk_next(space, block, chunk, 0);
                chunk = current;
            } else {
                prev_chunk = current;
            }

            current = current_next;
        }

        let total = block_total_free(space, block) as usize + freed_size;
        set_block_total_free(space, block, total as i32);
        let merged_size = (chunk_end - chunk) as usize;

        if block_state(space, block) == BlockState::Exhausted {
            set_block_max_free(space, block, merged_size as i32);
            set_block_state(space, block, BlockState::Pooled);
            self.pooled_blocks.prepend(space, block);
        } else {
            if merged_size >= total - merged_size {
                set_block_max_free(space, block, merged_size as i32);
            } else {
                let cached_max = block_max_free(space, block);
                if cached_max >= 1 && merged_size > cached_max as usize {
                    set_block_max_free(space, block, merged_size as i32);
                }
            }

            self.pooled_blocks.remove(space, block);
            self.pooled_blocks.prepend(space, block);
        }

        merged_size
    }

    /// Pull a fresh block from the buddy allocator, carve the first chunk
    /// out of it and pool the remainder.
    fn allocate_block<M: SpaceMapper>(
        &mut self,
        buddy: &mut Buddy<M>,
        want: usize,
    ) -> Result<(i64, i32)> {
        let (block, _) = buddy.allocate_block(BLOCK_SIZE)?;
        let space = buddy.space_mut();

        let chunk = BLOCK_HEADER_SIZE as i32;
        set_chunk_next(space, block, chunk, CHUNK_ALLOC_MARK);
        set_chunk_size(space, block, chunk, want as i32);

        let remainder_chunk = chunk + want as i32;
        let remainder_size = BLOCK_SIZE as i32 - remainder_chunk;
        set_chunk_next(space, block, remainder_chunk, 0);
        set_chunk_size(space, block, remainder_chunk, remainder_size);

        set_block_first_free(space, block, remainder_chunk);
        set_block_total_free(space, block, remainder_size);
        set_block_max_free(space, block, remainder_size);
        set_block_miss_count(space, block, 0);
        set_block_state(space, block, BlockState::Pooled);
        self.pooled_blocks.prepend(space, block);

        Ok((block, chunk))
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

/// A chunk space is its block offset with the chunk's payload offset packed
/// into the low bits; whole-block spaces keep those bits zero.
fn chunk_space(block: i64, chunk: i32) -> i64 {
    block | (chunk + CHUNK_HEADER_SIZE as i32) as i64
}

fn parse_chunk_space(space: i64) -> Option<(i64, i32)> {
    let block = space & !(BLOCK_SIZE as i64 - 1);
    if space == block {
        return None;
    }
    let chunk = (space & (BLOCK_SIZE as i64 - 1)) as i32 - CHUNK_HEADER_SIZE as i32;
    Some((block, chunk))
}

fn block_field(block: i64, offset: usize) -> usize {
    block as usize + LINK_SIZE + offset
}

fn block_first_free(space: &[u8], block: i64) -> i32 {
    get_i32(space, block_field(block, 0))
}

fn set_block_first_free(space: &mut [u8], block: i64, chunk: i32) {
    put_i32(space, block_field(block, 0), chunk);
}

fn block_total_free(space: &[u8], block: i64) -> i32 {
    get_i32(space, block_field(block, 4))
}

fn set_block_total_free(space: &mut [u8], block: i64, total: i32) {
    put_i32(space, block_field(block, 4), total);
}

fn block_max_free(space: &[u8], block: i64) -> i32 {
    get_i32(space, block_field(block, 8))
}

fn set_block_max_free(space: &mut [u8], block: i64, max: i32) {
    put_i32(space, block_field(block, 8), max);
}

fn block_miss_count(space: &[u8], block: i64) -> i8 {
    space[block_field(block, 12)] as i8
}

fn set_block_miss_count(space: &mut [u8], block: i64, count: i8) {
    space[block_field(block, 12)] = count as u8;
}

fn block_state(space: &[u8], block: i64) -> BlockState {
    BlockState::from_u8(space[block_field(block, 13)])
}

fn set_block_state(space: &mut [u8], block: i64, state: BlockState) {
    space[block_field(block, 13)] = state as u8;
}

fn chunk_next(space: &[u8], block: i64, chunk: i32) -> i32 {
    get_i32(space, block as usize + chunk as usize)
}

fn set_chunk_next(space: &mut [u8], block: i64, chunk: i32, next: i32) {
    put_i32(space, block as usize + chunk as usize, next);
}

fn chunk_size(space: &[u8], block: i64, chunk: i32) -> i32 {
    get_i32(space, block as usize + chunk as usize + 4)
}

fn set_chunk_size(space: &mut [u8], block: i64, chunk: i32, size: i32) {
    put_i32(space, block as usize + chunk as usize + 4, size);
}
