//! On-disk file header (page 0).

use crate::bytes::{get_i64, put_i64};
use crate::error::{Result, StorageError};
use crate::list::LIST_STORE_SIZE;

/// File signature at offset 0.
pub const SIGNATURE: &[u8; 5] = b"!MSF.";

/// Platform page size assumed by the on-disk layout.
pub const PAGE_SIZE: usize = 4096;

/// Size reserved for the header: the 77-byte payload rounded up to one page.
/// The data region starts at this offset.
pub const HEADER_SIZE: usize = PAGE_SIZE;

/// The fixed-size header record at the start of a storage file.
///
/// All integer fields are big-endian. `primary_space` and the offsets inside
/// `pooled_block_list` are stored bitwise-complemented so that an all-zero
/// record decodes to the -1 "unset" sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Total space managed by the buddy system (multiple of the max block size).
    pub space_size: i64,

    /// High-water mark: end offset of the highest live block.
    pub used_size: i64,

    /// Size of the memory mapping at close time.
    pub mapped_size: i64,

    /// Sum of the sizes of all allocated buddy blocks.
    pub allocated_size: i64,

    /// Length in bytes of the block-allocation bitmap stored after the data region.
    pub bitmap_size: i64,

    /// Persisted pooled-block list descriptor (complemented tail, head).
    pub pooled_block_list: [u8; LIST_STORE_SIZE],

    /// Free bytes held by dismissed pool blocks.
    pub dismissed_space_size: i64,

    /// Caller-designated entry-point offset, -1 when unset.
    pub primary_space: i64,
}

impl FileHeader {
    /// Serialize into `buffer`, which must hold at least `HEADER_SIZE` bytes.
    /// Bytes past the payload are zeroed.
    pub fn serialize(&self, buffer: &mut [u8]) {
        buffer[..SIGNATURE.len()].copy_from_slice(SIGNATURE);
        let mut i = SIGNATURE.len();
        put_i64(buffer, i, self.space_size);
        i += 8;
        put_i64(buffer, i, self.used_size);
        i += 8;
        put_i64(buffer, i, self.mapped_size);
        i += 8;
        put_i64(buffer, i, self.allocated_size);
        i += 8;
        put_i64(buffer, i, self.bitmap_size);
        i += 8;
        buffer[i..i + LIST_STORE_SIZE].copy_from_slice(&self.pooled_block_list);
        i += LIST_STORE_SIZE;
        put_i64(buffer, i, self.dismissed_space_size);
        i += 8;
        put_i64(buffer, i, !self.primary_space);
        i += 8;
        buffer[i..HEADER_SIZE].fill(0);
    }

    /// Deserialize from `data`, which must hold at least `HEADER_SIZE` bytes.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if &data[..SIGNATURE.len()] != SIGNATURE {
            return Err(StorageError::BadFileSignature);
        }

        let mut i = SIGNATURE.len();
        let space_size = get_i64(data, i);
        i += 8;
        let used_size = get_i64(data, i);
        i += 8;
        let mapped_size = get_i64(data, i);
        i += 8;
        let allocated_size = get_i64(data, i);
        i += 8;
        let bitmap_size = get_i64(data, i);
        i += 8;
        let mut pooled_block_list = [0u8; LIST_STORE_SIZE];
        pooled_block_list.copy_from_slice(&data[i..i + LIST_STORE_SIZE]);
        i += LIST_STORE_SIZE;
        let dismissed_space_size = get_i64(data, i);
        i += 8;
        let primary_space = !get_i64(data, i);

        Ok(FileHeader {
            space_size,
            used_size,
            mapped_size,
            allocated_size,
            bitmap_size,
            pooled_block_list,
            dismissed_space_size,
            primary_space,
        })
    }
}
