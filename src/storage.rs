//! The outward-facing storage façade.

use crate::allocator::buddy::{Buddy, BuddySnapshot};
use crate::allocator::pool::Pool;
use crate::error::Result;
use crate::header::{FileHeader, HEADER_SIZE};
use crate::list::LIST_STORE_SIZE;
use crate::mapper::{FileSpaceMapper, SpaceMapper};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// A file storage: one regular file serving as a persistent, dynamically
/// sized space from which byte ranges are allocated, freed and accessed.
///
/// A storage is opened with [`FileStorage::open`] and must be closed with
/// [`FileStorage::close`] for the header and bitmap tail to be persisted;
/// the file on disk always represents the last successfully closed state.
pub struct FileStorage {
    buddy: Buddy<FileSpaceMapper>,
    pool: Pool,
    primary_space: i64,
}

/// Space accounting for a storage file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub space_size: usize,
    pub used_size: usize,
    pub mapped_size: usize,
    pub allocated_size: usize,
    pub bitmap_size: usize,
    pub dismissed_space_size: usize,
}

impl FileStorage {
    /// Open the storage file at `path`. A missing file is created when
    /// `create_if_missing` is set; an existing file must carry a valid
    /// signature and is restored to its last closed state.
    pub fn open<P: AsRef<Path>>(path: P, create_if_missing: bool) -> Result<Self> {
        let path = path.as_ref();

        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => Self::load(file),
            Err(err) if err.kind() == io::ErrorKind::NotFound && create_if_missing => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(path)?;
                file.set_len(HEADER_SIZE as u64)?;
                tracing::debug!(path = %path.display(), "created storage file");
                Ok(FileStorage {
                    buddy: Buddy::new(FileSpaceMapper::new(file)),
                    pool: Pool::new(),
                    primary_space: -1,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Close the storage: shrink trailing free space, unmap, truncate the
    /// file to header + data + bitmap, and write the header and bitmap tail.
    pub fn close(mut self) -> Result<()> {
        self.buddy.shrink_space();

        let mut header = FileHeader {
            space_size: self.buddy.space_size() as i64,
            used_size: self.buddy.used_size() as i64,
            mapped_size: self.buddy.mapped_size() as i64,
            allocated_size: self.buddy.allocated_size() as i64,
            bitmap_size: self.buddy.bitmap_bytes().len() as i64,
            pooled_block_list: [0u8; LIST_STORE_SIZE],
            dismissed_space_size: self.pool.dismissed_space_size() as i64,
            primary_space: self.primary_space,
        };
        self.pool.store_pooled_block_list(&mut header.pooled_block_list);

        self.buddy.mapper_mut().unmap();

        let used_size = self.buddy.used_size();
        let bitmap = self.buddy.bitmap_bytes();
        let mut file: &File = self.buddy.mapper().file();
        file.set_len((HEADER_SIZE + used_size + bitmap.len()) as u64)?;

        let mut buffer = vec![0u8; HEADER_SIZE];
        header.serialize(&mut buffer);
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&buffer)?;
        file.seek(SeekFrom::Start((HEADER_SIZE + used_size) as u64))?;
        file.write_all(bitmap)?;
        file.sync_all()?;

        tracing::debug!(used_size, "closed storage file");
        Ok(())
    }

    /// Allocate `space_size` bytes. Returns the space offset and an
    /// ephemeral accessor over its bytes; the accessor (like any accessor)
    /// is invalidated by the next `allocate_space`/`free_space`.
    pub fn allocate_space(&mut self, space_size: usize) -> Result<(i64, &mut [u8])> {
        let (space, actual_size) = self.pool.allocate_space(&mut self.buddy, space_size)?;
        let start = space as usize;
        let accessor = &mut self.buddy.space_mut()[start..start + actual_size];
        Ok((space, accessor))
    }

    /// Release the space at `space` back to the file.
    ///
    /// # Panics
    ///
    /// Panics when `space` does not name a live allocation.
    pub fn free_space(&mut self, space: i64) {
        self.pool.free_space(&mut self.buddy, space);
    }

    /// An ephemeral accessor over the space at `space`.
    ///
    /// # Panics
    ///
    /// Panics when `space` does not name a live allocation.
    pub fn access_space(&mut self, space: i64) -> &mut [u8] {
        let size = self.pool.space_size(&self.buddy, space);
        let start = space as usize;
        &mut self.buddy.space_mut()[start..start + size]
    }

    /// Designate `space` as the primary space, the caller-defined entry
    /// point persisted in the header.
    pub fn set_primary_space(&mut self, space: i64) {
        self.primary_space = space;
    }

    /// The primary space, or -1 when unset.
    pub fn primary_space(&self) -> i64 {
        self.primary_space
    }

    pub fn stats(&self) -> Stats {
        Stats {
            space_size: self.buddy.space_size(),
            used_size: self.buddy.used_size(),
            mapped_size: self.buddy.mapped_size(),
            allocated_size: self.buddy.allocated_size(),
            bitmap_size: self.buddy.bitmap_bytes().len(),
            dismissed_space_size: self.pool.dismissed_space_size(),
        }
    }

    fn load(mut file: File) -> Result<Self> {
        let mut buffer = vec![0u8; HEADER_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buffer)?;
        let header = FileHeader::deserialize(&buffer)?;

        let mut bitmap = vec![0u8; header.bitmap_size as usize];
        file.seek(SeekFrom::Start(HEADER_SIZE as u64 + header.used_size as u64))?;
        file.read_exact(&mut bitmap)?;

        let mut mapper = FileSpaceMapper::new(file);
        mapper.map_space(header.mapped_size as usize)?;

        let mut buddy = Buddy::new(mapper);
        buddy.restore(BuddySnapshot {
            space_size: header.space_size as usize,
            used_size: header.used_size as usize,
            mapped_size: header.mapped_size as usize,
            allocated_size: header.allocated_size as usize,
            bitmap,
        });

        let mut pool = Pool::new();
        pool.restore(&header.pooled_block_list, header.dismissed_space_size as usize);

        tracing::debug!(
            space_size = header.space_size,
            used_size = header.used_size,
            "loaded storage file"
        );

        Ok(FileStorage {
            buddy,
            pool,
            primary_space: header.primary_space,
        })
    }
}
