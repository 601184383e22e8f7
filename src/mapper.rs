//! Memory mapping of a storage file's data region.

use crate::header::{HEADER_SIZE, PAGE_SIZE};
use memmap2::{MmapMut, MmapOptions};
use std::fs::File;
use std::io;

/// Byte access to a resizable data region.
///
/// `map_space` invalidates every slice previously obtained through `space`
/// or `space_mut`; callers must reacquire the region after each call.
pub trait SpaceMapper {
    /// Resize the data region to `space_size` bytes. Sizes between 1 and the
    /// page size are rounded up to one page; 0 releases the region entirely.
    fn map_space(&mut self, space_size: usize) -> io::Result<()>;

    /// The current data region. Empty while nothing is mapped.
    fn space(&self) -> &[u8];

    /// Mutable view of the current data region.
    fn space_mut(&mut self) -> &mut [u8];
}

/// File-backed mapper.
///
/// Owns the storage file and keeps a shared read/write mapping of its data
/// region, which starts at `HEADER_SIZE`. Resizing truncates the file to
/// `HEADER_SIZE + space_size` and replaces the mapping.
pub struct FileSpaceMapper {
    file: File,
    map: Option<MmapMut>,
}

impl FileSpaceMapper {
    pub fn new(file: File) -> Self {
        FileSpaceMapper { file, map: None }
    }

    /// The backing file. Header and bitmap I/O go through this handle.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Drop the current mapping without touching the file length.
    pub fn unmap(&mut self) {
        self.map = None;
    }
}

impl SpaceMapper for FileSpaceMapper {
    fn map_space(&mut self, space_size: usize) -> io::Result<()> {
        let space_size = if space_size >= 1 && space_size < PAGE_SIZE {
            PAGE_SIZE
        } else {
            space_size
        };

        if self.map.as_ref().map_or(0, |map| map.len()) == space_size {
            return Ok(());
        }

        // The old view must be gone before the file shrinks under it.
        self.map = None;
        self.file.set_len((HEADER_SIZE + space_size) as u64)?;

        if space_size >= 1 {
            let map = unsafe {
                MmapOptions::new()
                    .offset(HEADER_SIZE as u64)
                    .len(space_size)
                    .map_mut(&self.file)?
            };
            #[cfg(unix)]
            map.advise(memmap2::Advice::Random)?;
            self.map = Some(map);
            tracing::trace!(space_size, "remapped data region");
        }

        Ok(())
    }

    fn space(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    fn space_mut(&mut self) -> &mut [u8] {
        self.map.as_deref_mut().unwrap_or(&mut [])
    }
}

/// In-memory mapper for allocator tests: the "file" is a plain vector.
#[cfg(test)]
pub(crate) struct MemSpaceMapper {
    buffer: Vec<u8>,
}

#[cfg(test)]
impl MemSpaceMapper {
    pub(crate) fn new() -> Self {
        MemSpaceMapper { buffer: Vec::new() }
    }
}

#[cfg(test)]
impl SpaceMapper for MemSpaceMapper {
    fn map_space(&mut self, space_size: usize) -> io::Result<()> {
        self.buffer.resize(space_size, 0);
        Ok(())
    }

    fn space(&self) -> &[u8] {
        &self.buffer
    }

    fn space_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

/// Mapper that tracks nothing, for tests that never touch the region bytes.
#[cfg(test)]
pub(crate) struct NullSpaceMapper;

#[cfg(test)]
impl SpaceMapper for NullSpaceMapper {
    fn map_space(&mut self, _space_size: usize) -> io::Result<()> {
        Ok(())
    }

    fn space(&self) -> &[u8] {
        &[]
    }

    fn space_mut(&mut self) -> &mut [u8] {
        &mut []
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    #[test]
    fn test_small_sizes_round_up_to_a_page() {
        let mut mapper = FileSpaceMapper::new(tempfile().unwrap());
        mapper.map_space(1).unwrap();
        assert_eq!(mapper.space().len(), PAGE_SIZE);
        assert_eq!(
            mapper.file().metadata().unwrap().len(),
            (HEADER_SIZE + PAGE_SIZE) as u64
        );
    }

    #[test]
    fn test_map_zero_releases_the_region() {
        let mut mapper = FileSpaceMapper::new(tempfile().unwrap());
        mapper.map_space(PAGE_SIZE).unwrap();
        mapper.map_space(0).unwrap();
        assert!(mapper.space().is_empty());
        assert_eq!(mapper.file().metadata().unwrap().len(), HEADER_SIZE as u64);
    }

    #[test]
    fn test_contents_survive_remapping() {
        let mut mapper = FileSpaceMapper::new(tempfile().unwrap());
        mapper.map_space(PAGE_SIZE).unwrap();
        mapper.space_mut()[100] = 0xAB;

        mapper.map_space(4 * PAGE_SIZE).unwrap();
        assert_eq!(mapper.space().len(), 4 * PAGE_SIZE);
        assert_eq!(mapper.space()[100], 0xAB);

        mapper.map_space(PAGE_SIZE).unwrap();
        assert_eq!(mapper.space()[100], 0xAB);
    }

    #[test]
    fn test_remap_to_same_size_is_a_no_op() {
        let mut mapper = FileSpaceMapper::new(tempfile().unwrap());
        mapper.map_space(2 * PAGE_SIZE).unwrap();
        mapper.space_mut()[0] = 7;
        mapper.map_space(2 * PAGE_SIZE).unwrap();
        assert_eq!(mapper.space()[0], 7);
    }
}
