//! # filespace - persistent file-backed space management
//!
//! `filespace` turns a single regular file into a dynamically sized address
//! space from which callers allocate, free and randomly access variable-sized
//! byte ranges ("spaces"). The file contents survive process restarts;
//! allocation metadata is part of the file itself.
//!
//! ## Features
//!
//! - **Buddy allocation**: power-of-two blocks from 4 KiB to 4 GiB, backed
//!   by a compact allocation bitmap and address-ordered free sets
//! - **Chunk pooling**: small allocations share 4 KiB blocks, with miss-based
//!   demotion of unpromising blocks
//! - **Memory-mapped access**: allocations are read and written in place
//!   through ephemeral accessor slices
//! - **Space reclamation**: the mapping shrinks at half occupancy and
//!   trailing free space is discarded at close
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------+
//! | Storage file                                |
//! +---------------------------------------------+
//! | Header (4KB)                                |
//! |  - Signature: "!MSF."                       |
//! |  - space/used/mapped/allocated sizes        |
//! |  - pooled-block list, primary space         |
//! +---------------------------------------------+
//! | Data region (used_size bytes, mapped)       |
//! |  - buddy blocks and pool chunks             |
//! +---------------------------------------------+
//! | Block-allocation bitmap (bitmap_size bytes) |
//! +---------------------------------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use filespace::FileStorage;
//!
//! fn main() -> filespace::Result<()> {
//!     let mut storage = FileStorage::open("data.fsm", true)?;
//!     let (space, accessor) = storage.allocate_space(128)?;
//!     accessor[..4].copy_from_slice(b"demo");
//!     storage.set_primary_space(space);
//!     storage.close()?;
//!
//!     let mut storage = FileStorage::open("data.fsm", false)?;
//!     let space = storage.primary_space();
//!     assert_eq!(&storage.access_space(space)[..4], b"demo");
//!     storage.free_space(space);
//!     storage.close()
//! }
//! ```
//!
//! Accessor slices borrow the live mapping: they are invalidated by any
//! later `allocate_space`/`free_space` and must be reacquired, which the
//! borrow checker enforces. A storage instance owns its file exclusively;
//! nothing guards against concurrent opens from other processes.

pub mod allocator;
mod bytes;
pub mod error;
pub mod header;
mod list;
pub mod mapper;
pub mod storage;

// Re-export commonly used types
pub use allocator::buddy::Buddy;
pub use allocator::pool::Pool;
pub use allocator::{MAX_BLOCK_SIZE, MAX_ORDER, MIN_BLOCK_SIZE, MIN_ORDER};
pub use error::{Result, StorageError};
pub use header::{FileHeader, HEADER_SIZE, PAGE_SIZE};
pub use mapper::{FileSpaceMapper, SpaceMapper};
pub use storage::{FileStorage, Stats};
