//! Space allocation strategies.
//!
//! Two layers stacked on the mapped data region:
//!
//! - [`buddy`] - power-of-two blocks tracked by a per-group bitmap and
//!   per-order free sets; grows and shrinks the space itself.
//! - [`pool`] - carves single buddy blocks into variable-sized chunks for
//!   small allocations.

pub(crate) mod bitmap;
pub mod buddy;
pub mod pool;

/// log2 of the minimum block size (4 KiB).
pub const MIN_ORDER: u32 = 12;

/// log2 of the maximum block size (4 GiB).
pub const MAX_ORDER: u32 = 32;

/// Smallest buddy block; also the pool's block size.
pub const MIN_BLOCK_SIZE: usize = 1 << MIN_ORDER;

/// Largest buddy block; the space grows in increments of this size.
pub const MAX_BLOCK_SIZE: usize = 1 << MAX_ORDER;

/// Number of per-order free sets.
pub(crate) const ORDER_COUNT: usize = (MAX_ORDER - MIN_ORDER + 1) as usize;
