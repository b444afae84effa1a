//! Segregated free-list allocator over a single contiguous zone.
//!
//! A [`Zone`] carves one block of memory into variable-sized blocks, each
//! preceded by an in-band header. Free blocks are threaded onto size-class
//! buckets:
//!
//! ```text
//!   bucket  0 .. FIXED-1   one exact payload size each (ALIGN, 2*ALIGN, ...)
//!   bucket  FIXED .. HUGE  one power of two range each
//!   bucket  HUGE           everything larger
//!
//!   zone:  ┌─hdr─┬─used──┬─hdr─┬─free─────────┬─hdr─┬─used─┐
//!          └─────┴───────┴─────┴──────────────┴─────┴──────┘
//!                               ▲
//!                               └── linked into buckets[index(size)]
//! ```
//!
//! Allocation pops a first fit and splits off the tail. Freeing merges with
//! free neighbours, so no two free blocks are ever adjacent. `realloc` grows
//! or shrinks in place when the next block allows it.
//!
//! A zone is single-threaded. [`LockedZone`] adds a spin lock and a
//! [`GlobalAlloc`](core::alloc::GlobalAlloc) implementation.

#![allow(clippy::missing_safety_doc)]

mod block;
mod boxed;
mod buckets;
pub mod class;
mod diag;
mod error;
mod host;
mod locked;
mod zone;

#[cfg(feature = "c_api")]
pub mod capi;

pub use block::{HEADER_SIZE, MIN_ALLOC, MIN_BLOCK};
pub use boxed::ZoneBox;
pub use class::{ALIGN, FIXED, round_up};
pub use diag::{BlockInfo, Blocks, Census};
pub use error::{Corruption, Error, Result};
pub use host::{HostAlloc, LibcHost, MmapHost};
pub use locked::{LockedZone, ZoneGuard};
pub use zone::{Stats, Zone};

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(HEADER_SIZE % ALIGN == 0);
const _: () = assert!(MIN_BLOCK % ALIGN == 0);
const _: () = assert!(MIN_ALLOC >= 2 * size_of::<usize>());
