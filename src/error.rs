//! Error types.

use thiserror::Error;

/// Failures while setting up a zone.
///
/// Running out of space inside a zone is not an error: allocation calls
/// return `None` instead.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
  /// The host allocator could not provide the backing bytes.
  #[error("host allocator failed to provide {size} bytes")]
  HostAlloc { size: usize },

  /// A caller-supplied region cannot hold a single minimum block.
  #[error("region of {len} bytes is smaller than the minimum block of {min} bytes")]
  RegionTooSmall { len: usize, min: usize },

  /// The requested size cannot be represented in a block header.
  #[error("zone size {size} is too large")]
  SizeOverflow { size: usize },

  /// The host allocator cannot satisfy the control block's alignment.
  #[error("control block alignment {align} exceeds the host guarantee")]
  ControlAlignment { align: usize },
}

/// Result type for zone setup.
pub type Result<T> = core::result::Result<T, Error>;

/// Inconsistencies found by [`Zone::verify`](crate::Zone::verify).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
  #[error("first block has prev_size {found}, expected 0")]
  FirstPrevSize { found: usize },

  #[error("block at {offset:#x} has prev_size {found}, predecessor size is {expected}")]
  PrevSize { offset: usize, expected: usize, found: usize },

  #[error("block at {offset:#x} has invalid size {size}")]
  BadSize { offset: usize, size: usize },

  #[error("block at {offset:#x} runs past the zone end")]
  Overrun { offset: usize },

  #[error("free blocks at {offset:#x} and {next:#x} are adjacent")]
  AdjacentFree { offset: usize, next: usize },

  #[error("blocks account for {found} bytes of a {expected} byte zone")]
  Conservation { expected: usize, found: usize },

  #[error("bucket {bucket} has a broken link {from:#x} -> {to:#x}")]
  BrokenLink { bucket: usize, from: usize, to: usize },

  #[error("bucket {bucket} lists block {offset:#x} which is not a free block")]
  NotFree { bucket: usize, offset: usize },

  #[error("block {offset:#x} is listed in bucket {bucket}, belongs in {expected}")]
  WrongBucket { bucket: usize, offset: usize, expected: usize },

  #[error("{listed} blocks listed in buckets, {free} free blocks in the zone")]
  Unlisted { listed: usize, free: usize },

  #[error("statistic `{field}` is {recorded}, zone walk gives {walked}")]
  Stat { field: &'static str, recorded: usize, walked: usize },
}
