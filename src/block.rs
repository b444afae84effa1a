//! In-band block headers and the arena view they are read through.
//!
//! Every block, free or used, starts with a [`Header`]:
//!
//! ```text
//!   ┌───────────────┬──────────────────────┬──────────────────────────────┐
//!   │   prev_size   │  size << 1 | free    │  payload (size bytes)        │
//!   │    1 word     │       1 word         │  free_prev/free_next if free │
//!   └───────────────┴──────────────────────┴──────────────────────────────┘
//!                                          ▲
//!                                          └── pointer handed to the client
//! ```
//!
//! Blocks are addressed by their byte offset from the zone start. Neighbours
//! are found purely from the stored sizes.

use core::{mem::size_of, ptr::NonNull};

// =============================================================================
// Header
// =============================================================================

const FREE_BIT: usize = 1;
const SIZE_SHIFT: u32 = 1;

/// Largest payload size the packed word can hold.
pub(crate) const MAX_SIZE: usize = usize::MAX >> SIZE_SHIFT;

/// Block header. `size` and the free flag share one word.
#[repr(C)]
pub(crate) struct Header {
  /// Payload size of the physically preceding block, 0 for the first block.
  prev_size: usize,
  word: usize,
}

/// Bytes taken by every block header.
pub const HEADER_SIZE: usize = size_of::<Header>();

/// Smallest payload: room for the two free-list links a free block carries.
pub const MIN_ALLOC: usize = 2 * size_of::<usize>();

/// Smallest block that can stand on its own (header + minimum payload).
pub const MIN_BLOCK: usize = HEADER_SIZE + MIN_ALLOC;

impl Header {
  #[inline(always)]
  pub(crate) fn size(&self) -> usize {
    self.word >> SIZE_SHIFT
  }

  #[inline(always)]
  pub(crate) fn set_size(&mut self, size: usize) {
    debug_assert!(size <= MAX_SIZE);
    self.word = (size << SIZE_SHIFT) | (self.word & FREE_BIT);
  }

  #[inline(always)]
  pub(crate) fn is_free(&self) -> bool {
    self.word & FREE_BIT != 0
  }

  #[inline(always)]
  pub(crate) fn set_free(&mut self, free: bool) {
    self.word = (self.word & !FREE_BIT) | free as usize;
  }

  #[inline(always)]
  pub(crate) fn prev_size(&self) -> usize {
    self.prev_size
  }

  #[inline(always)]
  pub(crate) fn set_prev_size(&mut self, size: usize) {
    self.prev_size = size;
  }
}

// =============================================================================
// Arena
// =============================================================================

/// Raw view of the zone bytes. Copyable; owns nothing.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Arena {
  base: NonNull<u8>,
  len: usize,
}

impl Arena {
  /// `base` must be `ALIGN`-aligned and valid for `len` bytes.
  pub(crate) const fn new(base: NonNull<u8>, len: usize) -> Self {
    Self { base, len }
  }

  #[inline(always)]
  pub(crate) fn base(&self) -> NonNull<u8> {
    self.base
  }

  #[inline(always)]
  pub(crate) fn len(&self) -> usize {
    self.len
  }

  /// Whether a block starting at `off` lies inside the zone.
  #[inline(always)]
  pub(crate) fn contains(&self, off: usize) -> bool {
    off < self.len
  }

  /// Raw pointer to the byte at `off`. `off` must not exceed the zone length.
  #[inline(always)]
  pub(crate) unsafe fn at(&self, off: usize) -> *mut u8 {
    debug_assert!(off <= self.len);
    unsafe { self.base.as_ptr().add(off) }
  }

  #[inline(always)]
  pub(crate) unsafe fn header(&self, off: usize) -> *mut Header {
    debug_assert!(off + HEADER_SIZE <= self.len);
    unsafe { self.at(off) as *mut Header }
  }

  #[inline(always)]
  pub(crate) unsafe fn size(&self, off: usize) -> usize {
    unsafe { (*self.header(off)).size() }
  }

  #[inline(always)]
  pub(crate) unsafe fn set_size(&self, off: usize, size: usize) {
    unsafe { (*self.header(off)).set_size(size) }
  }

  #[inline(always)]
  pub(crate) unsafe fn is_free(&self, off: usize) -> bool {
    unsafe { (*self.header(off)).is_free() }
  }

  #[inline(always)]
  pub(crate) unsafe fn set_free(&self, off: usize, free: bool) {
    unsafe { (*self.header(off)).set_free(free) }
  }

  #[inline(always)]
  pub(crate) unsafe fn prev_size(&self, off: usize) -> usize {
    unsafe { (*self.header(off)).prev_size() }
  }

  /// Writes a complete header at `off`.
  #[inline]
  pub(crate) unsafe fn write_header(&self, off: usize, prev_size: usize, size: usize, free: bool) {
    debug_assert!(size <= MAX_SIZE);
    unsafe {
      self.header(off).write(Header {
        prev_size,
        word: (size << SIZE_SHIFT) | free as usize,
      })
    }
  }

  /// Offset of the block physically after `off`. May equal the zone length.
  #[inline(always)]
  pub(crate) unsafe fn next_of(&self, off: usize) -> usize {
    off + HEADER_SIZE + unsafe { self.size(off) }
  }

  /// The following block, if `off` is not the last one.
  #[inline]
  pub(crate) unsafe fn next_in_zone(&self, off: usize) -> Option<usize> {
    let next = unsafe { self.next_of(off) };
    self.contains(next).then_some(next)
  }

  /// The preceding block, if `off` is not the first one.
  #[inline]
  pub(crate) unsafe fn prev_in_zone(&self, off: usize) -> Option<usize> {
    if off == 0 {
      return None;
    }
    Some(off - HEADER_SIZE - unsafe { self.prev_size(off) })
  }

  /// Restores `successor.prev_size == size` after the block at `off` was resized.
  #[inline]
  pub(crate) unsafe fn fix_successor(&self, off: usize) {
    unsafe {
      if let Some(next) = self.next_in_zone(off) {
        (*self.header(next)).set_prev_size(self.size(off));
      }
    }
  }

  /// Client pointer for the block at `off`.
  #[inline(always)]
  pub(crate) unsafe fn payload(&self, off: usize) -> NonNull<u8> {
    unsafe { NonNull::new_unchecked(self.at(off + HEADER_SIZE)) }
  }

  /// Block offset for a client pointer handed out by this zone.
  #[inline(always)]
  pub(crate) fn block_of(&self, ptr: NonNull<u8>) -> usize {
    let addr = ptr.as_ptr() as usize;
    debug_assert!(addr >= self.base.as_ptr() as usize + HEADER_SIZE);
    addr - self.base.as_ptr() as usize - HEADER_SIZE
  }

  /// Whether `ptr` points into the payload area of this zone.
  #[inline]
  pub(crate) fn owns(&self, ptr: *const u8) -> bool {
    let base = self.base.as_ptr() as usize;
    let addr = ptr as usize;
    addr >= base + HEADER_SIZE && addr < base + self.len
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::class::ALIGN;

  #[test]
  fn header_is_two_words() {
    assert_eq!(HEADER_SIZE, 2 * size_of::<usize>());
    assert_eq!(MIN_BLOCK % ALIGN, 0);
    assert_eq!(HEADER_SIZE % ALIGN, 0);
  }

  #[test]
  fn free_bit_and_size_are_independent() {
    let mut header = Header { prev_size: 0, word: 0 };
    header.set_size(4096);
    assert_eq!(header.size(), 4096);
    assert!(!header.is_free());

    header.set_free(true);
    assert!(header.is_free());
    assert_eq!(header.size(), 4096);

    header.set_size(MAX_SIZE);
    assert!(header.is_free());
    assert_eq!(header.size(), MAX_SIZE);

    header.set_free(false);
    assert_eq!(header.size(), MAX_SIZE);
    assert!(!header.is_free());
  }

  #[test]
  fn traversal_follows_sizes() {
    #[repr(align(16))]
    struct Buf([u8; 256]);
    let mut buf = Buf([0; 256]);
    let arena = Arena::new(NonNull::from(&mut buf.0).cast(), 256);

    unsafe {
      arena.write_header(0, 0, 48, false);
      let second = arena.next_of(0);
      assert_eq!(second, 48 + HEADER_SIZE);
      arena.write_header(second, 48, 256 - second - HEADER_SIZE, true);

      assert_eq!(arena.prev_in_zone(0), None);
      assert_eq!(arena.prev_in_zone(second), Some(0));
      assert_eq!(arena.next_in_zone(0), Some(second));
      assert_eq!(arena.next_in_zone(second), None);
      assert!(arena.is_free(second));

      (*arena.header(second)).set_prev_size(0);
      arena.fix_successor(0);
      assert_eq!(arena.prev_size(second), 48);

      let ptr = arena.payload(second);
      assert_eq!(arena.block_of(ptr), second);
      assert!(arena.owns(ptr.as_ptr()));
      assert!(!arena.owns(arena.at(0)));
    }
  }
}
