//! Segregated free lists.
//!
//! Each bucket is a doubly linked list threaded through the payload of its
//! free blocks. Links are zone offsets, [`NIL`] terminates. This module is the
//! only place that reads or writes the links.

use core::mem::size_of;

use crate::{
  block::{Arena, HEADER_SIZE, Header, MIN_ALLOC},
  class::{self, BUCKET_COUNT},
};

/// End-of-list marker. Never a valid block offset.
pub(crate) const NIL: usize = usize::MAX;

/// Layout of a free block: the regular header followed by the links.
#[repr(C)]
struct FreeHeader {
  _header: Header,
  free_prev: usize,
  free_next: usize,
}

const _: () = assert!(size_of::<FreeHeader>() == HEADER_SIZE + MIN_ALLOC);

#[inline(always)]
unsafe fn links(arena: &Arena, off: usize) -> *mut FreeHeader {
  debug_assert!(off + size_of::<FreeHeader>() <= arena.len());
  unsafe { arena.at(off) as *mut FreeHeader }
}

pub(crate) struct Buckets {
  heads: [usize; BUCKET_COUNT],
  /// Precomputed log2 offset for the large region.
  bdec: usize,
}

impl Buckets {
  pub(crate) const fn new() -> Self {
    Self {
      heads: [NIL; BUCKET_COUNT],
      bdec: class::base_decrement(),
    }
  }

  /// Bucket a block of `size` payload bytes belongs to.
  #[inline(always)]
  pub(crate) fn index(&self, size: usize) -> usize {
    class::bucket_index(size, self.bdec)
  }

  #[cfg(test)]
  pub(crate) fn head(&self, index: usize) -> Option<usize> {
    let head = self.heads[index];
    (head != NIL).then_some(head)
  }

  /// Pushes the free block at `off` onto the bucket for its current size.
  pub(crate) unsafe fn insert(&mut self, arena: &Arena, off: usize) {
    unsafe {
      let index = self.index(arena.size(off));
      let head = self.heads[index];
      let node = links(arena, off);
      (*node).free_prev = NIL;
      (*node).free_next = head;
      if head != NIL {
        (*links(arena, head)).free_prev = off;
      }
      self.heads[index] = off;
    }
  }

  /// Unlinks the block at `off`. Its size must still be the one it was
  /// inserted with.
  pub(crate) unsafe fn remove(&mut self, arena: &Arena, off: usize) {
    unsafe {
      let node = links(arena, off);
      let prev = (*node).free_prev;
      let next = (*node).free_next;

      if prev != NIL {
        (*links(arena, prev)).free_next = next;
      } else {
        let index = self.index(arena.size(off));
        debug_assert_eq!(self.heads[index], off, "block {off:#x} is not the head of bucket {index}");
        self.heads[index] = next;
      }

      if next != NIL {
        (*links(arena, next)).free_prev = prev;
      }
    }
  }

  /// Unlinks and returns the first block in bucket `index` with at least
  /// `size` payload bytes.
  pub(crate) unsafe fn pop_first_fit(&mut self, arena: &Arena, index: usize, size: usize) -> Option<usize> {
    let mut cand = self.heads[index];
    while cand != NIL {
      unsafe {
        if arena.size(cand) >= size {
          self.remove(arena, cand);
          return Some(cand);
        }
        cand = (*links(arena, cand)).free_next;
      }
    }
    None
  }

  /// Walks bucket `index`. The arena must outlive the iterator and stay
  /// unmodified while it is used.
  pub(crate) unsafe fn chain<'a>(&self, arena: &'a Arena, index: usize) -> Chain<'a> {
    Chain {
      arena,
      cur: self.heads[index],
      prev: NIL,
    }
  }
}

/// Iterator over one bucket. Stops early on a link that leaves the zone or
/// whose back link does not match.
pub(crate) struct Chain<'a> {
  arena: &'a Arena,
  cur: usize,
  prev: usize,
}

/// One step of a [`Chain`] walk.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Link {
  Block(usize),
  Broken { from: usize, to: usize },
}

impl Iterator for Chain<'_> {
  type Item = Link;

  fn next(&mut self) -> Option<Link> {
    if self.cur == NIL {
      return None;
    }

    let off = self.cur;
    if off % class::ALIGN != 0 || off + size_of::<FreeHeader>() > self.arena.len() {
      self.cur = NIL;
      return Some(Link::Broken { from: self.prev, to: off });
    }

    // SAFETY: `off` is aligned and in bounds.
    let node = unsafe { &*links(self.arena, off) };
    if node.free_prev != self.prev {
      self.cur = NIL;
      return Some(Link::Broken { from: self.prev, to: off });
    }

    self.prev = off;
    self.cur = node.free_next;
    Some(Link::Block(off))
  }
}
