use core::{iter, ptr::NonNull};

use crate::{
  block::{Arena, HEADER_SIZE, MIN_BLOCK},
  buckets::Buckets,
  class::{ALIGN, FIXED, HUGE, Region, align_up, round_up},
  error::{Error, Result},
  host::{HostAlloc, LibcHost},
};

/// Largest zone a header can describe and pointer arithmetic can span.
const MAX_ZONE: usize = isize::MAX as usize;

/// Running counters kept by every zone when the `stat` feature is on.
///
/// `alloc + avail + (nused + nfree) * HEADER_SIZE == total` holds between calls.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
  /// Zone size in bytes.
  pub total: usize,
  /// Payload bytes in used blocks.
  pub alloc: usize,
  /// Payload bytes in free blocks.
  pub avail: usize,
  /// Used blocks.
  pub nused: usize,
  /// Free blocks.
  pub nfree: usize,
}

/// A segregated free-list allocator over one contiguous zone.
///
/// Not thread safe. Wrap it in a [`LockedZone`](crate::LockedZone) to share it.
pub struct Zone<H: HostAlloc = LibcHost> {
  host: H,
  pub(crate) arena: Arena,
  /// Backing bytes came from `host` and go back to it on drop.
  owned: bool,
  pub(crate) buckets: Buckets,
  #[cfg(feature = "stat")]
  pub(crate) stats: Stats,
}

// The zone exclusively owns its bytes.
unsafe impl<H: HostAlloc + Send> Send for Zone<H> {}

// =============================================================================
// Init / Fini
// =============================================================================

impl Zone<LibcHost> {
  /// Zone of `zone_size` bytes from the C heap.
  pub fn new(zone_size: usize) -> Result<Self> {
    Self::init(LibcHost, zone_size)
  }
}

impl<H: HostAlloc> Zone<H> {
  /// Creates a zone whose backing bytes are obtained from `host`.
  ///
  /// `zone_size` is rounded up to a multiple of [`ALIGN`] and to at least one
  /// minimum block.
  pub fn init(host: H, zone_size: usize) -> Result<Self> {
    if zone_size > MAX_ZONE - ALIGN {
      return Err(Error::SizeOverflow { size: zone_size });
    }

    let size = align_up(zone_size, ALIGN).max(MIN_BLOCK);
    let Some(base) = host.alloc(size) else {
      log::debug!("host refused {size} bytes for a zone");
      return Err(Error::HostAlloc { size });
    };

    Ok(unsafe { Self::setup(host, Arena::new(base, size), true) })
  }

  /// Creates a zone over caller-supplied memory. The zone never frees it.
  ///
  /// The start is moved up to the next multiple of [`ALIGN`] and the length
  /// truncated to a multiple of it.
  ///
  /// # Safety
  ///
  /// `region` must be valid for reads and writes of `len` bytes for the whole
  /// life of the zone and not be accessed through other paths meanwhile.
  pub unsafe fn init_in(host: H, region: NonNull<u8>, len: usize) -> Result<Self> {
    let addr = region.as_ptr() as usize;
    let skip = addr.next_multiple_of(ALIGN) - addr;
    let usable = len.saturating_sub(skip) & !(ALIGN - 1);

    if usable < MIN_BLOCK {
      return Err(Error::RegionTooSmall { len, min: MIN_BLOCK });
    }
    if usable > MAX_ZONE {
      return Err(Error::SizeOverflow { size: len });
    }

    unsafe {
      let base = NonNull::new_unchecked(region.as_ptr().add(skip));
      Ok(Self::setup(host, Arena::new(base, usable), false))
    }
  }

  /// Turns the whole arena into one free block.
  unsafe fn setup(host: H, arena: Arena, owned: bool) -> Self {
    let size = arena.len() - HEADER_SIZE;
    let mut buckets = Buckets::new();
    unsafe {
      arena.write_header(0, 0, size, true);
      buckets.insert(&arena, 0);
    }

    log::debug!(
      "zone {:p}: {} bytes ({})",
      arena.base(),
      arena.len(),
      if owned { "owned" } else { "borrowed" }
    );

    Self {
      host,
      arena,
      owned,
      buckets,
      #[cfg(feature = "stat")]
      stats: Stats {
        total: arena.len(),
        alloc: 0,
        avail: size,
        nused: 0,
        nfree: 1,
      },
    }
  }

  /// Tears the zone down. Same as dropping it.
  pub fn fini(self) {
    drop(self)
  }

  pub fn host(&self) -> &H {
    &self.host
  }

  /// Zone size in bytes, headers included.
  pub fn capacity(&self) -> usize {
    self.arena.len()
  }

  /// Whether the backing bytes are released when the zone goes away.
  pub fn owns_backing(&self) -> bool {
    self.owned
  }

  /// Whether `ptr` points into the payload area of this zone.
  pub fn contains(&self, ptr: *const u8) -> bool {
    self.arena.owns(ptr)
  }

  #[cfg(feature = "stat")]
  pub fn stats(&self) -> Stats {
    self.stats
  }

  #[inline(always)]
  fn stat(&mut self, update: impl FnOnce(&mut Stats)) {
    #[cfg(feature = "stat")]
    update(&mut self.stats);
    #[cfg(not(feature = "stat"))]
    let _ = update;
  }

  /// Full consistency walk, only with the `verify` feature.
  #[inline(always)]
  fn tripwire(&self, _at: &str) {
    #[cfg(feature = "verify")]
    if let Err(err) = self.verify() {
      panic!("zone {:p} corrupted at {}: {}", self.arena.base(), _at, err);
    }
  }
}

impl<H: HostAlloc> Drop for Zone<H> {
  fn drop(&mut self) {
    log::debug!("zone {:p}: released", self.arena.base());
    if self.owned {
      unsafe { self.host.free(self.arena.base(), self.arena.len()) };
    }
  }
}

// =============================================================================
// Allocation
// =============================================================================

impl<H: HostAlloc> Zone<H> {
  /// Allocates at least `size` bytes aligned to [`ALIGN`].
  ///
  /// Returns `None` when no free block is large enough. The zone is left
  /// untouched in that case.
  pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
    self.tripwire("alloc start");

    if size > self.arena.len() {
      log::trace!("zone {:p}: {} bytes exceeds the zone", self.arena.base(), size);
      return None;
    }

    let size = round_up(size);
    let index = self.buckets.index(size);
    let Some(off) = (unsafe { self.find_free(index, size) }) else {
      log::trace!("zone {:p}: no free block for {} bytes", self.arena.base(), size);
      return None;
    };

    unsafe { self.carve(off, size) };

    self.tripwire("alloc end");
    Some(unsafe { self.arena.payload(off) })
  }

  /// Like [`alloc`](Self::alloc), with the first `size` bytes zeroed.
  pub fn calloc(&mut self, size: usize) -> Option<NonNull<u8>> {
    let ptr = self.alloc(size)?;
    unsafe { ptr.as_ptr().write_bytes(0, size) };
    Some(ptr)
  }

  /// Detaches a free block of at least `size` bytes, searching from bucket `index`.
  unsafe fn find_free(&mut self, index: usize, size: usize) -> Option<usize> {
    let arena = self.arena;
    let buckets = &mut self.buckets;

    // Exact bucket for small sizes, first fit otherwise.
    if let Some(off) = unsafe { buckets.pop_first_fit(&arena, index, size) } {
      return Some(off);
    }
    if Region::of(index) == Region::Huge {
      return None;
    }

    // Larger exact-size buckets hold only fitting blocks, then the huge chain,
    // then every remaining power-of-two chain.
    (index + 1..FIXED)
      .chain(iter::once(HUGE))
      .chain((index + 1).max(FIXED)..HUGE)
      .find_map(|i| unsafe { buckets.pop_first_fit(&arena, i, size) })
  }

  /// Marks the detached block at `off` used, splitting off a free tail when
  /// what is left over can stand on its own.
  unsafe fn carve(&mut self, off: usize, size: usize) {
    let arena = self.arena;
    unsafe {
      let rem = arena.size(off) - size;
      if rem >= MIN_BLOCK {
        arena.set_size(off, size);
        let tail = arena.next_of(off);
        arena.write_header(tail, size, rem - HEADER_SIZE, true);
        self.buckets.insert(&arena, tail);
        arena.fix_successor(tail);
        self.stat(|s| s.avail -= HEADER_SIZE);
      } else {
        self.stat(|s| s.nfree -= 1);
      }

      arena.set_free(off, false);
      let used = arena.size(off);
      self.stat(|s| {
        s.nused += 1;
        s.alloc += used;
        s.avail -= used;
      });
    }
  }

  /// Payload bytes actually reserved for `ptr`. Never less than requested.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live allocation of this zone.
  pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
    unsafe { self.arena.size(self.arena.block_of(ptr)) }
  }
}

// =============================================================================
// Free
// =============================================================================

impl<H: HostAlloc> Zone<H> {
  /// Returns `ptr` to the zone, merging it with free neighbours.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live allocation of this zone. Foreign pointers and double
  /// frees corrupt the zone.
  pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
    debug_assert!(self.contains(ptr.as_ptr()), "{ptr:p} is not from zone {:p}", self.arena.base());
    self.tripwire("free start");

    let arena = self.arena;
    let blk = arena.block_of(ptr);

    unsafe {
      debug_assert!(!arena.is_free(blk), "double free of {ptr:p}");
      let size = arena.size(blk);
      self.stat(|s| {
        s.nused -= 1;
        s.alloc -= size;
      });

      let prev = match arena.prev_in_zone(blk) {
        Some(x) if arena.is_free(x) => Some(x),
        _ => None,
      };
      let next = match arena.next_in_zone(blk) {
        Some(y) if arena.is_free(y) => Some(y),
        _ => None,
      };

      match (prev, next) {
        (Some(x), Some(y)) => {
          //  | X free | blk | Y free | Z |  ->  | X free            | Z |
          let absorbed = HEADER_SIZE + size + HEADER_SIZE;
          self.buckets.remove(&arena, x);
          self.buckets.remove(&arena, y);
          arena.set_size(x, arena.size(x) + absorbed + arena.size(y));
          arena.fix_successor(x);
          self.buckets.insert(&arena, x);
          self.stat(|s| {
            s.nfree -= 1;
            s.avail += absorbed;
          });
        }
        (None, Some(y)) => {
          //  | blk | Y free | Z |  ->  | blk free     | Z |
          self.buckets.remove(&arena, y);
          arena.set_free(blk, true);
          arena.set_size(blk, size + HEADER_SIZE + arena.size(y));
          arena.fix_successor(blk);
          self.buckets.insert(&arena, blk);
          self.stat(|s| s.avail += size + HEADER_SIZE);
        }
        (Some(x), None) => {
          //  | X free | blk | Y |  ->  | X free       | Y |
          self.buckets.remove(&arena, x);
          arena.set_size(x, arena.size(x) + HEADER_SIZE + size);
          arena.fix_successor(x);
          self.buckets.insert(&arena, x);
          self.stat(|s| s.avail += HEADER_SIZE + size);
        }
        (None, None) => {
          arena.set_free(blk, true);
          self.buckets.insert(&arena, blk);
          self.stat(|s| {
            s.nfree += 1;
            s.avail += size;
          });
        }
      }
    }

    self.tripwire("free end");
  }
}

// =============================================================================
// Realloc
// =============================================================================

impl<H: HostAlloc> Zone<H> {
  /// Resizes an allocation, in place when the next block allows it, by
  /// allocate-copy-free otherwise. `None` for `ptr` behaves like
  /// [`alloc`](Self::alloc).
  ///
  /// On `None` the original allocation is untouched and still owned by the
  /// caller.
  ///
  /// # Safety
  ///
  /// `ptr`, if given, must be a live allocation of this zone.
  pub unsafe fn realloc(&mut self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
    let Some(ptr) = ptr else {
      return self.alloc(size);
    };

    if let Some(same) = unsafe { self.resize_in_place(ptr, size) } {
      return Some(same);
    }

    let old = unsafe { self.usable_size(ptr) };
    let new = self.alloc(size)?;
    unsafe {
      new.as_ptr().copy_from_nonoverlapping(ptr.as_ptr(), old.min(size));
      self.free(ptr);
    }

    log::trace!(
      "zone {:p}: moved {:p} -> {:p} ({} -> {} bytes)",
      self.arena.base(),
      ptr,
      new,
      old,
      size
    );
    Some(new)
  }

  /// Grows or shrinks an allocation without moving it.
  ///
  /// Growth only borrows from the physically next block, which must be free
  /// and large enough. Shrinking always succeeds; a tail too small to form a
  /// block stays with the allocation.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live allocation of this zone.
  pub unsafe fn resize_in_place(&mut self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
    if size > self.arena.len() {
      return None;
    }

    self.tripwire("resize start");

    let size = round_up(size);
    let arena = self.arena;
    let blk = arena.block_of(ptr);

    unsafe {
      let cur = arena.size(blk);

      if size > cur {
        let req = size - cur;
        let next = arena.next_in_zone(blk)?;
        if !arena.is_free(next) || req > HEADER_SIZE + arena.size(next) {
          return None;
        }

        let nsize = arena.size(next);
        self.buckets.remove(&arena, next);

        let rem = HEADER_SIZE + nsize - req;
        if rem >= MIN_BLOCK {
          arena.set_size(blk, size);
          let tail = arena.next_of(blk);
          arena.write_header(tail, size, rem - HEADER_SIZE, true);
          self.buckets.insert(&arena, tail);
          arena.fix_successor(tail);
          self.stat(|s| {
            s.alloc += req;
            s.avail -= req;
          });
        } else {
          // Leftover too small for a block: take the whole neighbour.
          arena.set_size(blk, cur + HEADER_SIZE + nsize);
          arena.fix_successor(blk);
          self.stat(|s| {
            s.nfree -= 1;
            s.alloc += HEADER_SIZE + nsize;
            s.avail -= nsize;
          });
        }
      } else if cur - size >= MIN_BLOCK {
        let rem = cur - size;
        match arena.next_in_zone(blk) {
          Some(next) if arena.is_free(next) => {
            // The released tail and the free neighbour become one block.
            let nsize = arena.size(next);
            self.buckets.remove(&arena, next);
            arena.set_size(blk, size);
            let tail = arena.next_of(blk);
            arena.write_header(tail, size, rem + nsize, true);
            self.buckets.insert(&arena, tail);
            arena.fix_successor(tail);
            self.stat(|s| {
              s.alloc -= rem;
              s.avail += rem;
            });
          }
          _ => {
            arena.set_size(blk, size);
            let tail = arena.next_of(blk);
            arena.write_header(tail, size, rem - HEADER_SIZE, true);
            self.buckets.insert(&arena, tail);
            arena.fix_successor(tail);
            self.stat(|s| {
              s.nfree += 1;
              s.alloc -= rem;
              s.avail += rem - HEADER_SIZE;
            });
          }
        }
      }
    }

    self.tripwire("resize end");
    Some(ptr)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::block::MIN_ALLOC;

  fn free_blocks(zone: &Zone) -> Vec<(usize, usize)> {
    zone
      .blocks()
      .filter(|b| b.free)
      .map(|b| (b.offset, b.size))
      .collect()
  }

  #[test]
  fn init_rounds_zone_size() {
    let zone = Zone::new(1).unwrap();
    assert_eq!(zone.capacity(), MIN_BLOCK);
    assert!(zone.owns_backing());

    let zone = Zone::new(4095).unwrap();
    assert_eq!(zone.capacity(), 4096);
    assert_eq!(free_blocks(&zone), vec![(0, 4096 - HEADER_SIZE)]);
  }

  #[test]
  fn init_rejects_unrepresentable_size() {
    assert_eq!(
      Zone::new(usize::MAX).err(),
      Some(Error::SizeOverflow { size: usize::MAX })
    );
  }

  #[test]
  fn init_in_aligns_borrowed_region() {
    let mut buf = vec![0u8; 1024 + 3];
    let region = NonNull::new(unsafe { buf.as_mut_ptr().add(3) }).unwrap();
    let zone = unsafe { Zone::init_in(LibcHost, region, 1024) }.unwrap();
    assert!(!zone.owns_backing());
    assert_eq!(zone.capacity() % ALIGN, 0);
    assert!(zone.capacity() <= 1024);
    assert!(zone.capacity() >= 1024 - ALIGN);
    assert_eq!(zone.arena.base().as_ptr() as usize % ALIGN, 0);

    let tiny = NonNull::new(buf.as_mut_ptr()).unwrap();
    assert_eq!(
      unsafe { Zone::init_in(LibcHost, tiny, MIN_BLOCK - 1) }.err(),
      Some(Error::RegionTooSmall { len: MIN_BLOCK - 1, min: MIN_BLOCK })
    );
  }

  #[test]
  fn zero_byte_request_gets_minimum_payload() {
    let mut zone = Zone::new(4096).unwrap();
    let ptr = zone.alloc(0).unwrap();
    assert_eq!(unsafe { zone.usable_size(ptr) }, MIN_ALLOC);
    assert_eq!(ptr.as_ptr() as usize % ALIGN, 0);
  }

  #[test]
  fn split_leaves_free_tail() {
    let mut zone = Zone::new(4096).unwrap();
    let ptr = zone.alloc(100).unwrap();
    let size = round_up(100);
    assert_eq!(unsafe { zone.usable_size(ptr) }, size);
    assert_eq!(
      free_blocks(&zone),
      vec![(HEADER_SIZE + size, 4096 - 2 * HEADER_SIZE - size)]
    );
  }

  #[test]
  fn no_split_when_remainder_too_small() {
    let mut zone = Zone::new(4096).unwrap();
    let whole = 4096 - HEADER_SIZE;
    // Leaves less than a minimum block behind.
    let ptr = zone.alloc(whole - MIN_BLOCK + ALIGN).unwrap();
    assert_eq!(unsafe { zone.usable_size(ptr) }, whole);
    assert!(free_blocks(&zone).is_empty());
    assert_eq!(zone.alloc(1), None);
  }

  #[test]
  fn exact_bucket_is_reused() {
    let mut zone = Zone::new(4096).unwrap();
    let a = zone.alloc(64).unwrap();
    let _guard = zone.alloc(64).unwrap();
    unsafe { zone.free(a) };
    assert_eq!(zone.alloc(64), Some(a));
  }

  #[test]
  fn small_request_takes_larger_small_block_first() {
    let mut zone = Zone::new(4096).unwrap();
    let a = zone.alloc(100).unwrap();
    let _b = zone.alloc(200).unwrap();
    unsafe { zone.free(a) };

    let c = zone.alloc(50).unwrap();
    assert_eq!(c, a);
  }

  #[test]
  fn exhaustion_leaves_zone_untouched() {
    let mut zone = Zone::new(4096).unwrap();
    let _a = zone.alloc(1000).unwrap();
    let before = free_blocks(&zone);
    assert_eq!(zone.alloc(4096), None);
    assert_eq!(zone.alloc(usize::MAX), None);
    assert_eq!(free_blocks(&zone), before);
  }

  #[cfg(feature = "stat")]
  #[test]
  fn stats_track_operations() {
    let mut zone = Zone::new(4096).unwrap();
    let initial = zone.stats();
    assert_eq!(
      initial,
      Stats {
        total: 4096,
        alloc: 0,
        avail: 4096 - HEADER_SIZE,
        nused: 0,
        nfree: 1
      }
    );

    let a = zone.alloc(100).unwrap();
    let s = zone.stats();
    assert_eq!(s.nused, 1);
    assert_eq!(s.alloc, round_up(100));
    assert_eq!(s.alloc + s.avail + (s.nused + s.nfree) * HEADER_SIZE, s.total);

    let a = unsafe { zone.realloc(Some(a), 40) }.unwrap();
    let a = unsafe { zone.realloc(Some(a), 900) }.unwrap();
    let s = zone.stats();
    assert_eq!(s.alloc, round_up(900));
    assert_eq!(s.alloc + s.avail + (s.nused + s.nfree) * HEADER_SIZE, s.total);

    unsafe { zone.free(a) };
    assert_eq!(zone.stats(), initial);
  }
}
