use crate::block::MIN_ALLOC;

// =============================================================================
// Constants
// =============================================================================

/// Payload alignment and size granularity: twice the pointer width, so that
/// payloads stay aligned for 16-byte vector stores (`movaps` on x86_64).
pub const ALIGN: usize = size_of::<*const u8>() * 2;

/// Number of exact-size buckets at the bottom of the table (`ALIGN`, `2 * ALIGN`, ...).
pub const FIXED: usize = 32;

/// Bits available for a block size once the free bit is packed next to it.
pub(crate) const SIZE_BITS: usize = usize::BITS as usize - 1;

/// Bucket count: fixed region, one large bucket per power of two, one huge bucket.
pub(crate) const BUCKET_COUNT: usize = FIXED + SIZE_BITS + 1;

/// Index of the catch-all bucket.
pub(crate) const HUGE: usize = BUCKET_COUNT - 1;

const _: () = assert!(ALIGN.is_power_of_two());
const _: () = assert!(MIN_ALLOC % ALIGN == 0);

/// Part of the bucket table an index falls into.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Region {
  /// One bucket per exact multiple of `ALIGN`.
  Fixed,
  /// One bucket per power-of-two size class.
  Large,
  /// Single first-fit bucket for everything past the table.
  Huge,
}

impl Region {
  #[inline]
  pub fn of(index: usize) -> Self {
    if index < FIXED {
      Region::Fixed
    } else if index < HUGE {
      Region::Large
    } else {
      Region::Huge
    }
  }
}

// =============================================================================
// Size Classes
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

/// Payload size actually reserved for a request of `requested` bytes.
///
/// Requests below the minimum payload are promoted to it; everything is then
/// rounded up to a multiple of [`ALIGN`]. Callers bound `requested` by the zone
/// size first, so the rounding cannot overflow.
#[inline]
pub const fn round_up(requested: usize) -> usize {
  let size = if requested < MIN_ALLOC { MIN_ALLOC } else { requested };
  align_up(size, ALIGN)
}

/// Floor of log2(`n`). `n` must be non-zero.
#[inline(always)]
pub(crate) const fn szlog2(n: usize) -> usize {
  (usize::BITS as usize - 1) - n.leading_zeros() as usize
}

/// Decrement that makes the first large bucket land on index [`FIXED`].
#[inline]
pub const fn base_decrement() -> usize {
  szlog2(FIXED * ALIGN)
}

/// Bucket a block of `size` payload bytes belongs to.
///
/// `bdec` is the zone's precomputed [`base_decrement`].
#[inline]
pub fn bucket_index(size: usize, bdec: usize) -> usize {
  debug_assert!(size >= ALIGN);
  let index = size / ALIGN - 1;
  if index < FIXED {
    return index;
  }
  (szlog2(size) - bdec + FIXED).min(HUGE)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn round_up_promotes_and_aligns() {
    assert_eq!(round_up(0), MIN_ALLOC);
    assert_eq!(round_up(1), MIN_ALLOC);
    assert_eq!(round_up(MIN_ALLOC), MIN_ALLOC);
    assert_eq!(round_up(MIN_ALLOC + 1), MIN_ALLOC + ALIGN);

    for requested in 0..4096 {
      let size = round_up(requested);
      assert_eq!(size % ALIGN, 0);
      assert!(size >= requested);
      assert!(size >= MIN_ALLOC);
      assert!(size < requested.max(MIN_ALLOC) + ALIGN);
    }
  }

  #[test]
  fn fixed_region_is_exact() {
    let bdec = base_decrement();
    for index in 0..FIXED {
      let size = (index + 1) * ALIGN;
      assert_eq!(bucket_index(size, bdec), index);
      assert_eq!(Region::of(index), Region::Fixed);
    }
  }

  #[test]
  fn large_region_starts_right_after_fixed() {
    let bdec = base_decrement();
    let first_large = (FIXED + 1) * ALIGN;
    assert_eq!(bucket_index(first_large, bdec), FIXED);
    assert_eq!(Region::of(FIXED), Region::Large);

    // Every doubling moves one bucket up.
    let mut size = FIXED * ALIGN * 2;
    let mut expected = FIXED + 1;
    while size < usize::MAX / 4 {
      assert_eq!(bucket_index(size, bdec), expected);
      assert_eq!(bucket_index(size * 2 - ALIGN, bdec), expected);
      size *= 2;
      expected += 1;
    }
  }

  #[test]
  fn bucket_index_is_monotonic_and_bounded() {
    let bdec = base_decrement();
    let mut last = 0;
    let mut size = ALIGN;
    while size < 1 << 24 {
      let index = bucket_index(size, bdec);
      assert!(index >= last);
      assert!(index <= HUGE);
      last = index;
      size += ALIGN;
    }
    assert!(bucket_index(align_up(usize::MAX >> 1, ALIGN), bdec) <= HUGE);
  }

  #[test]
  fn szlog2_matches_naive_loop() {
    for n in 1..10_000usize {
      let mut x = 0;
      while (n >> x) > 1 {
        x += 1;
      }
      assert_eq!(szlog2(n), x);
    }
    assert_eq!(szlog2(usize::MAX), usize::BITS as usize - 1);
  }
}
