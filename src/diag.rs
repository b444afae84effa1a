//! Zone walking, dumping and consistency checks.
//!
//! None of this is needed for correct operation. It exists for debugging and
//! for tests.

use core::fmt;

use crate::{
  block::{Arena, HEADER_SIZE, MIN_ALLOC},
  buckets::Link,
  class::{ALIGN, BUCKET_COUNT},
  error::Corruption,
  host::HostAlloc,
  zone::Zone,
};

/// One physical block as seen by [`Zone::blocks`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
  /// Offset of the header from the zone start.
  pub offset: usize,
  /// Payload size, header excluded.
  pub size: usize,
  pub free: bool,
  /// Address of the header.
  pub addr: *const u8,
}

/// Aggregates over every block of a zone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Census {
  pub used_blocks: usize,
  pub free_blocks: usize,
  /// Payload bytes in used blocks.
  pub used_bytes: usize,
  /// Payload bytes in free blocks.
  pub free_bytes: usize,
  /// Bytes taken by headers.
  pub header_bytes: usize,
  /// Payload of the largest free block.
  pub largest_free: usize,
}

impl Census {
  pub fn blocks(&self) -> usize {
    self.used_blocks + self.free_blocks
  }

  /// Bytes accounted for. Equals the zone capacity in a healthy zone.
  pub fn total(&self) -> usize {
    self.used_bytes + self.free_bytes + self.header_bytes
  }

  fn record(&mut self, size: usize, free: bool) {
    self.header_bytes += HEADER_SIZE;
    if free {
      self.free_blocks += 1;
      self.free_bytes += size;
      self.largest_free = self.largest_free.max(size);
    } else {
      self.used_blocks += 1;
      self.used_bytes += size;
    }
  }
}

/// Iterator over the physical blocks of a zone, lowest address first.
pub struct Blocks<'a> {
  arena: Arena,
  off: usize,
  _zone: core::marker::PhantomData<&'a ()>,
}

impl Iterator for Blocks<'_> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<BlockInfo> {
    if self.off + HEADER_SIZE > self.arena.len() {
      return None;
    }

    // SAFETY: the header lies inside the zone, which is borrowed for 'a.
    let (size, free, addr) = unsafe {
      (
        self.arena.size(self.off),
        self.arena.is_free(self.off),
        self.arena.at(self.off) as *const u8,
      )
    };

    let info = BlockInfo {
      offset: self.off,
      size,
      free,
      addr,
    };
    // A nonsensical size ends the walk instead of running off the zone.
    self.off = self
      .off
      .checked_add(HEADER_SIZE + size)
      .filter(|_| size % ALIGN == 0 && size >= MIN_ALLOC)
      .unwrap_or(usize::MAX - HEADER_SIZE);
    Some(info)
  }
}

impl<H: HostAlloc> Zone<H> {
  pub fn blocks(&self) -> Blocks<'_> {
    Blocks {
      arena: self.arena,
      off: 0,
      _zone: core::marker::PhantomData,
    }
  }

  pub fn census(&self) -> Census {
    let mut census = Census::default();
    for block in self.blocks() {
      census.record(block.size, block.free);
    }
    census
  }

  /// Writes one line per block followed by totals.
  pub fn dump<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
    writeln!(out, "zone {:p} ({} bytes)", self.arena.base(), self.arena.len())?;

    #[cfg(feature = "stat")]
    {
      let stats = self.stats();
      writeln!(
        out,
        "stats: total={} alloc={} avail={} nused={} nfree={}",
        stats.total, stats.alloc, stats.avail, stats.nused, stats.nfree
      )?;
    }

    writeln!(out, " {:<18} {:<5} address", "size", "free")?;
    let mut census = Census::default();
    for block in self.blocks() {
      writeln!(out, " {:<18} {:<5} {:p}", block.size, block.free as u8, block.addr)?;
      census.record(block.size, block.free);
    }

    writeln!(out, "---------------------------------------")?;
    writeln!(out, "allocated       : {:>18} bytes", census.used_bytes)?;
    writeln!(out, "available       : {:>18} bytes", census.free_bytes)?;
    writeln!(out, "internal        : {:>18} bytes", census.header_bytes)?;
    writeln!(out, "total           : {:>18} bytes", census.total())
  }

  /// Walks the zone and every free list, checking all layout invariants.
  ///
  /// Does not allocate.
  pub fn verify(&self) -> Result<Census, Corruption> {
    let arena = self.arena;
    let len = arena.len();
    let mut census = Census::default();
    let mut prev: Option<(usize, usize, bool)> = None;
    let mut off = 0;

    while off < len {
      if off + HEADER_SIZE > len {
        return Err(Corruption::Overrun { offset: off });
      }

      let (size, free, prev_size) = unsafe { (arena.size(off), arena.is_free(off), arena.prev_size(off)) };

      match prev {
        None if prev_size != 0 => return Err(Corruption::FirstPrevSize { found: prev_size }),
        Some((_, expected, _)) if prev_size != expected => {
          return Err(Corruption::PrevSize {
            offset: off,
            expected,
            found: prev_size,
          });
        }
        Some((prev_off, _, true)) if free => {
          return Err(Corruption::AdjacentFree {
            offset: prev_off,
            next: off,
          });
        }
        _ => {}
      }

      if size < MIN_ALLOC || size % ALIGN != 0 {
        return Err(Corruption::BadSize { offset: off, size });
      }
      let next = match off.checked_add(HEADER_SIZE + size) {
        Some(next) if next <= len => next,
        _ => return Err(Corruption::Overrun { offset: off }),
      };

      census.record(size, free);
      prev = Some((off, size, free));
      off = next;
    }

    if census.total() != len {
      return Err(Corruption::Conservation {
        expected: len,
        found: census.total(),
      });
    }

    let mut listed = 0;
    for bucket in 0..BUCKET_COUNT {
      for link in unsafe { self.buckets.chain(&arena, bucket) } {
        let offset = match link {
          Link::Block(offset) => offset,
          Link::Broken { from, to } => return Err(Corruption::BrokenLink { bucket, from, to }),
        };

        listed += 1;
        if listed > census.free_blocks {
          return Err(Corruption::Unlisted {
            listed,
            free: census.free_blocks,
          });
        }

        let (size, free) = unsafe { (arena.size(offset), arena.is_free(offset)) };
        if !free || size < MIN_ALLOC || size % ALIGN != 0 {
          return Err(Corruption::NotFree { bucket, offset });
        }
        let expected = self.buckets.index(size);
        if expected != bucket {
          return Err(Corruption::WrongBucket {
            bucket,
            offset,
            expected,
          });
        }
      }
    }

    if listed != census.free_blocks {
      return Err(Corruption::Unlisted {
        listed,
        free: census.free_blocks,
      });
    }

    #[cfg(feature = "stat")]
    {
      let stats = self.stats;
      let checks = [
        ("total", stats.total, len),
        ("alloc", stats.alloc, census.used_bytes),
        ("avail", stats.avail, census.free_bytes),
        ("nused", stats.nused, census.used_blocks),
        ("nfree", stats.nfree, census.free_blocks),
      ];
      for (field, recorded, walked) in checks {
        if recorded != walked {
          return Err(Corruption::Stat {
            field,
            recorded,
            walked,
          });
        }
      }
    }

    Ok(census)
  }
}
