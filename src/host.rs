//! Host allocators a zone obtains its backing bytes from.

use core::ptr::{NonNull, null_mut};

use crate::class::ALIGN;

/// Raw byte allocator used to obtain and release a zone's backing region and
/// the control block of a [`ZoneBox`](crate::ZoneBox).
///
/// # Safety
///
/// `alloc` must return memory aligned to at least [`ALIGN`] and valid for
/// `size` bytes until it is passed back to `free` with the same `size`.
pub unsafe trait HostAlloc {
  fn alloc(&self, size: usize) -> Option<NonNull<u8>>;

  /// # Safety
  ///
  /// `ptr` must come from `alloc` on this host with the same `size`.
  unsafe fn free(&self, ptr: NonNull<u8>, size: usize);
}

unsafe impl<H: HostAlloc + ?Sized> HostAlloc for &H {
  #[inline]
  fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
    (**self).alloc(size)
  }

  #[inline]
  unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
    unsafe { (**self).free(ptr, size) }
  }
}

// =============================================================================
// Platform
// =============================================================================

/// The C heap (`posix_memalign` / `free`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LibcHost;

unsafe impl HostAlloc for LibcHost {
  fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
    let mut ptr = null_mut();
    let align = ALIGN.max(size_of::<*mut u8>());
    let rc = unsafe { libc::posix_memalign(&mut ptr, align, size) };
    if rc != 0 {
      return None;
    }
    NonNull::new(ptr as *mut u8)
  }

  unsafe fn free(&self, ptr: NonNull<u8>, _size: usize) {
    unsafe { libc::free(ptr.as_ptr().cast()) };
  }
}

/// Anonymous private mappings straight from the kernel. Page aligned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MmapHost;

unsafe impl HostAlloc for MmapHost {
  fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
    let ptr = unsafe {
      libc::mmap(
        null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
      )
    };

    if ptr == libc::MAP_FAILED {
      None
    } else {
      NonNull::new(ptr as *mut u8)
    }
  }

  unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
    unsafe { libc::munmap(ptr.as_ptr().cast(), size) };
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn exercise<H: HostAlloc>(host: H) {
    for size in [1, 16, 4096, 1 << 20] {
      let ptr = host.alloc(size).expect("host allocation");
      assert_eq!(ptr.as_ptr() as usize % ALIGN, 0);
      unsafe {
        ptr.as_ptr().write_bytes(0xA5, size);
        assert_eq!(*ptr.as_ptr().add(size - 1), 0xA5);
        host.free(ptr, size);
      }
    }
  }

  #[test]
  fn libc_host_is_aligned() {
    exercise(LibcHost);
  }

  #[test]
  fn mmap_host_is_aligned() {
    exercise(MmapHost);
  }

  #[test]
  fn borrowed_host_forwards() {
    let host = LibcHost;
    exercise(&host);
  }
}
