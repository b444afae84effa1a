//! Sharing a zone between threads.

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::UnsafeCell,
  hint,
  ops::{Deref, DerefMut},
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicBool, Ordering},
};

use crate::{
  class::ALIGN,
  host::{HostAlloc, LibcHost},
  zone::Zone,
};

struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  fn lock(&self) {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
  }

  #[inline]
  fn try_lock(&self) -> bool {
    self
      .locked
      .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_ok()
  }

  #[inline]
  fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

/// A [`Zone`] behind a spin lock.
///
/// Every call holds the lock for one zone operation, which never blocks or
/// calls out. Also usable through [`GlobalAlloc`] for layouts aligned to at
/// most [`ALIGN`].
pub struct LockedZone<H: HostAlloc = LibcHost> {
  lock: SpinLock,
  zone: UnsafeCell<Zone<H>>,
}

unsafe impl<H: HostAlloc + Send> Sync for LockedZone<H> {}

impl<H: HostAlloc> LockedZone<H> {
  pub const fn new(zone: Zone<H>) -> Self {
    Self {
      lock: SpinLock::new(),
      zone: UnsafeCell::new(zone),
    }
  }

  pub fn lock(&self) -> ZoneGuard<'_, H> {
    self.lock.lock();
    ZoneGuard { owner: self }
  }

  pub fn try_lock(&self) -> Option<ZoneGuard<'_, H>> {
    self.lock.try_lock().then_some(ZoneGuard { owner: self })
  }

  pub fn into_inner(self) -> Zone<H> {
    self.zone.into_inner()
  }

  pub fn get_mut(&mut self) -> &mut Zone<H> {
    self.zone.get_mut()
  }
}

/// Exclusive access to a [`LockedZone`]. Unlocks on drop.
pub struct ZoneGuard<'a, H: HostAlloc> {
  owner: &'a LockedZone<H>,
}

impl<H: HostAlloc> Deref for ZoneGuard<'_, H> {
  type Target = Zone<H>;

  fn deref(&self) -> &Zone<H> {
    unsafe { &*self.owner.zone.get() }
  }
}

impl<H: HostAlloc> DerefMut for ZoneGuard<'_, H> {
  fn deref_mut(&mut self) -> &mut Zone<H> {
    unsafe { &mut *self.owner.zone.get() }
  }
}

impl<H: HostAlloc> Drop for ZoneGuard<'_, H> {
  fn drop(&mut self) {
    self.owner.lock.unlock();
  }
}

// =============================================================================
// GlobalAlloc
// =============================================================================

unsafe impl<H: HostAlloc + Send> GlobalAlloc for LockedZone<H> {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if layout.align() > ALIGN {
      return null_mut();
    }
    self.lock().alloc(layout.size()).map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    if let Some(ptr) = NonNull::new(ptr) {
      unsafe { self.lock().free(ptr) }
    }
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.align() > ALIGN {
      return null_mut();
    }
    self.lock().calloc(layout.size()).map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() > ALIGN {
      return null_mut();
    }
    unsafe { self.lock().realloc(NonNull::new(ptr), new_size) }.map_or(null_mut(), NonNull::as_ptr)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn guard_releases_lock() {
    let locked = LockedZone::new(Zone::new(4096).unwrap());
    {
      let mut zone = locked.lock();
      assert!(locked.try_lock().is_none());
      zone.alloc(16).unwrap();
    }
    assert!(locked.try_lock().is_some());
    assert_eq!(locked.into_inner().census().used_blocks, 1);
  }

  #[test]
  fn global_alloc_rejects_over_alignment() {
    let locked = LockedZone::new(Zone::new(4096).unwrap());
    unsafe {
      let ptr = locked.alloc(Layout::from_size_align(64, ALIGN * 2).unwrap());
      assert!(ptr.is_null());

      let layout = Layout::from_size_align(64, ALIGN).unwrap();
      let ptr = locked.alloc_zeroed(layout);
      assert!(!ptr.is_null());
      assert_eq!(*ptr.add(63), 0);

      let ptr = locked.realloc(ptr, layout, 512);
      assert!(!ptr.is_null());
      locked.dealloc(ptr, Layout::from_size_align(512, ALIGN).unwrap());
    }
    assert_eq!(locked.lock().census().used_blocks, 0);
  }
}
