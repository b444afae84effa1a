//! Zones whose control block lives in host memory.
//!
//! ```text
//!   host allocation
//!   ┌────────────────────────────┬──────────────────────┐
//!   │ Control { zone, extra }    │ extension (extra B)  │
//!   └────────────────────────────┴──────────────────────┘
//!         │
//!         └── zone bytes: a second host allocation, or a caller region
//! ```

use core::{
  mem::{ManuallyDrop, align_of, size_of},
  ops::{Deref, DerefMut},
  ptr::NonNull,
  slice,
};

use crate::{
  class::{ALIGN, align_up},
  error::{Error, Result},
  host::{HostAlloc, LibcHost},
  zone::Zone,
};

/// Head of the host allocation. `zone` must stay the first field so a zone
/// pointer doubles as a control pointer.
#[repr(C)]
struct Control<H: HostAlloc> {
  zone: Zone<H>,
  extra: usize,
}

impl<H: HostAlloc> Control<H> {
  /// Offset of the extension area from the start of the control block.
  const EXTENSION: usize = align_up(size_of::<Self>(), ALIGN);

  fn footprint(extra: usize) -> Result<usize> {
    Self::EXTENSION
      .checked_add(extra)
      .filter(|&total| total <= isize::MAX as usize)
      .ok_or(Error::SizeOverflow { size: extra })
  }
}

/// A [`Zone`] plus a zero-filled extension area of caller-chosen size, both
/// obtained from the host allocator and released together on drop.
pub struct ZoneBox<H: HostAlloc + Clone = LibcHost> {
  ctrl: NonNull<Control<H>>,
}

unsafe impl<H: HostAlloc + Clone + Send> Send for ZoneBox<H> {}

impl<H: HostAlloc + Clone> ZoneBox<H> {
  /// Opens a zone of `zone_size` bytes with an `extra`-byte extension area.
  pub fn open(host: H, extra: usize, zone_size: usize) -> Result<Self> {
    Self::open_with(host, extra, |host| Zone::init(host, zone_size))
  }

  /// Opens a zone over a caller-supplied region. Only the control block and
  /// extension come from `host`.
  ///
  /// # Safety
  ///
  /// Same contract as [`Zone::init_in`].
  pub unsafe fn open_in(host: H, extra: usize, region: NonNull<u8>, len: usize) -> Result<Self> {
    Self::open_with(host, extra, |host| unsafe { Zone::init_in(host, region, len) })
  }

  fn open_with(host: H, extra: usize, make: impl FnOnce(H) -> Result<Zone<H>>) -> Result<Self> {
    let align = align_of::<Control<H>>();
    if align > ALIGN {
      return Err(Error::ControlAlignment { align });
    }

    let total = Control::<H>::footprint(extra)?;
    let Some(mem) = host.alloc(total) else {
      log::debug!("host refused {total} bytes for a zone control block");
      return Err(Error::HostAlloc { size: total });
    };

    let zone = match make(host.clone()) {
      Ok(zone) => zone,
      Err(err) => {
        unsafe { host.free(mem, total) };
        return Err(err);
      }
    };

    let ctrl = mem.cast::<Control<H>>();
    unsafe {
      ctrl.write(Control { zone, extra });
      mem.as_ptr().add(Control::<H>::EXTENSION).write_bytes(0, extra);
    }

    log::debug!("opened zone box {:p} with {} extension bytes", mem, extra);
    Ok(Self { ctrl })
  }

  /// Closes the zone. Same as dropping it.
  pub fn close(self) {
    drop(self)
  }

  pub fn extension_ptr(&self) -> NonNull<u8> {
    unsafe { self.ctrl.cast::<u8>().add(Control::<H>::EXTENSION) }
  }

  pub fn extension(&self) -> &[u8] {
    unsafe { slice::from_raw_parts(self.extension_ptr().as_ptr(), self.ctrl.as_ref().extra) }
  }

  pub fn extension_mut(&mut self) -> &mut [u8] {
    unsafe { slice::from_raw_parts_mut(self.extension_ptr().as_ptr(), self.ctrl.as_ref().extra) }
  }

  /// Gives up ownership. The pointer stays valid until passed to
  /// [`from_raw`](Self::from_raw) and dropped.
  pub fn into_raw(self) -> NonNull<Zone<H>> {
    ManuallyDrop::new(self).ctrl.cast()
  }

  /// # Safety
  ///
  /// `zone` must come from [`into_raw`](Self::into_raw) with the same `H`,
  /// and be reclaimed only once.
  pub unsafe fn from_raw(zone: NonNull<Zone<H>>) -> Self {
    Self { ctrl: zone.cast() }
  }
}

impl<H: HostAlloc + Clone> Deref for ZoneBox<H> {
  type Target = Zone<H>;

  fn deref(&self) -> &Zone<H> {
    unsafe { &self.ctrl.as_ref().zone }
  }
}

impl<H: HostAlloc + Clone> DerefMut for ZoneBox<H> {
  fn deref_mut(&mut self) -> &mut Zone<H> {
    unsafe { &mut self.ctrl.as_mut().zone }
  }
}

impl<H: HostAlloc + Clone> Drop for ZoneBox<H> {
  fn drop(&mut self) {
    unsafe {
      let ctrl = self.ctrl.as_ptr();
      let host = (*ctrl).zone.host().clone();
      let total = Control::<H>::EXTENSION + (*ctrl).extra;

      ctrl.drop_in_place();
      host.free(self.ctrl.cast(), total);
    }
    log::debug!("closed zone box {:p}", self.ctrl);
  }
}
