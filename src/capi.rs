//! `extern "C"` entry points (enabled with `--features c_api`).
//!
//! Every handle is a `*mut SegZone`. Handles from [`segzone_open`] own their
//! control block; [`segzone_init`] builds a zone in caller storage of
//! [`segzone_sizeof`] bytes aligned to [`segzone_alignof`].

use core::{
  ffi::{c_char, c_int, c_void},
  fmt,
  mem::{ManuallyDrop, align_of, size_of},
  ptr::{NonNull, null_mut},
};

use crate::{boxed::ZoneBox, host::LibcHost, zone::Zone};

pub type SegZone = Zone<LibcHost>;

/// Line sink used by [`segzone_dump`].
pub type SegZoneWriter = unsafe extern "C" fn(ctx: *mut c_void, line: *const c_char) -> c_int;

#[unsafe(no_mangle)]
pub unsafe extern "C" fn segzone_open(extra: usize, region: *mut u8, size: usize) -> *mut SegZone {
  let opened = match NonNull::new(region) {
    Some(region) => unsafe { ZoneBox::open_in(LibcHost, extra, region, size) },
    None => ZoneBox::open(LibcHost, extra, size),
  };

  match opened {
    Ok(zb) => zb.into_raw().as_ptr(),
    Err(err) => {
      log::debug!("segzone_open: {err}");
      null_mut()
    }
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn segzone_close(zone: *mut SegZone) {
  if let Some(zone) = NonNull::new(zone) {
    drop(unsafe { ZoneBox::<LibcHost>::from_raw(zone) });
  }
}

/// Extension area of a handle from [`segzone_open`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn segzone_extension(zone: *mut SegZone) -> *mut u8 {
  match NonNull::new(zone) {
    Some(zone) => ManuallyDrop::new(unsafe { ZoneBox::<LibcHost>::from_raw(zone) })
      .extension_ptr()
      .as_ptr(),
    None => null_mut(),
  }
}

#[unsafe(no_mangle)]
pub extern "C" fn segzone_sizeof() -> usize {
  size_of::<SegZone>()
}

#[unsafe(no_mangle)]
pub extern "C" fn segzone_alignof() -> usize {
  align_of::<SegZone>()
}

/// Returns 0 on success, -1 on failure.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn segzone_init(storage: *mut SegZone, region: *mut u8, size: usize) -> c_int {
  if storage.is_null() || storage as usize % align_of::<SegZone>() != 0 {
    return -1;
  }

  let zone = match NonNull::new(region) {
    Some(region) => unsafe { Zone::init_in(LibcHost, region, size) },
    None => Zone::init(LibcHost, size),
  };

  match zone {
    Ok(zone) => {
      unsafe { storage.write(zone) };
      0
    }
    Err(err) => {
      log::debug!("segzone_init: {err}");
      -1
    }
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn segzone_fini(storage: *mut SegZone) {
  if !storage.is_null() {
    unsafe { storage.drop_in_place() };
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn segzone_alloc(zone: *mut SegZone, size: usize) -> *mut u8 {
  match unsafe { zone.as_mut() } {
    Some(zone) => zone.alloc(size).map_or(null_mut(), NonNull::as_ptr),
    None => null_mut(),
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn segzone_calloc(zone: *mut SegZone, size: usize) -> *mut u8 {
  match unsafe { zone.as_mut() } {
    Some(zone) => zone.calloc(size).map_or(null_mut(), NonNull::as_ptr),
    None => null_mut(),
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn segzone_realloc(zone: *mut SegZone, ptr: *mut u8, size: usize) -> *mut u8 {
  match unsafe { zone.as_mut() } {
    Some(zone) => unsafe { zone.realloc(NonNull::new(ptr), size) }.map_or(null_mut(), NonNull::as_ptr),
    None => null_mut(),
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn segzone_free(zone: *mut SegZone, ptr: *mut u8) {
  if let (Some(zone), Some(ptr)) = (unsafe { zone.as_mut() }, NonNull::new(ptr)) {
    unsafe { zone.free(ptr) }
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn segzone_usable_size(zone: *mut SegZone, ptr: *mut u8) -> usize {
  match (unsafe { zone.as_ref() }, NonNull::new(ptr)) {
    (Some(zone), Some(ptr)) => unsafe { zone.usable_size(ptr) },
    _ => 0,
  }
}

/// Feeds the dump to `writer` one NUL-terminated line at a time. Stops at the
/// first nonzero return. Returns 0 on success, -1 otherwise.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn segzone_dump(
  zone: *mut SegZone,
  writer: Option<SegZoneWriter>,
  ctx: *mut c_void,
) -> c_int {
  let (Some(zone), Some(writer)) = (unsafe { zone.as_ref() }, writer) else {
    return -1;
  };

  let mut sink = LineSink {
    writer,
    ctx,
    line: Vec::with_capacity(128),
  };
  match zone.dump(&mut sink).and_then(|()| sink.flush()) {
    Ok(()) => 0,
    Err(fmt::Error) => -1,
  }
}

/// Buffers formatted text and hands it over line by line.
struct LineSink {
  writer: SegZoneWriter,
  ctx: *mut c_void,
  line: Vec<u8>,
}

impl LineSink {
  fn flush(&mut self) -> fmt::Result {
    if self.line.is_empty() {
      return Ok(());
    }
    self.line.push(0);
    let rc = unsafe { (self.writer)(self.ctx, self.line.as_ptr().cast()) };
    self.line.clear();
    if rc == 0 { Ok(()) } else { Err(fmt::Error) }
  }
}

impl fmt::Write for LineSink {
  fn write_str(&mut self, s: &str) -> fmt::Result {
    for byte in s.bytes() {
      match byte {
        b'\n' => self.flush()?,
        0 => {}
        _ => self.line.push(byte),
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use core::{ffi::CStr, mem::MaybeUninit};

  unsafe extern "C" fn collect(ctx: *mut c_void, line: *const c_char) -> c_int {
    let lines = unsafe { &mut *(ctx as *mut Vec<String>) };
    lines.push(unsafe { CStr::from_ptr(line) }.to_string_lossy().into_owned());
    0
  }

  #[test]
  fn open_alloc_dump_close() {
    unsafe {
      let zone = segzone_open(32, null_mut(), 4096);
      assert!(!zone.is_null());
      assert_eq!(*segzone_extension(zone).add(31), 0);

      let a = segzone_alloc(zone, 100);
      let b = segzone_calloc(zone, 200);
      assert!(!a.is_null() && !b.is_null());
      assert_eq!(segzone_usable_size(zone, a), 112);

      let a = segzone_realloc(zone, a, 150);
      assert!(!a.is_null());

      let mut lines: Vec<String> = Vec::new();
      let rc = segzone_dump(zone, Some(collect), (&mut lines as *mut Vec<String>).cast());
      assert_eq!(rc, 0);
      assert!(lines.iter().any(|line| line.starts_with("total")));

      segzone_free(zone, a);
      segzone_free(zone, b);
      segzone_free(zone, null_mut());
      segzone_close(zone);
    }
  }

  #[test]
  fn init_in_caller_storage() {
    let mut storage = MaybeUninit::<SegZone>::uninit();
    let mut region = vec![0u8; 1024];
    unsafe {
      let zone = storage.as_mut_ptr();
      assert_eq!(segzone_init(zone, region.as_mut_ptr(), region.len()), 0);
      let ptr = segzone_alloc(zone, 64);
      assert!(!ptr.is_null());
      assert!(ptr >= region.as_mut_ptr() && ptr < region.as_mut_ptr().add(1024));
      segzone_fini(zone);
    }
  }

  #[test]
  fn null_handles_are_rejected() {
    unsafe {
      assert!(segzone_alloc(null_mut(), 16).is_null());
      assert_eq!(segzone_usable_size(null_mut(), null_mut()), 0);
      assert_eq!(segzone_dump(null_mut(), Some(collect), null_mut()), -1);
      assert_eq!(segzone_init(null_mut(), null_mut(), 1024), -1);
      segzone_close(null_mut());
    }
  }
}
