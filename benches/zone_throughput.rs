use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use segzone::Zone;
use std::hint::black_box;

const OPS: u64 = 100_000;
const ZONE_SIZE: usize = 16 << 20;

/// segzone alloc/free throughput.
fn zone_alloc_free(zone: &mut Zone, size: usize) {
  for _ in 0..OPS {
    if let Some(ptr) = zone.alloc(size) {
      black_box(ptr);
      unsafe { zone.free(ptr) };
    }
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

/// Grows one allocation step by step, with a neighbour in the way every
/// other step so both the in-place and the copying path run.
fn zone_realloc_growth(zone: &mut Zone, steps: usize) {
  let mut ptr = zone.alloc(16);
  let mut pins = Vec::with_capacity(steps / 2);
  for step in 1..=steps {
    if let Some(grown) = unsafe { zone.realloc(ptr, step * 64) } {
      ptr = Some(grown);
    }
    if step % 2 == 0
      && let Some(pin) = zone.alloc(16)
    {
      pins.push(pin);
    }
  }
  black_box(ptr);
  for pin in pins {
    unsafe { zone.free(pin) };
  }
  if let Some(ptr) = ptr {
    unsafe { zone.free(ptr) };
  }
}

fn benchmark_zone_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("zone_throughput");
  let mut zone = Zone::new(ZONE_SIZE).expect("zone");

  for size in [16, 64, 256, 1024, 4096] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("segzone", size), &size, |b, &size| {
      b.iter(|| zone_alloc_free(&mut zone, size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

fn benchmark_realloc_growth(c: &mut Criterion) {
  let mut group = c.benchmark_group("realloc_growth");
  let mut zone = Zone::new(ZONE_SIZE).expect("zone");

  for steps in [16, 128, 512] {
    group.throughput(Throughput::Elements(steps as u64));
    group.bench_with_input(BenchmarkId::new("segzone", steps), &steps, |b, &steps| {
      b.iter(|| zone_realloc_growth(&mut zone, steps))
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_zone_throughput, benchmark_realloc_growth);
criterion_main!(benches);
