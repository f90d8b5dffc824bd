use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use pagealloc::{Allocator, PAGE_SIZE};
use std::hint::black_box;

/// Fill one page with blocks of a class, then drain it, so every round
/// divides a fresh page and returns it to the free pool. libc runs the same
/// fill/drain sequence for reference.
fn benchmark_page_churn(c: &mut Criterion) {
  let mut group = c.benchmark_group("page_churn");
  let mut heap = Allocator::new(64 * PAGE_SIZE).unwrap();
  let mut live = Vec::with_capacity(PAGE_SIZE / 16);
  let mut raw = Vec::with_capacity(PAGE_SIZE / 16);

  for size in [16, 128, 1024] {
    let per_page = PAGE_SIZE / size;
    group.throughput(Throughput::Elements(per_page as u64));

    group.bench_with_input(BenchmarkId::new("pagealloc", size), &size, |b, &size| {
      b.iter(|| {
        for _ in 0..per_page {
          live.push(heap.allocate(size).unwrap());
        }
        for ptr in live.drain(..) {
          heap.free(black_box(ptr)).unwrap();
        }
      })
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| {
        for _ in 0..per_page {
          raw.push(unsafe { libc::malloc(size) });
        }
        for ptr in raw.drain(..) {
          unsafe { libc::free(black_box(ptr)) };
        }
      })
    });
  }

  group.finish();
}

/// First-fit span reservation behind a run of single-page spans, so the
/// scan has to walk past every occupied page before it finds room.
fn benchmark_span_first_fit(c: &mut Criterion) {
  let mut group = c.benchmark_group("span_first_fit");

  for occupied in [0usize, 64, 512] {
    let mut heap = Allocator::new((occupied + 16) * PAGE_SIZE).unwrap();
    for _ in 0..occupied {
      heap.allocate(PAGE_SIZE).unwrap();
    }
    group.throughput(Throughput::Elements(1));

    group.bench_with_input(
      BenchmarkId::new("four_pages", occupied),
      &occupied,
      |b, _| {
        b.iter(|| {
          let span = heap.allocate(4 * PAGE_SIZE).unwrap();
          heap.free(black_box(span)).unwrap();
        })
      },
    );
  }

  group.finish();
}

/// Grow a block through every class and into a span, copying each step.
fn benchmark_realloc_ladder(c: &mut Criterion) {
  let mut heap = Allocator::new(16 * PAGE_SIZE).unwrap();

  c.bench_function("realloc_ladder", |b| {
    b.iter(|| {
      let mut ptr = heap.allocate(16).unwrap();
      let mut size = 16;
      while size <= 2 * PAGE_SIZE {
        size *= 2;
        ptr = unsafe { heap.reallocate(ptr, size) }.unwrap();
      }
      heap.free(black_box(ptr)).unwrap();
    })
  });
}

criterion_group!(
  benches,
  benchmark_page_churn,
  benchmark_span_first_fit,
  benchmark_realloc_ladder
);
criterion_main!(benches);
