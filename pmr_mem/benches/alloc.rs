use criterion::{Criterion, criterion_group, criterion_main};
use pmr_mem::{AllocFlags, Configuration, GcFlags, Heap, Result};
use std::time::Duration;

fn benchmarks(criterion: &mut Criterion) {
    bench_lifecycle(criterion).ok();
}

fn bench_lifecycle(criterion: &mut Criterion) -> Result<()> {
    let heap = Heap::with_config(Configuration::default());
    heap.start();

    criterion.bench_function("alloc_blocks", |bencher| {
        bencher.iter(|| alloc_blocks(&heap));
    });

    Ok(())
}

fn alloc_blocks(heap: &Heap) {
    for index in 0..1_000usize {
        let size = if index % 2 == 0 { 48 } else { 4096 };
        let _ = heap.alloc(size, AllocFlags::empty());
    }
    heap.request_gc(GcFlags::FORCE | GcFlags::NO_BLOCK);
}

criterion_group!(
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(10));
    targets = benchmarks
);
criterion_main!(benches);
