//! Image descriptor set allocation and recycling throughput.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use inflight_gpu::{DescriptorAllocatorConfig, DescriptorSetHandle};
use inflight_test::{GpuClock, TestRig};

fn bench_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("image_sets");

    for live_sets in [8_usize, 64, 512] {
        group.bench_with_input(
            BenchmarkId::new("alloc_free_churn", live_sets),
            &live_sets,
            |b, &live_sets| {
                let rig = TestRig::new(GpuClock::Immediate).unwrap();
                let mut allocator = rig
                    .descriptor_allocator(DescriptorAllocatorConfig::default())
                    .unwrap();
                let mut live: Vec<DescriptorSetHandle> = (0..live_sets)
                    .map(|_| allocator.alloc_image_set().unwrap())
                    .collect();
                let mut cursor = 0;

                b.iter(|| {
                    // Free from the middle of the population so pools move between partitions
                    cursor = (cursor + 7) % live.len();
                    let handle = live.swap_remove(cursor);
                    allocator.free_image_set(black_box(handle)).unwrap();
                    live.push(allocator.alloc_image_set().unwrap());
                });

                for handle in live.drain(..) {
                    allocator.free_image_set(handle).unwrap();
                }
            },
        );
    }

    group.finish();
}

fn bench_pool_growth(c: &mut Criterion) {
    c.bench_function("image_sets/grow_to_100", |b| {
        let rig = TestRig::new(GpuClock::Immediate).unwrap();
        b.iter(|| {
            let mut allocator = rig
                .descriptor_allocator(DescriptorAllocatorConfig::default())
                .unwrap();
            let handles: Vec<_> = (0..100)
                .map(|_| allocator.alloc_image_set().unwrap())
                .collect();
            for handle in handles {
                allocator.free_image_set(handle).unwrap();
            }
            black_box(allocator.image_pool_count())
        });
    });
}

criterion_group!(benches, bench_alloc_free, bench_pool_growth);
criterion_main!(benches);
