use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::hint::black_box;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use rand::prelude::*;
use vsearch::hamming::{hamming, hamming_32, hamming_naive, knn_hamming};

fn bench_hamming(c: &mut Criterion) {
    let mut group = c.benchmark_group("Hamming");
    let mut rng = rand::rng();
    let mut src = [0u8; 32];
    let mut dst = vec![0u8; 8 << 20];
    rng.fill_bytes(&mut src);
    rng.fill_bytes(&mut dst);
    let (dst, _) = dst.as_chunks::<32>();

    group.throughput(Throughput::Bytes((dst.len() * 32) as u64));
    group.bench_function("hamming_32_naive", |b| {
        b.iter(|| dst.iter().map(|chunk| hamming_naive::<32>(black_box(&src), chunk)).sum::<u32>());
    });
    group.bench_function("hamming_32_unrolled", |b| {
        b.iter(|| dst.iter().map(|chunk| hamming_32(&src, chunk)).sum::<u32>());
    });
    group.bench_function("hamming_dispatch", |b| {
        b.iter(|| dst.iter().map(|chunk| hamming::<32>(&src, chunk)).sum::<u32>());
    });
    group.finish();
}

fn bench_hamming_knn(c: &mut Criterion) {
    let mut group = c.benchmark_group("Hamming KNN");
    let mut rng = rand::rng();
    let mut src = [0u8; 32];
    let mut dst = vec![0u8; 8 << 20];
    let k = black_box(3);
    rng.fill_bytes(&mut src);
    rng.fill_bytes(&mut dst);

    group.throughput(Throughput::Bytes(dst.len() as u64));
    group.bench_function("BinaryHeap", |b| {
        let (dst, _) = dst.as_chunks::<32>();
        b.iter(|| {
            let mut heap = BinaryHeap::new();
            for (i, chunk) in dst.iter().enumerate() {
                let d = hamming::<32>(&src, chunk);
                if heap.len() < k {
                    heap.push(Reverse((d as u64) << 32 | i as u64));
                } else if let Some(Reverse(peek)) = heap.peek() {
                    if d < (*peek >> 32) as u32 {
                        heap.pop();
                        heap.push(Reverse((d as u64) << 32 | i as u64));
                    }
                }
            }
            heap.into_sorted_vec()
        });
    });
    group.bench_function("Array", |b| {
        let (dst, _) = dst.as_chunks::<32>();
        b.iter(|| knn_hamming::<32>(&src, dst, k, 256));
    });
    group.bench_function("Array (max_distance = 64)", |b| {
        let (dst, _) = dst.as_chunks::<32>();
        b.iter(|| knn_hamming::<32>(&src, dst, k, 64));
    });
    group.finish();
}

criterion_group!(benches, bench_hamming, bench_hamming_knn);
criterion_main!(benches);
