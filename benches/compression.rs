//! Benchmarks for input payload compression.
//!
//! Run with: cargo bench --bench compression
//!
//! Input patterns mimic what a game actually sends: long idle stretches, periodic button
//! presses and analog sticks that change every frame.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rampart_rollback::__internal::{decode, delta_encode, encode};

fn idle_inputs(frames: usize, input_size: usize) -> Vec<Vec<u8>> {
    vec![vec![0u8; input_size]; frames]
}

/// A button press every 5 frames.
fn active_inputs(frames: usize, input_size: usize) -> Vec<Vec<u8>> {
    (0..frames)
        .map(|i| {
            let mut input = vec![0u8; input_size];
            if i % 5 == 0 {
                input[0] = 1 << (i % 8);
            }
            input
        })
        .collect()
}

fn analog_inputs(frames: usize, input_size: usize) -> Vec<Vec<u8>> {
    (0..frames)
        .map(|i| {
            let mut input = vec![0u8; input_size];
            let angle = i as f32 * 0.1;
            if input_size >= 2 {
                input[0] = ((angle.sin() * 127.0) as i8) as u8;
                input[1] = ((angle.cos() * 127.0) as i8) as u8;
            }
            input
        })
        .collect()
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for input_size in [4, 16] {
        for frames in [8, 32] {
            let reference = vec![0u8; input_size];
            group.throughput(Throughput::Bytes((input_size * frames) as u64));
            for (name, inputs) in [
                ("idle", idle_inputs(frames, input_size)),
                ("active", active_inputs(frames, input_size)),
                ("analog", analog_inputs(frames, input_size)),
            ] {
                group.bench_with_input(
                    BenchmarkId::new(format!("{name}_{input_size}b"), frames),
                    &inputs,
                    |b, inputs| b.iter(|| encode(black_box(&reference), inputs.iter())),
                );
            }
        }
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    let reference = vec![0u8; 8];

    for frames in [8, 32] {
        let inputs = active_inputs(frames, 8);
        let encoded = encode(&reference, inputs.iter());
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::new("active", frames), &encoded, |b, encoded| {
            b.iter(|| decode(&reference, black_box(encoded)).unwrap());
        });
    }

    group.finish();
}

fn bench_ratio(c: &mut Criterion) {
    let mut group = c.benchmark_group("delta only");
    let reference = vec![0u8; 4];

    for (name, inputs) in [
        ("idle", idle_inputs(16, 4)),
        ("active", active_inputs(16, 4)),
        ("analog", analog_inputs(16, 4)),
    ] {
        let compressed = encode(&reference, inputs.iter());
        println!(
            "{name}: {} -> {} bytes",
            inputs.len() * reference.len(),
            compressed.len()
        );
        group.bench_function(name, |b| {
            b.iter(|| delta_encode(black_box(&reference), inputs.iter()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_ratio);
criterion_main!(benches);
