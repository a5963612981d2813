//! Benchmarks for the per-player input queue.
//!
//! Run with: cargo bench --bench input_queue

use std::hint::black_box;
use std::net::SocketAddr;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rampart_rollback::__internal::{GameInput, InputQueue};
use rampart_rollback::{Config, Frame, PlayerHandle};

struct BenchConfig;

impl Config for BenchConfig {
    type Input = u32;
    type Address = SocketAddr;
}

const QUEUE_LENGTH: usize = 128;

fn filled_queue(frames: i32) -> InputQueue<BenchConfig> {
    let mut queue = InputQueue::with_queue_length(PlayerHandle::new(0), QUEUE_LENGTH).unwrap();
    for frame in 0..frames {
        queue
            .add_input(GameInput::new(Frame::new(frame), frame as u32))
            .unwrap();
    }
    queue
}

fn bench_add_input(c: &mut Criterion) {
    let mut group = c.benchmark_group("InputQueue add");

    for frames in [8, 32, 100] {
        group.bench_with_input(BenchmarkId::new("sequential", frames), &frames, |b, &frames| {
            b.iter(|| filled_queue(black_box(frames)));
        });
    }

    // steady state: one input in, everything older than the prediction window out
    group.bench_function("rolling_window", |b| {
        let mut queue = filled_queue(8);
        let mut frame = 8;
        b.iter(|| {
            queue
                .add_input(GameInput::new(Frame::new(frame), black_box(3)))
                .unwrap();
            queue.discard_confirmed_frames(Frame::new(frame - 8));
            frame += 1;
        });
    });

    group.finish();
}

fn bench_input_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("InputQueue lookup");

    group.bench_function("confirmed", |b| {
        let mut queue = filled_queue(64);
        b.iter(|| queue.input(black_box(Frame::new(40))));
    });

    group.bench_function("predicted", |b| {
        let mut queue = filled_queue(64);
        b.iter(|| queue.input(black_box(Frame::new(70))));
    });

    group.bench_function("confirmed_input", |b| {
        let queue = filled_queue(64);
        b.iter(|| queue.confirmed_input(black_box(Frame::new(63))));
    });

    group.finish();
}

fn bench_misprediction(c: &mut Criterion) {
    c.bench_function("InputQueue misprediction and reset", |b| {
        b.iter(|| {
            let mut queue = filled_queue(16);
            for frame in 16..20 {
                queue.input(Frame::new(frame));
            }
            // differs from the predicted repeat of input 15
            queue
                .add_input(GameInput::new(Frame::new(16), black_box(99)))
                .unwrap();
            let incorrect = queue.first_incorrect_frame();
            queue.reset_prediction();
            incorrect
        });
    });
}

criterion_group!(
    benches,
    bench_add_input,
    bench_input_lookup,
    bench_misprediction
);
criterion_main!(benches);
