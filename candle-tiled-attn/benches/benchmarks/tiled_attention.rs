use crate::benchmarks::BenchDevice;
use candle::{DType, Device, Result, Tensor};
use candle_tiled_attn::{DropoutConfig, FlashAttn, TileConfig};
use criterion::{criterion_group, Criterion, Throughput};
use std::hint::black_box;
use std::time::Instant;

use rand::prelude::*;

fn make_tensor(
    rng: &mut StdRng,
    shape: (usize, usize, usize, usize),
    dtype: DType,
) -> Result<Tensor> {
    let n = shape.0 * shape.1 * shape.2 * shape.3;
    let data: Vec<f32> = (0..n).map(|_| rng.random_range(-1.0..1.0)).collect();
    Tensor::from_vec(data, shape, &Device::Cpu)?.to_dtype(dtype)
}

fn bench_case(
    c: &mut Criterion,
    name: String,
    attn: FlashAttn,
    (b, hq, hk, seq_len, d): (usize, usize, usize, usize, usize),
    dtype: DType,
) {
    let mut rng = StdRng::seed_from_u64(123);
    let q = make_tensor(&mut rng, (b, hq, seq_len, d), dtype).unwrap();
    let k = make_tensor(&mut rng, (b, hk, seq_len, d), dtype).unwrap();
    let v = make_tensor(&mut rng, (b, hk, seq_len, d), dtype).unwrap();

    let flops = 4 * b * hq * seq_len * seq_len * d;
    let mut group = c.benchmark_group(Device::Cpu.bench_name(name));
    group.throughput(Throughput::Elements(flops as u64));
    group.bench_function("tiled_attention", move |bencher| {
        bencher.iter_custom(|iters| {
            let start = Instant::now();
            for _ in 0..iters {
                let out = attn
                    .fwd(black_box(&q), black_box(&k), black_box(&v), None)
                    .unwrap();
                black_box(out);
            }
            start.elapsed()
        })
    });
    group.finish();
}

fn criterion_benchmark(c: &mut Criterion) {
    let (b, hq, hk, seq_len, d) = (4usize, 8usize, 8usize, 256usize, 64usize);
    let scale = 1.0 / (d as f64).sqrt() as f32;
    for dtype in [DType::F32, DType::F16] {
        for causal in [false, true] {
            bench_case(
                c,
                format!("tiled_attn_{dtype:?}_b{b}_hq{hq}_d{d}_s{seq_len}_causal{causal}"),
                FlashAttn::new(scale, causal),
                (b, hq, hk, seq_len, d),
                dtype,
            );
        }
    }

    // GQA with dropout
    bench_case(
        c,
        format!("tiled_attn_F32_b{b}_hq{hq}_hk2_d{d}_s{seq_len}_dropout"),
        FlashAttn::new(scale, true).with_dropout(DropoutConfig::new(0.1)),
        (b, hq, 2, seq_len, d),
        DType::F32,
    );

    for (block_m, block_n) in [(16, 16), (32, 32), (64, 64), (128, 64)] {
        bench_case(
            c,
            format!("tiled_attn_F32_tiles{block_m}x{block_n}"),
            FlashAttn::new(scale, false).with_tiles(TileConfig::new(block_m, block_n)),
            (b, hq, hk, seq_len, d),
            DType::F32,
        );
    }
}

criterion_group!(benches, criterion_benchmark);
