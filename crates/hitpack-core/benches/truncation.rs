//! Benchmarks for significant-bit truncation.
//!
//! Run with: `cargo bench -p hitpack-core`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use hitpack_core::{
    truncate_le_elements, truncate_significant_bits, AttachedClusterFields, CompressedDataset,
    CompressionSettings, DatasetCapacity, TrackFields, P_MAX_QTOT,
};

/// Generate charge-like values below the total-charge ceiling.
fn generate_charges(count: usize) -> Vec<u16> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..count)
        .map(|_| rng.gen_range(0..P_MAX_QTOT as u16))
        .collect()
}

fn bench_scalar(c: &mut Criterion) {
    let mut group = c.benchmark_group("truncate_scalar");
    let values = generate_charges(4096);

    for bits in [3u32, 4, 8] {
        group.throughput(Throughput::Elements(values.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(bits), &bits, |b, &bits| {
            b.iter(|| {
                let mut acc = 0u32;
                for &v in &values {
                    acc ^= truncate_significant_bits(black_box(u32::from(v)), bits, P_MAX_QTOT);
                }
                acc
            })
        });
    }
    group.finish();
}

fn bench_packed_array(c: &mut Criterion) {
    let mut group = c.benchmark_group("truncate_packed_u16");

    for count in [1024usize, 65_536, 1 << 20] {
        let bytes: Vec<u8> = generate_charges(count)
            .into_iter()
            .flat_map(u16::to_le_bytes)
            .collect();
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &bytes, |b, bytes| {
            b.iter_batched(
                || bytes.clone(),
                |mut data| truncate_le_elements(&mut data, 2, 4, P_MAX_QTOT),
                criterion::BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

fn bench_dataset(c: &mut Criterion) {
    let mut group = c.benchmark_group("truncate_dataset");
    let settings = CompressionSettings::default();
    let mut rng = StdRng::seed_from_u64(42);

    let tracks = 1000u32;
    let per_track = 50usize;
    let capacity = DatasetCapacity {
        tracks,
        attached: tracks * per_track as u32,
        unattached: 0,
        reduced: true,
    };
    let mut dataset = CompressedDataset::allocate(capacity, &settings).unwrap();
    {
        let mut view = dataset.view_mut();
        for _ in 0..tracks {
            let clusters: Vec<_> = (0..per_track)
                .map(|_| AttachedClusterFields {
                    q_tot: rng.gen_range(0..P_MAX_QTOT as u16),
                    q_max: rng.gen_range(0..1024),
                    sigma_pad: rng.r#gen(),
                    sigma_time: rng.r#gen(),
                    ..AttachedClusterFields::default()
                })
                .collect();
            view.append_track(TrackFields::default(), &clusters).unwrap();
        }
    }

    group.throughput(Throughput::Elements(u64::from(capacity.attached)));
    group.bench_function("attached_50k", |b| {
        b.iter_batched(
            || dataset.clone(),
            |mut d| d.view_mut().truncate_fields(&settings),
            criterion::BatchSize::LargeInput,
        )
    });
    group.finish();
}

criterion_group!(benches, bench_scalar, bench_packed_array, bench_dataset);
criterion_main!(benches);
