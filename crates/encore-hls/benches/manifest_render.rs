use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use encore_core::StreamId;
use encore_hls::ManifestRegistry;

fn bench_render(c: &mut Criterion) {
    let mut group = c.benchmark_group("manifest_render");

    // 4-second segments: 15 covers a one-minute preview, 900 a one-hour mix.
    for &segments in &[15u32, 75, 900] {
        let registry = ManifestRegistry::default();
        let stream = StreamId::new("bench");
        for i in (0..segments).rev() {
            registry.record_segment(&stream, i, 4.0);
        }

        group.bench_with_input(BenchmarkId::new("open", segments), &segments, |b, _| {
            b.iter(|| registry.render(black_box(&stream)));
        });

        registry.mark_complete(&stream, f64::from(segments) * 4.0);
        group.bench_with_input(BenchmarkId::new("complete", segments), &segments, |b, _| {
            b.iter(|| registry.render(black_box(&stream)));
        });
    }

    group.finish();
}

fn bench_record(c: &mut Criterion) {
    c.bench_function("record_segment_300", |b| {
        b.iter(|| {
            let registry = ManifestRegistry::default();
            let stream = StreamId::new("bench");
            for i in 0..300u32 {
                registry.record_segment(&stream, black_box(i), 4.0);
            }
            registry
        });
    });
}

criterion_group!(benches, bench_render, bench_record);
criterion_main!(benches);
