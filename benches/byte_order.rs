/// Benchmarks for copying strided regions with and without byte order reversal.
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dmrpp_store::array::{aligned_buffer, byte_view, byte_view_mut, copy_region, AxisRange};
// Bring trait into scope to use as_bytes method.
use zerocopy::AsBytes;

fn criterion_benchmark(c: &mut Criterion) {
    for side in [256, 512, 1024] {
        let data: Vec<u32> = (0_u32..(side * side) as u32).collect();
        let src = byte_view(data.as_bytes(), &[side, side], 4).unwrap();
        let selections = [
            ("all", AxisRange::dense(0, side), 1),
            (
                "strided",
                AxisRange {
                    start: side / 4,
                    end: 3 * side / 4,
                    step: 2,
                },
                2,
            ),
        ];
        for (label, range, step) in selections {
            let count = (range.end - range.start) / step;
            let mut buf = aligned_buffer(count * count * 4);
            let mut dest = byte_view_mut(&mut buf, &[count, count], 4).unwrap();
            let dest_ranges = [AxisRange::dense(0, count), AxisRange::dense(0, count)];
            for reverse_bytes in [false, true] {
                let name = format!("copy_region({}x{}, {}, swap={})", side, side, label, reverse_bytes);
                c.bench_function(&name, |b| {
                    b.iter(|| {
                        copy_region(
                            &mut dest,
                            &dest_ranges,
                            black_box(&src),
                            &[range, range],
                            reverse_bytes,
                        )
                        .unwrap();
                    })
                });
            }
        }
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
