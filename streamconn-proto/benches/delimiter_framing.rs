//! Delimiter framing benchmarks
//!
//! Measures how fast a stream of delimited messages is cut into messages
//! when it arrives in reads of different sizes. Small reads exercise the
//! split-delimiter path, large reads the in-chunk scan.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use streamconn_proto::delimiter::DelimiterFramer;

const MESSAGE_SIZE: usize = 256;
const MESSAGE_COUNT: usize = 10_000;
const READ_SIZES: &[usize] = &[7, 64, 1024, 16384, 65536];

fn stream_of(delimiter: &[u8]) -> Vec<u8> {
    let mut stream = Vec::with_capacity((MESSAGE_SIZE + delimiter.len()) * MESSAGE_COUNT);
    for i in 0..MESSAGE_COUNT {
        stream.extend((0..MESSAGE_SIZE).map(|j| b'a' + ((i + j) % 20) as u8));
        stream.extend_from_slice(delimiter);
    }
    stream
}

fn bench_delimiter(c: &mut Criterion, name: &str, delimiter: &'static [u8]) {
    let stream = stream_of(delimiter);
    let chunks_by_size: Vec<(usize, Vec<Bytes>)> = READ_SIZES
        .iter()
        .map(|&size| {
            let chunks = stream.chunks(size).map(Bytes::copy_from_slice).collect();
            (size, chunks)
        })
        .collect();

    let mut group = c.benchmark_group(format!("delimiter/{name}"));
    group.throughput(Throughput::Bytes(stream.len() as u64));
    for (size, chunks) in &chunks_by_size {
        group.bench_with_input(BenchmarkId::from_parameter(size), chunks, |b, chunks| {
            b.iter(|| {
                let mut framer = DelimiterFramer::new(Bytes::from_static(delimiter));
                let mut count = 0usize;
                for chunk in chunks {
                    framer.receive(chunk.clone(), |m| {
                        black_box(m);
                        count += 1;
                    });
                }
                assert_eq!(count, MESSAGE_COUNT);
            });
        });
    }
    group.finish();
}

fn newline(c: &mut Criterion) {
    bench_delimiter(c, "newline", b"\n");
}

fn crlf(c: &mut Criterion) {
    bench_delimiter(c, "crlf", b"\r\n");
}

fn long_delimiter(c: &mut Criterion) {
    bench_delimiter(c, "long", b"--boundary-7f3a9c--\n");
}

criterion_group!(benches, newline, crlf, long_delimiter);
criterion_main!(benches);
