//! Performance benchmarks for the Telemetrix codecs.
//!
//! The host decodes analog and digital reports continuously while a sketch
//! is running, so decode throughput is the number that matters.
//!
//! Run benchmarks with:
//! ```sh
//! cargo bench --bench codec_bench
//! ```

use bytes::BytesMut;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use tokio_util::codec::{Decoder, Encoder};
use telemetrix_protocol::{Command, Report, TelemetrixCodec};

/// Encode `count` analog reports back to back.
fn analog_stream(count: usize) -> BytesMut {
    let mut wire = BytesMut::new();
    for i in 0..count {
        Report::Analog {
            pin: (i % 6) as u8,
            value: (i % 1024) as u16,
        }
        .to_frame()
        .unwrap()
        .encode(&mut wire);
    }
    wire
}

/// Largest report on the wire: a 32-byte I2C read.
fn i2c_read_stream() -> BytesMut {
    let mut wire = BytesMut::new();
    Report::I2cRead {
        port: 0,
        address: 0x53,
        register: 0x32,
        data: vec![0xA5; 32],
    }
    .to_frame()
    .unwrap()
    .encode(&mut wire);
    wire
}

/// Benchmark encoding a single command.
fn bench_encode_command(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_command");
    group.throughput(Throughput::Elements(1));

    let command = Command::digital_write(13, true);

    group.bench_function("digital_write", |b| {
        b.iter(|| {
            let mut codec = TelemetrixCodec::new();
            let mut buffer = BytesMut::new();
            codec.encode(black_box(command.clone()), &mut buffer).unwrap();
            black_box(buffer);
        });
    });

    group.finish();
}

/// Benchmark decoding batches of analog reports.
fn bench_decode_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_batch");

    for batch_size in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        let encoded = analog_stream(*batch_size).freeze();

        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            batch_size,
            |b, _| {
                b.iter(|| {
                    let mut codec = TelemetrixCodec::new();
                    let mut buffer = BytesMut::from(&encoded[..]);
                    let mut count = 0;

                    while let Ok(Some(_)) = codec.decode(&mut buffer) {
                        count += 1;
                    }

                    black_box(count);
                });
            },
        );
    }

    group.finish();
}

/// Benchmark the largest report arriving in small chunks, as it does over a
/// slow serial link.
fn bench_decode_partial_streaming(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_partial_streaming");
    group.throughput(Throughput::Elements(1));

    let full_frame = i2c_read_stream().freeze();

    for chunk_size in [1, 4, 16].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("chunk_{}_bytes", chunk_size)),
            chunk_size,
            |b, &size| {
                b.iter(|| {
                    let mut codec = TelemetrixCodec::new();
                    let mut result = None;

                    for chunk in full_frame.chunks(size) {
                        let mut buf = BytesMut::from(chunk);
                        if let Ok(Some(item)) = codec.decode(&mut buf) {
                            result = Some(item);
                            break;
                        }
                    }

                    black_box(result);
                });
            },
        );
    }

    group.finish();
}

/// Benchmark resynchronization through garbage between valid reports.
fn bench_decode_with_corruption(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_with_corruption");
    group.throughput(Throughput::Elements(100));

    let mut wire = BytesMut::new();
    for chunk in analog_stream(100).chunks(5) {
        wire.extend_from_slice(chunk);
        wire.extend_from_slice(&[0xEE, 0xEE]);
    }
    let encoded = wire.freeze();

    group.bench_function("analog_100_with_garbage", |b| {
        b.iter(|| {
            let mut codec = TelemetrixCodec::new();
            let mut buffer = BytesMut::from(&encoded[..]);
            let mut frames = 0;

            while let Ok(Some(item)) = codec.decode(&mut buffer) {
                if item.is_ok() {
                    frames += 1;
                }
            }

            black_box(frames);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_encode_command,
    bench_decode_batch,
    bench_decode_partial_streaming,
    bench_decode_with_corruption,
);

criterion_main!(benches);
