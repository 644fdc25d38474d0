//! Criterion benchmarks for the streaming hot paths.
//!
//! Every RX packet goes through `decode_packet` and every TX packet through
//! `encode_packet` on the streaming threads, so these bound the sustainable
//! sample rate per core.
//!
//! Key metrics:
//! - Codec throughput per link format
//! - Packet framing throughput for one and two channels
//! - FIFO push/pop round trip
//!
//! Run with: cargo bench --bench sample_codec

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lms_driver::stream::codec;
use lms_driver::stream::fifo::{SampleBlock, SampleFifo};
use lms_driver::stream::packet::{
    decode_packet, encode_packet, samples_per_packet, PacketFlags, PacketHeader, DATA_PACKET_SIZE,
};
use lms_driver::SampleFormat;
use num_complex::Complex;

fn ramp(len: usize) -> Vec<Complex<i16>> {
    (0..len)
        .map(|n| {
            let v = (n % 4096) as i16 - 2048;
            Complex::new(v, -v - 1)
        })
        .collect()
}

const FORMATS: [(&str, SampleFormat); 3] = [
    ("i12_in_16", SampleFormat::I12In16),
    ("packed12", SampleFormat::Packed12),
    ("float32", SampleFormat::Float32),
];

/// Encode and decode 64k samples in each format.
fn codec_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let samples = ramp(64 * 1024);

    for (name, format) in FORMATS {
        let mut encoded = Vec::new();
        codec::encode(format, &samples, &mut encoded);
        group.throughput(Throughput::Elements(samples.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", name), &format, |b, &format| {
            let mut out = Vec::with_capacity(encoded.len());
            b.iter(|| {
                out.clear();
                codec::encode(format, black_box(&samples), &mut out);
            });
        });
        group.bench_with_input(BenchmarkId::new("decode", name), &format, |b, &format| {
            let mut out = Vec::with_capacity(samples.len());
            b.iter(|| {
                out.clear();
                codec::decode(format, black_box(&encoded), &mut out).unwrap();
            });
        });
    }

    group.finish();
}

/// Frame and split one 4096-byte packet.
fn packet_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet");
    group.throughput(Throughput::Bytes(DATA_PACKET_SIZE as u64));

    for link in [SampleFormat::I12In16, SampleFormat::Packed12] {
        for channels in [1usize, 2] {
            let per_channel = samples_per_packet(link, channels);
            let data: Vec<Vec<Complex<i16>>> = (0..channels).map(|_| ramp(per_channel)).collect();
            let slices: Vec<&[Complex<i16>]> = data.iter().map(Vec::as_slice).collect();
            let header = PacketHeader {
                flags: PacketFlags::IGNORE_TIMESTAMP,
                counter: 0,
            };
            let mut packet = Vec::new();
            encode_packet(header, link, &slices, &mut packet).unwrap();
            let id = format!("{link:?}/{channels}ch");

            group.bench_function(BenchmarkId::new("encode", &id), |b| {
                let mut out = Vec::with_capacity(DATA_PACKET_SIZE);
                b.iter(|| {
                    out.clear();
                    encode_packet(header, link, black_box(&slices), &mut out).unwrap();
                });
            });
            group.bench_function(BenchmarkId::new("decode", &id), |b| {
                b.iter(|| decode_packet(black_box(&packet), link, channels).unwrap());
            });
        }
    }

    group.finish();
}

/// Push then pop one packet-sized block.
fn fifo_round_trip(c: &mut Criterion) {
    let fifo = SampleFifo::new(64);
    let block = ramp(1020);

    c.bench_function("fifo_push_pop", |b| {
        b.iter(|| {
            fifo.push(SampleBlock::new(0, block.clone()), Duration::ZERO).unwrap();
            black_box(fifo.pop_samples(1020, Duration::ZERO).unwrap());
        });
    });
}

criterion_group!(benches, codec_throughput, packet_framing, fifo_round_trip);
criterion_main!(benches);
