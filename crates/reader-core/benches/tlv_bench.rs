//! Criterion benchmarks for the TLV decoder and HID report framing.
//!
//! Card frames are decoded on the dispatcher thread while the customer waits,
//! so decoding a typical frame should stay well under a millisecond.
//!
//! Run with:
//! ```bash
//! cargo bench --package reader-core --bench tlv_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use reader_core::protocol::card_data::{extract_card_data, tags};
use reader_core::protocol::packet::{encode_reports, ReportAssembler, DEFAULT_REPORT_SIZE};
use reader_core::protocol::tlv::{decode_tlv, encode_tlv};

// ── Frame fixtures ────────────────────────────────────────────────────────────

/// A constructed container wrapping the four gateway tags, with an encrypted
/// blob of `data_len` bytes.
fn make_card_frame(data_len: usize) -> Vec<u8> {
    let mut children = Vec::new();
    children.extend(encode_tlv(tags::DEVICE_SERIAL_NUMBER, b"B4B1234"));
    children.extend(encode_tlv(tags::KSN, &[0x95, 0x00, 0x03, 0x00, 0x00, 0x00, 0x01, 0x2A, 0x00, 0x07]));
    children.extend(encode_tlv(tags::CARD_TYPE, &[0x02]));
    children.extend(encode_tlv(tags::ENCRYPTED_DATA, &vec![0xA5; data_len]));
    encode_tlv(&[0xFF, 0x70], &children)
}

// ── Benchmark groups ──────────────────────────────────────────────────────────

/// Benchmarks `decode_tlv` for growing encrypted-data sizes.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_tlv");
    for size in [64usize, 512, 2048] {
        let frame = make_card_frame(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, f| {
            b.iter(|| decode_tlv(black_box(f)).unwrap())
        });
    }
    group.finish();
}

/// Benchmarks the full extraction path the dispatcher runs per card frame.
fn bench_extract(c: &mut Criterion) {
    let frame = make_card_frame(512);
    c.bench_function("extract_card_data", |b| {
        b.iter(|| extract_card_data(black_box(&frame)))
    });
}

/// Benchmarks splitting a card frame into reports and reassembling it.
fn bench_reports(c: &mut Criterion) {
    let frame = make_card_frame(512);
    c.bench_function("reports_roundtrip", |b| {
        b.iter(|| {
            let reports = encode_reports(black_box(&frame), DEFAULT_REPORT_SIZE).unwrap();
            let mut asm = ReportAssembler::new();
            let mut out = None;
            for r in &reports {
                if let Some(m) = asm.push(r).unwrap() {
                    out = Some(m);
                }
            }
            out
        })
    });
}

criterion_group!(benches, bench_decode, bench_extract, bench_reports);
criterion_main!(benches);
