//! Criterion benchmarks for the relay binary codec.
//!
//! Run with:
//! ```bash
//! cargo bench --package relay-core --bench codec_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use relay_core::protocol::codec::{decode_message, encode_message, FrameDecoder};
use relay_core::protocol::messages::{PackageMessage, RelayMessage, UserEntry};
use relay_core::{Recipients, Role};

// ── Message fixtures ──────────────────────────────────────────────────────────

fn make_package(payload_len: usize) -> RelayMessage {
    RelayMessage::Package(PackageMessage {
        sender: "alice".to_string(),
        recipients: Recipients::Names(vec!["bob".to_string(), "carol".to_string()]),
        content_type: "text/plain".to_string(),
        payload: vec![b'x'; payload_len],
    })
}

fn make_user_list(n: usize) -> RelayMessage {
    RelayMessage::UserList(
        (0..n)
            .map(|i| UserEntry {
                name: format!("student_{i}"),
                role: Role::User,
            })
            .collect(),
    )
}

fn fixtures() -> Vec<(&'static str, RelayMessage)> {
    vec![
        ("ping", RelayMessage::Ping(42)),
        ("package_64b", make_package(64)),
        ("package_64kib", make_package(64 * 1024)),
        ("user_list_30", make_user_list(30)),
    ]
}

// ── Benchmarks ────────────────────────────────────────────────────────────────

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for (name, msg) in fixtures() {
        group.bench_with_input(BenchmarkId::from_parameter(name), &msg, |b, msg| {
            b.iter(|| encode_message(black_box(msg), 1, 0).expect("encode"))
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for (name, msg) in fixtures() {
        let bytes = encode_message(&msg, 1, 0).expect("encode");
        group.bench_with_input(BenchmarkId::from_parameter(name), &bytes, |b, bytes| {
            b.iter(|| decode_message(black_box(bytes)).expect("decode"))
        });
    }
    group.finish();
}

fn bench_stream_decoder(c: &mut Criterion) {
    // 100 small packages arriving in 1 KiB reads
    let stream: Vec<u8> = (0..100u64)
        .flat_map(|seq| encode_message(&make_package(64), seq, 0).expect("encode"))
        .collect();
    c.bench_function("frame_decoder_100_packages", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new();
            let mut count = 0;
            for chunk in stream.chunks(1024) {
                decoder.extend(chunk);
                while decoder.next_frame().expect("decode").is_some() {
                    count += 1;
                }
            }
            black_box(count)
        })
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_stream_decoder);
criterion_main!(benches);
