use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use statsrelay::hash::{choose_by_key, hash_key, Ring};
use statsrelay::proto::{ParseError, Pdu};

fn parse(line: &Bytes) -> Result<Pdu, ParseError> {
    Pdu::parse(line.clone())
}

fn criterion_benchmark(c: &mut Criterion) {
    let by = Bytes::from_static(b"hello_world.worldworld_i_am_a_pumpkin:3|c|@1.0");
    c.bench_function("statsd pdu parsing", |b| b.iter(|| parse(black_box(&by))));

    c.bench_function("statsd pdu prefix/suffix rewrite", |b| {
        b.iter(|| {
            let pdu = parse(black_box(&by)).unwrap();
            black_box(pdu.with_prefix_suffix(b"prefix.", b".suffix"))
        })
    });

    c.bench_function("murmur3 key hash", |b| {
        b.iter(|| black_box(hash_key(black_box(b"hello_world.worldworld_i_am_a_pumpkin"))))
    });

    let mut ring: Ring<u32> = Ring::new();
    for i in 0..64u32 {
        ring.push(i);
    }
    c.bench_function("ring choose_by_key over 64 backends", |b| {
        b.iter(|| black_box(choose_by_key(&ring, black_box(b"hello_world.worldworld_i_am_a_pumpkin"))))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
