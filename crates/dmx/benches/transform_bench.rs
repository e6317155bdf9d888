//! 🏎️ How fast does a rates line turn into a document? Fast. This proves it with statistics.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use dmx::common::{BulkOperation, RawRecord};
use dmx::transforms::{DatedPairs, Transform};

/// 🧾 A line with `pairs` currencies, the way the morning export writes them.
fn rates_line(pairs: usize) -> String {
    let mut line = String::from("2024-01-05");
    for i in 0..pairs {
        line.push_str(&format!("|CUR{i:03}:{}.{:04}", i % 200, i * 7 % 10_000));
    }
    line
}

fn parse_and_transform(c: &mut Criterion) {
    let transform = DatedPairs::new("currency");
    let mut group = c.benchmark_group("parse_and_transform");
    for pairs in [0usize, 8, 64, 512] {
        let line = rates_line(pairs);
        group.throughput(Throughput::Bytes(line.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(pairs), &line, |b, line| {
            b.iter(|| {
                let record = RawRecord::parse(1, black_box(line), b'|').expect("💀 bench line");
                let docs = transform.transform(&record).expect("💀 transform");
                docs.into_iter().map(BulkOperation::from).collect::<Vec<_>>()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, parse_and_transform);
criterion_main!(benches);
