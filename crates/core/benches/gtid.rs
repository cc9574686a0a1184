use std::fmt::Write as _;
use std::hint::black_box;

use clusterset_core::GtidSet;
use criterion::{criterion_group, criterion_main, Criterion};

/// A `gtid_executed` value with `sources` UUIDs, each with `gaps` holes.
fn build_gtid_text(sources: usize, gaps: usize) -> String {
    let mut text = String::new();
    for s in 0..sources {
        if s > 0 {
            text.push_str(",\n");
        }
        let _ = write!(text, "{s:08x}-71ca-11e1-9e33-c80aa9429562");
        let mut next = 1u64;
        for _ in 0..=gaps {
            let _ = write!(text, ":{next}-{}", next + 999);
            next += 1002;
        }
    }
    text
}

fn bench_gtid(c: &mut Criterion) {
    let small = build_gtid_text(2, 2);
    let medium = build_gtid_text(8, 16);
    let large = build_gtid_text(32, 128);

    let mut group = c.benchmark_group("gtid_set");

    for (name, text) in [("small", &small), ("medium", &medium), ("large", &large)] {
        group.bench_function(format!("parse_{name}"), |b| {
            b.iter(|| GtidSet::parse(black_box(text)));
        });

        let parsed = GtidSet::parse(text).expect("benchmark input must parse");
        group.bench_function(format!("format_{name}"), |b| {
            b.iter(|| black_box(&parsed).to_string());
        });

        let uuid = "00000001-71ca-11e1-9e33-c80aa9429562";
        group.bench_function(format!("filter_{name}"), |b| {
            b.iter(|| black_box(&parsed).get_gtids_from(black_box(uuid)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_gtid);
criterion_main!(benches);
