//! Match-propagation benchmarks: element churn through an attached
//! selection query.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use weft::config::Config;
use weft::engine::QueryEngine;
use weft::querycalc::QueryDesc;
use weft::value::Value;

fn bench_selection_maintenance(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("selection_maintenance");
    for size in [100u64, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let mut engine = QueryEngine::new(Config::default());
                let root = engine.indexer.get_root_path_id();
                let items = engine.indexer.allocate_path_id(root, "items");
                let desc = QueryDesc::Simple {
                    path: items,
                    selection: Value::number(0.0),
                };
                let (_r, result) = engine.attach_query(&desc, items);
                for i in 0..size {
                    engine
                        .add_data_element(items, None, Some(Value::number((i % 2) as f64)))
                        .expect("add");
                }
                engine.run_until_quiescent().expect("quiescence");
                engine.results.get_dominated_matches(result).len()
            });
        });
    }
    group.finish();
}

fn bench_key_update_churn(criterion: &mut Criterion) {
    criterion.bench_function("key_update_churn", |b| {
        let mut engine = QueryEngine::new(Config::default());
        let root = engine.indexer.get_root_path_id();
        let items = engine.indexer.allocate_path_id(root, "items");
        let desc = QueryDesc::Simple {
            path: items,
            selection: Value::number(1.0),
        };
        let (_r, _result) = engine.attach_query(&desc, items);
        let ids: Vec<_> = (0..1_000)
            .map(|_| {
                engine
                    .add_data_element(items, None, Some(Value::number(0.0)))
                    .expect("add")
            })
            .collect();
        engine.run_until_quiescent().expect("quiescence");
        let mut flip = 0.0;
        b.iter(|| {
            flip = 1.0 - flip;
            for &id in &ids {
                engine.update_key(items, id, Value::number(flip));
            }
            engine.run_until_quiescent().expect("quiescence");
        });
    });
}

criterion_group!(benches, bench_selection_maintenance, bench_key_update_churn);
criterion_main!(benches);
