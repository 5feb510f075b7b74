//! Compilation benchmarks: expression store churn, constant folding, and
//! cached rebuilds.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::cell::RefCell;
use std::rc::Rc;
use weft::compiler::Compiler;
use weft::config::OptimizationConfig;
use weft::fnode::{BuiltinFunction, DefunId};
use weft::path::PathStore;
use weft::template::TemplateId;

fn new_compiler() -> Compiler {
    let paths = Rc::new(RefCell::new(PathStore::new()));
    Compiler::new(paths, OptimizationConfig::default(), 10)
}

fn deep_sum_expr(c: &mut Compiler, depth: u32) -> weft::ExprId {
    let mut expr = c.exprs.number(1.0);
    for i in 0..depth {
        let n = c.exprs.number(f64::from(i));
        expr = c.exprs.apply(BuiltinFunction::Plus, vec![expr, n]);
    }
    expr
}

fn bench_constant_folding(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("constant_folding");
    for depth in [10u32, 100, 1_000] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter(|| {
                let mut c = new_compiler();
                let expr = deep_sum_expr(&mut c, depth);
                c.build_simple_function_node(
                    expr,
                    None,
                    TemplateId::GLOBAL,
                    DefunId::NONE,
                    false,
                    &[],
                    &[],
                    Some(expr),
                    TemplateId::GLOBAL,
                )
            });
        });
    }
    group.finish();
}

fn bench_cached_rebuild(criterion: &mut Criterion) {
    let mut c = new_compiler();
    let expr = deep_sum_expr(&mut c, 100);
    // First build populates the cache.
    c.build_simple_function_node(
        expr,
        None,
        TemplateId::GLOBAL,
        DefunId::NONE,
        false,
        &[],
        &[],
        Some(expr),
        TemplateId::GLOBAL,
    );
    criterion.bench_function("cached_rebuild", |b| {
        b.iter(|| {
            c.build_simple_function_node(
                expr,
                None,
                TemplateId::GLOBAL,
                DefunId::NONE,
                false,
                &[],
                &[],
                Some(expr),
                TemplateId::GLOBAL,
            )
        });
    });
}

criterion_group!(benches, bench_constant_folding, bench_cached_rebuild);
criterion_main!(benches);
