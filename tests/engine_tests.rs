//! Engine-level tests: query compilation from expressions, area-query
//! rewrites, the write pipeline, and result activation.

use weft::compiler::area_query;
use weft::config::Config;
use weft::engine::QueryEngine;
use weft::fnode::{BuiltinFunction, FunctionNodeKind};
use weft::value::Value;

#[test]
fn query_from_expression_selects_and_projects() -> anyhow::Result<()> {
    let mut engine = QueryEngine::new(Config::default());
    let root_path = engine.indexer.get_root_path_id();

    // {context: {a: 5, b: _}} attached at the context prefix.
    let five = engine.compiler.exprs.number(5.0);
    let p = engine.compiler.exprs.projector();
    let inner = engine.compiler.exprs.av(vec![("a", five), ("b", p)]);
    let query = engine.compiler.exprs.av(vec![("context", inner)]);

    let desc = engine.query_desc_from_expr(query, root_path);

    // Data: one element whose context.a is 5 (with a context.b child) and
    // one whose context.a is 6.
    let store = engine.indexer.path_store();
    let (ctx_a, ctx_b) = {
        let mut s = store.borrow_mut();
        let ctx = s.allocate_path_id(root_path, "context");
        let a = s.allocate_path_id(ctx, "a");
        let b = s.allocate_path_id(ctx, "b");
        (a, b)
    };
    let e1 = engine.add_data_element(root_path, None, None)?;
    engine.add_data_element(ctx_a, Some(e1), Some(Value::number(5.0)))?;
    engine.add_data_element(ctx_b, Some(e1), Some(Value::string("payload")))?;
    let e2 = engine.add_data_element(root_path, None, None)?;
    engine.add_data_element(ctx_a, Some(e2), Some(Value::number(6.0)))?;

    let (root, result) = engine.attach_query(&desc, root_path);
    engine.run_until_quiescent()?;

    assert_eq!(engine.results.get_dominated_matches(result), vec![e1]);
    // The b projection is a generating projection of this query.
    assert_eq!(engine.root(root).terminal_generating_proj_num(), 1);
    Ok(())
}

#[test]
fn class_membership_query_rewrites_to_bool_gate() {
    let mut engine = QueryEngine::new(Config::default());
    let root_path = engine.indexer.get_root_path_id();
    let t_path = engine.indexer.allocate_path_id(root_path, "t");
    let template = engine
        .compiler
        .templates
        .add_template(weft::template::TemplateId::GLOBAL, "t", t_path);

    // Class X membership is a compiled node on the template.
    let membership_expr = engine.compiler.exprs.boolean(true);
    let membership = engine.compiler.define_class(template, "X", membership_expr);

    // ["X", [classOfArea, [me]]]
    let name = engine.compiler.exprs.string("X");
    let me_fn = engine.compiler.exprs.builtin(BuiltinFunction::Me);
    let me = engine
        .compiler
        .exprs
        .store(weft::ExprKind::FunctionApplication {
            function: me_fn,
            args: vec![],
        });
    let coa_fn = engine.compiler.exprs.builtin(BuiltinFunction::ClassOfArea);
    let coa = engine
        .compiler
        .exprs
        .store(weft::ExprKind::FunctionApplication {
            function: coa_fn,
            args: vec![me],
        });
    let query = engine.compiler.exprs.query(name, coa);

    let node = engine.compiler.build_simple_function_node(
        query,
        None,
        template,
        weft::DefunId::NONE,
        false,
        &[],
        &[],
        Some(query),
        template,
    );

    match &engine.compiler.pool.get(node).kind {
        FunctionNodeKind::BoolGate { condition, value } => {
            assert_eq!(*condition, membership);
            assert_eq!(
                engine.compiler.pool.const_value(*value),
                Some(&Value::string("X"))
            );
        }
        other => panic!("expected class-membership gate, got {other:?}"),
    }
    assert_eq!(
        engine.compiler.pool.get(node).local_to_area,
        Some(template)
    );
    // No generic area-selection node was created for this query.
    assert!(!matches!(
        engine.compiler.pool.get(node).kind,
        FunctionNodeKind::AreaSelection { .. }
    ));
}

#[test]
fn write_pipeline_publishes_at_commit() {
    let mut engine = QueryEngine::new(Config::default());
    let initial = engine.compiler.exprs.number(1.0);
    let writable = area_query::build_writable_at(
        &mut engine.compiler,
        weft::template::TemplateId::GLOBAL,
        &["state".to_string()],
        Value::number(1.0),
        initial,
    );

    assert_eq!(engine.writable_value(writable), None);
    engine.write(writable, Value::number(42.0));
    // Nothing published before the commit task runs.
    assert_eq!(engine.writable_value(writable), None);
    engine.run_until_quiescent().expect("quiescence");
    assert_eq!(engine.writable_value(writable), Some(&Value::number(42.0)));

    // Storage nodes accept writes through the same pipeline.
    let root_path = engine.indexer.get_root_path_id();
    let queue_path = engine.indexer.allocate_path_id(root_path, "messages");
    let cycle = engine.compiler.cx.stub_cycle;
    let queue = engine.compiler.pool.storage_node(
        weft::fnode::StorageKind::MessageQueue,
        queue_path,
        cycle,
    );
    engine.write(queue, Value::string("ping"));
    engine.run_until_quiescent().expect("quiescence");
    assert_eq!(engine.writable_value(queue), Some(&Value::string("ping")));
}

#[test]
fn write_to_constant_is_dropped_with_warning() {
    let mut engine = QueryEngine::new(Config::default());
    let five = engine.compiler.exprs.number(5.0);
    let constant = engine.compiler.build_simple_function_node(
        five,
        None,
        weft::template::TemplateId::GLOBAL,
        weft::DefunId::NONE,
        false,
        &[],
        &[],
        Some(five),
        weft::template::TemplateId::GLOBAL,
    );
    engine.write(constant, Value::number(9.0));
    engine.run_until_quiescent().expect("quiescence");
    assert_eq!(engine.writable_value(constant), None);
    assert!(engine
        .compiler
        .cx
        .warnings
        .messages()
        .any(|m| m.contains("non-writable")));
}

#[test]
fn data_result_activation_seeds_and_clears_matches() {
    let mut engine = QueryEngine::new(Config::default());
    let root_path = engine.indexer.get_root_path_id();
    let items = engine.indexer.allocate_path_id(root_path, "items");
    let e1 = engine
        .add_data_element(items, None, Some(Value::number(1.0)))
        .expect("add");

    let data = engine.results.add_data_result(items, None, false);
    assert!(engine.results.get_dominated_matches(data).is_empty());

    engine.activate_result(data);
    assert_eq!(engine.results.get_dominated_matches(data), vec![e1]);

    // New elements flow in while registered.
    let e2 = engine
        .add_data_element(items, None, Some(Value::number(2.0)))
        .expect("add");
    let mut matches = engine.results.get_dominated_matches(data);
    matches.sort();
    assert_eq!(matches, vec![e1, e2]);

    engine.deactivate_result(data);
    assert!(engine.results.get_dominated_matches(data).is_empty());
}

#[test]
fn order_star_interest_reaches_the_indexer() {
    let mut engine = QueryEngine::new(Config::default());
    let root_path = engine.indexer.get_root_path_id();
    let items = engine.indexer.allocate_path_id(root_path, "items");
    let data = engine.results.add_data_result(items, None, false);

    assert!(!engine.indexer.has_order_interest(items));
    engine.add_order_star(data);
    assert!(engine.indexer.has_order_interest(items));
    engine.remove_order_star(data);
    assert!(!engine.indexer.has_order_interest(items));
}
