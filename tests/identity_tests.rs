//! Identity subsystem tests through the engine: fixed and compressed
//! identities, key-update monitoring, merged-children rerouting.

use weft::config::Config;
use weft::engine::QueryEngine;
use weft::indexer::Identity;
use weft::merge::GroupId;
use weft::value::Value;

#[test]
fn fixed_identity_attaches_and_detaches() {
    let mut engine = QueryEngine::new(Config::default());
    let root = engine.indexer.get_root_path_id();
    let items = engine.indexer.allocate_path_id(root, "items");
    let e = engine.add_data_element(items, None, None).expect("add");

    let (result, ident) =
        engine.add_identity_result(items, items, Some(Value::string("tag")));
    engine.identify(result, &[e]);
    engine.run_until_quiescent().expect("quiescence");
    assert_eq!(
        engine.indexer.get_identity(ident, e),
        Identity::Constant(Value::string("tag"))
    );

    engine.unidentify(result, &[e]);
    engine.run_until_quiescent().expect("quiescence");
    assert_eq!(engine.indexer.get_identity(ident, e), Identity::Element(e));
}

#[test]
fn compressed_identity_follows_key_updates() {
    let mut engine = QueryEngine::new(Config::default());
    let root = engine.indexer.get_root_path_id();
    let items = engine.indexer.allocate_path_id(root, "items");
    let name = engine.indexer.allocate_path_id(items, "name");

    let parent = engine.add_data_element(items, None, None).expect("add");
    let child = engine
        .add_data_element(name, Some(parent), Some(Value::string("alpha")))
        .expect("add");

    let (result, ident) = engine.add_identity_result(items, name, None);
    engine.identify(result, &[child]);
    engine.run_until_quiescent().expect("quiescence");
    let before = engine.indexer.get_identity(ident, parent);
    assert!(matches!(before, Identity::Compressed(_)));

    // A key change reroutes through the monitor and recomputes the
    // compressed identity.
    engine.update_key(name, child, Value::string("beta"));
    engine.run_until_quiescent().expect("quiescence");
    let after = engine.indexer.get_identity(ident, parent);
    assert!(matches!(after, Identity::Compressed(_)));
    assert_ne!(before, after);

    // Equal keys compress to equal identities.
    engine.update_key(name, child, Value::string("alpha"));
    engine.run_until_quiescent().expect("quiescence");
    assert_eq!(engine.indexer.get_identity(ident, parent), before);
}

#[test]
fn identity_change_rewrites_merged_children() {
    let mut engine = QueryEngine::new(Config::default());
    let root = engine.indexer.get_root_path_id();
    let items = engine.indexer.allocate_path_id(root, "items");
    let name = engine.indexer.allocate_path_id(items, "name");

    let parent = engine.add_data_element(items, None, None).expect("add");
    let child_el = engine
        .add_data_element(name, Some(parent), Some(Value::string("alpha")))
        .expect("add");
    let merged_child = engine.add_data_element(items, None, None).expect("add");

    let (result, ident) = engine.add_identity_result(items, name, None);
    engine.identify(result, &[child_el]);
    engine.run_until_quiescent().expect("quiescence");
    let identity = engine.indexer.get_identity(ident, parent);

    // Register a merged child under the parent's current identity.
    let group = GroupId(1);
    engine
        .children_by_identity
        .register_group(group, 0, ident);
    engine
        .children_by_identity
        .add_child(identity.clone(), parent, merged_child, group);

    // The key change flows: monitor -> identity update -> children table.
    engine.update_key(name, child_el, Value::string("beta"));
    engine.run_until_quiescent().expect("quiescence");
    let new_identity = engine.indexer.get_identity(ident, parent);
    assert_ne!(identity, new_identity);
    assert_eq!(
        engine
            .children_by_identity
            .identity_of(merged_child, group),
        Some(&new_identity)
    );
    assert!(engine.children_by_identity.check_consistency());
}

#[test]
fn destroy_identity_result_cleans_up() {
    let mut engine = QueryEngine::new(Config::default());
    let root = engine.indexer.get_root_path_id();
    let items = engine.indexer.allocate_path_id(root, "items");
    let e = engine.add_data_element(items, None, None).expect("add");

    let (result, ident) = engine.add_identity_result(items, items, Some(Value::number(1.0)));
    engine.identify(result, &[e]);
    engine.run_until_quiescent().expect("quiescence");
    assert!(engine.indexer.has_identification_requests(ident));

    engine.destroy_identity_result(result);
    assert!(!engine.indexer.has_identification_requests(ident));
    assert_eq!(engine.indexer.get_identity(ident, e), Identity::Element(e));
}
