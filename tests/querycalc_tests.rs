//! Query-calculation runtime tests: match raising at the root, id-query
//! diffing, and composite aggregation through the engine dispatch loop.

use weft::config::Config;
use weft::engine::QueryEngine;
use weft::indexer::{DataElementId, Indexer};
use weft::path::{PathId, PathStore};
use weft::querycalc::root::{RootId, RootNotification, RootQueryCalc};
use weft::querycalc::{QueryCalcPool, QueryDesc};
use weft::result::ResultId;
use weft::value::Value;
use std::cell::RefCell;
use std::rc::Rc;

fn paths_with(attrs: &[&str]) -> (Rc<RefCell<PathStore>>, Vec<PathId>) {
    let store = Rc::new(RefCell::new(PathStore::new()));
    let mut ids = Vec::new();
    {
        let mut s = store.borrow_mut();
        let mut cur = s.get_root_path_id();
        for attr in attrs {
            cur = s.allocate_path_id(cur, attr);
            ids.push(cur);
        }
    }
    (store, ids)
}

/// Root raising: matches at a lower match point raise to the prefix path,
/// reference counted, and removal only retracts on the last contribution.
#[test]
fn root_raises_and_reference_counts_matches() {
    let (store, ids) = paths_with(&["p", "q"]);
    let p = ids[0];
    let pq = ids[1];
    let mut indexer = Indexer::new(store);

    // Parents 2 and 4 at p; children 1 (of 2) and 3 (of 4) at p.q.
    let parent2 = indexer.add_data_element(p, None, None).expect("add");
    let child1 = indexer.add_data_element(pq, Some(parent2), None).expect("add");
    let parent4 = indexer.add_data_element(p, None, None).expect("add");
    let child3 = indexer.add_data_element(pq, Some(parent4), None).expect("add");

    let mut root = RootQueryCalc::new(RootId(0), p);
    root.set_lower_match_points(vec![pq]);
    let result = ResultId(0);
    root.register_result(result);

    let notifications = root.top_delta(&[child1, child3], &[], &indexer);
    let mut added = Vec::new();
    for n in &notifications {
        if let RootNotification::AddMatches { elements, .. } = n {
            added.extend(elements.iter().copied());
        }
    }
    added.sort();
    assert_eq!(added, vec![parent2, parent4]);
    assert_eq!(root.raised_count(parent2), 1);
    assert_eq!(root.total_raised_count(), 2);

    // A second match under parent 2 only bumps the count.
    let child1b = indexer.add_data_element(pq, Some(parent2), None).expect("add");
    let notifications = root.top_delta(&[child1b], &[], &indexer);
    assert!(notifications.is_empty());
    assert_eq!(root.raised_count(parent2), 2);

    // Removing child 1 leaves parent 2 raised through child 1b.
    let notifications = root.top_delta(&[], &[child1], &indexer);
    assert!(notifications.is_empty());
    assert_eq!(root.raised_count(parent2), 1);

    // The last removal retracts parent 2; parent 4 stays.
    let notifications = root.top_delta(&[], &[child1b], &indexer);
    let removed: Vec<DataElementId> = notifications
        .iter()
        .filter_map(|n| match n {
            RootNotification::RemoveMatches { elements, .. } => Some(elements.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(removed, vec![parent2]);
    assert_eq!(root.raised_count(parent4), 1);
}

/// Removing any subset then the remainder restores the emitted multiset to
/// empty.
#[test]
fn root_add_remove_round_trip_restores_empty() {
    let (store, ids) = paths_with(&["p"]);
    let p = ids[0];
    let mut indexer = Indexer::new(store);
    let a = indexer.add_data_element(p, None, None).expect("add");
    let b = indexer.add_data_element(p, None, None).expect("add");
    let c = indexer.add_data_element(p, None, None).expect("add");

    let mut root = RootQueryCalc::new(RootId(0), p);
    root.register_result(ResultId(0));
    root.top_delta(&[a, b, c], &[], &indexer);
    assert_eq!(root.total_raised_count(), 3);
    root.top_delta(&[], &[b], &indexer);
    root.top_delta(&[], &[c, a], &indexer);
    assert_eq!(root.total_raised_count(), 0);
    assert!(root.emitted_matches().is_empty());
}

#[test]
fn id_query_diffs_against_indexer() {
    let (store, ids) = paths_with(&["p"]);
    let p = ids[0];
    let mut indexer = Indexer::new(store);
    let a = indexer.add_data_element(p, None, None).expect("add");
    let missing = DataElementId(999);

    let mut pool = QueryCalcPool::new();
    let desc = QueryDesc::Ids {
        path: p,
        ids: vec![],
    };
    let qc = pool.build(&desc, &mut indexer, p);

    let delta = pool.add_data_elements(qc, &[a, missing], &indexer);
    let delta = delta.expect("delta");
    assert_eq!(delta.added, vec![a]);

    // The missing id is parked, not matched.
    let refreshed = pool.refresh_id_query(qc, &indexer);
    assert!(refreshed.is_none());

    // Round trip back to empty.
    let delta = pool.remove_data_elements(qc, &[a, missing]).expect("delta");
    assert_eq!(delta.removed, vec![a]);
    assert!(pool.get(qc).matches.is_empty());
}

#[test]
fn engine_maintains_simple_selection_matches() {
    let mut engine = QueryEngine::new(Config::default());
    let root_path = engine.indexer.get_root_path_id();
    let items = engine.indexer.allocate_path_id(root_path, "items");

    let e5 = engine
        .add_data_element(items, None, Some(Value::number(5.0)))
        .expect("add");
    let _e7 = engine
        .add_data_element(items, None, Some(Value::number(7.0)))
        .expect("add");

    let desc = QueryDesc::Simple {
        path: items,
        selection: Value::number(5.0),
    };
    let (_root, result) = engine.attach_query(&desc, items);
    engine.run_until_quiescent().expect("quiescence");
    assert_eq!(engine.results.get_dominated_matches(result), vec![e5]);

    // A key change moves the element out of the match set.
    engine.update_key(items, e5, Value::number(6.0));
    engine.run_until_quiescent().expect("quiescence");
    assert!(engine.results.get_dominated_matches(result).is_empty());

    // And back in.
    engine.update_key(items, e5, Value::number(5.0));
    engine.run_until_quiescent().expect("quiescence");
    assert_eq!(engine.results.get_dominated_matches(result), vec![e5]);
}

#[test]
fn engine_range_selection_matches_by_containment() {
    let mut engine = QueryEngine::new(Config::default());
    let root_path = engine.indexer.get_root_path_id();
    let items = engine.indexer.allocate_path_id(root_path, "items");

    let e2 = engine
        .add_data_element(items, None, Some(Value::number(2.0)))
        .expect("add");
    let _e9 = engine
        .add_data_element(items, None, Some(Value::number(9.0)))
        .expect("add");

    let desc = QueryDesc::Simple {
        path: items,
        selection: weft::fnode::range_value(1.0, 5.0),
    };
    let (_root, result) = engine.attach_query(&desc, items);
    engine.run_until_quiescent().expect("quiescence");
    assert_eq!(engine.results.get_dominated_matches(result), vec![e2]);
}

#[test]
fn engine_intersects_multi_attribute_selections() {
    let mut engine = QueryEngine::new(Config::default());
    let root_path = engine.indexer.get_root_path_id();
    let items = engine.indexer.allocate_path_id(root_path, "items");
    let a_path = engine.indexer.allocate_path_id(items, "a");
    let b_path = engine.indexer.allocate_path_id(items, "b");

    // Element 1: a=1, b=2 (matches); element 2: a=1, b=9 (does not).
    let e1 = engine.add_data_element(items, None, None).expect("add");
    engine
        .add_data_element(a_path, Some(e1), Some(Value::number(1.0)))
        .expect("add");
    engine
        .add_data_element(b_path, Some(e1), Some(Value::number(2.0)))
        .expect("add");
    let e2 = engine.add_data_element(items, None, None).expect("add");
    engine
        .add_data_element(a_path, Some(e2), Some(Value::number(1.0)))
        .expect("add");
    engine
        .add_data_element(b_path, Some(e2), Some(Value::number(9.0)))
        .expect("add");

    let desc = QueryDesc::Intersection(vec![
        QueryDesc::Simple {
            path: a_path,
            selection: Value::number(1.0),
        },
        QueryDesc::Simple {
            path: b_path,
            selection: Value::number(2.0),
        },
    ]);
    let (_root, result) = engine.attach_query(&desc, items);
    engine.run_until_quiescent().expect("quiescence");
    assert_eq!(engine.results.get_dominated_matches(result), vec![e1]);
}

#[test]
fn engine_negation_excludes_matching_elements() {
    let mut engine = QueryEngine::new(Config::default());
    let root_path = engine.indexer.get_root_path_id();
    let items = engine.indexer.allocate_path_id(root_path, "items");
    let a_path = engine.indexer.allocate_path_id(items, "a");

    let e1 = engine.add_data_element(items, None, None).expect("add");
    engine
        .add_data_element(a_path, Some(e1), Some(Value::number(1.0)))
        .expect("add");
    let e2 = engine.add_data_element(items, None, None).expect("add");
    engine
        .add_data_element(a_path, Some(e2), Some(Value::number(2.0)))
        .expect("add");

    // Elements whose a is not 1.
    let desc = QueryDesc::Negation {
        path: items,
        negated: vec![QueryDesc::Simple {
            path: a_path,
            selection: Value::number(1.0),
        }],
    };
    let (_root, result) = engine.attach_query(&desc, items);
    engine.run_until_quiescent().expect("quiescence");
    assert_eq!(engine.results.get_dominated_matches(result), vec![e2]);
}

#[test]
fn engine_union_combines_branches() {
    let mut engine = QueryEngine::new(Config::default());
    let root_path = engine.indexer.get_root_path_id();
    let items = engine.indexer.allocate_path_id(root_path, "items");

    let e1 = engine
        .add_data_element(items, None, Some(Value::number(1.0)))
        .expect("add");
    let e2 = engine
        .add_data_element(items, None, Some(Value::number(2.0)))
        .expect("add");
    let _e3 = engine
        .add_data_element(items, None, Some(Value::number(3.0)))
        .expect("add");

    let desc = QueryDesc::Union(vec![
        QueryDesc::Simple {
            path: items,
            selection: Value::number(1.0),
        },
        QueryDesc::Simple {
            path: items,
            selection: Value::number(2.0),
        },
    ]);
    let (_root, result) = engine.attach_query(&desc, items);
    engine.run_until_quiescent().expect("quiescence");
    let mut matches = engine.results.get_dominated_matches(result);
    matches.sort();
    assert_eq!(matches, vec![e1, e2]);
}

#[test]
fn projection_matches_lower_to_match_points() {
    let mut engine = QueryEngine::new(Config::default());
    let root_path = engine.indexer.get_root_path_id();
    let items = engine.indexer.allocate_path_id(root_path, "items");
    let name = engine.indexer.allocate_path_id(items, "name");

    let e1 = engine
        .add_data_element(items, None, Some(Value::number(1.0)))
        .expect("add");
    let n1 = engine
        .add_data_element(name, Some(e1), Some(Value::string("one")))
        .expect("add");

    let desc = QueryDesc::Intersection(vec![
        QueryDesc::Simple {
            path: items,
            selection: Value::number(1.0),
        },
        QueryDesc::Projection {
            path: name,
            mapped_path: name,
        },
    ]);
    let (root, result) = engine.attach_query(&desc, items);
    engine.run_until_quiescent().expect("quiescence");

    let selection = engine.results.get_dominated_matches(result);
    assert_eq!(selection, vec![e1]);
    let projected = engine.projection_matches(root, result);
    assert!(projected.contains(&e1) && projected.contains(&n1));

    // The projection terminal is a generating projection.
    assert_eq!(engine.root(root).terminal_generating_proj_num(), 1);
}
