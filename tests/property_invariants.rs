//! Property-based invariant tests (proptest): size-range well-formedness,
//! constant-folding refinement, merge-table consistency, raise-count
//! conservation, and qualifier-simplification semantics.

use proptest::prelude::*;
use std::cell::RefCell;
use std::rc::Rc;

use weft::compiler::qualifiers::{
    build_qualifier_node, CompiledQualifier, QualifiedValue,
};
use weft::compiler::{fold, Compiler};
use weft::config::OptimizationConfig;
use weft::fnode::{BuiltinFunction, FunctionNodeKind, SingleQualifier};
use weft::indexer::{DataElementId, IdentificationId, Identity, Indexer};
use weft::merge::{ChildrenByIdentity, GroupId};
use weft::path::PathStore;
use weft::querycalc::root::{RootId, RootQueryCalc};
use weft::result::ResultId;
use weft::template::TemplateId;
use weft::value::{SizeRange, SizeRanges, Value};

// ---------------------------------------------------------------------------
// Size ranges
// ---------------------------------------------------------------------------

fn size_range_strategy() -> impl Strategy<Value = SizeRange> {
    (0u32..50, 0u32..50).prop_map(|(a, b)| SizeRange::span(a.min(b), a.max(b)))
}

proptest! {
    #[test]
    fn size_ranges_stay_well_formed(ranges in prop::collection::vec(size_range_strategy(), 1..8)) {
        let s = SizeRanges::new(ranges);
        prop_assert!(!s.is_empty());
        let mut prev_max: Option<u32> = None;
        for r in s.ranges() {
            prop_assert!(r.min <= r.max);
            if let Some(pm) = prev_max {
                // Disjoint and non-adjacent after normalisation.
                prop_assert!(r.min > pm + 1);
            }
            prev_max = Some(r.max);
        }
    }

    #[test]
    fn size_range_union_covers_operands(
        a in prop::collection::vec(size_range_strategy(), 1..5),
        b in prop::collection::vec(size_range_strategy(), 1..5),
    ) {
        let sa = SizeRanges::new(a);
        let sb = SizeRanges::new(b);
        let joined = sa.union(&sb);
        prop_assert!(joined.contains(&sa));
        prop_assert!(joined.contains(&sb));
        let met = sa.intersect(&sb);
        if !met.is_empty() {
            prop_assert!(sa.contains(&met));
            prop_assert!(sb.contains(&met));
        }
    }
}

// ---------------------------------------------------------------------------
// Constant folding refinement
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn binary_arithmetic_folds_to_runtime_value(a in -1e6f64..1e6, b in -1e6f64..1e6) {
        let cases = [
            (BuiltinFunction::Plus, a + b),
            (BuiltinFunction::Minus, a - b),
            (BuiltinFunction::Mul, a * b),
        ];
        for (f, expected) in cases {
            let folded = fold::check_constant_result(f, &[Value::number(a), Value::number(b)]);
            prop_assert_eq!(folded, Some(Value::number(expected)));
        }
    }

    #[test]
    fn identity_stripping_preserves_fold(a in -1e6f64..1e6) {
        // x + 0, x * 1, x / 1 fold to x.
        let x = Value::number(a);
        prop_assert_eq!(
            fold::check_constant_result(BuiltinFunction::Plus, &[x.clone(), Value::number(0.0)]),
            Some(x.clone())
        );
        prop_assert_eq!(
            fold::check_constant_result(BuiltinFunction::Mul, &[x.clone(), Value::number(1.0)]),
            Some(x.clone())
        );
        prop_assert_eq!(
            fold::check_constant_result(BuiltinFunction::Div, &[x.clone(), Value::number(1.0)]),
            Some(x)
        );
    }

    #[test]
    fn bool_gates_fold_by_truthiness(values in prop::collection::vec(any::<bool>(), 1..6)) {
        let args: Vec<Value> = values.iter().map(|&b| Value::Bool(b)).collect();
        prop_assert_eq!(
            fold::check_constant_result(BuiltinFunction::And, &args),
            Some(Value::Bool(values.iter().all(|&b| b)))
        );
        prop_assert_eq!(
            fold::check_constant_result(BuiltinFunction::Or, &args),
            Some(Value::Bool(values.iter().any(|&b| b)))
        );
    }
}

// ---------------------------------------------------------------------------
// Children-by-identity consistency
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum ChildOp {
    Add { identity: u64, parent: u64, child: u64, group: u32 },
    Remove { parent: u64, child: u64, group: u32 },
}

fn child_op_strategy() -> impl Strategy<Value = ChildOp> {
    prop_oneof![
        (0u64..4, 0u64..4, 0u64..6, 0u32..3).prop_map(|(identity, parent, child, group)| {
            ChildOp::Add { identity, parent, child, group }
        }),
        (0u64..4, 0u64..6, 0u32..3).prop_map(|(parent, child, group)| ChildOp::Remove {
            parent,
            child,
            group
        }),
    ]
}

proptest! {
    #[test]
    fn children_table_stays_consistent(ops in prop::collection::vec(child_op_strategy(), 0..40)) {
        let mut table = ChildrenByIdentity::new();
        // Remember where each (child, group) currently lives so removals
        // use the right parent.
        let mut live: std::collections::HashMap<(u64, u32), u64> = std::collections::HashMap::new();
        for op in ops {
            match op {
                ChildOp::Add { identity, parent, child, group } => {
                    table.add_child(
                        Identity::Compressed(identity),
                        DataElementId(parent),
                        DataElementId(child),
                        GroupId(group),
                    );
                    live.insert((child, group), parent);
                }
                ChildOp::Remove { parent: _, child, group } => {
                    if let Some(parent) = live.remove(&(child, group)) {
                        table.remove_child(
                            DataElementId(parent),
                            DataElementId(child),
                            GroupId(group),
                        );
                    }
                }
            }
            prop_assert!(table.check_consistency());
        }
        // Removing everything restores the empty state.
        let remaining: Vec<((u64, u32), u64)> = live.into_iter().collect();
        for ((child, group), parent) in remaining {
            table.remove_child(DataElementId(parent), DataElementId(child), GroupId(group));
        }
        prop_assert!(table.check_consistency());
        prop_assert_eq!(table.num_children(), 0);
    }

    #[test]
    fn update_identity_preserves_consistency(
        children in prop::collection::vec(0u64..6, 1..6),
        new_identity in 100u64..110,
    ) {
        let mut table = ChildrenByIdentity::new();
        let group = GroupId(0);
        table.register_group(group, 0, IdentificationId(0));
        for &c in &children {
            table.add_child(
                Identity::Compressed(7),
                DataElementId(50),
                DataElementId(c),
                group,
            );
        }
        let updates = table.update_identity(
            DataElementId(50),
            &Identity::Compressed(new_identity),
            0,
            IdentificationId(0),
        );
        let distinct: std::collections::HashSet<u64> = children.iter().copied().collect();
        prop_assert_eq!(updates.len(), distinct.len());
        prop_assert!(table.check_consistency());
    }
}

// ---------------------------------------------------------------------------
// Raise-count conservation
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn raised_counts_equal_outstanding_adds(ops in prop::collection::vec(any::<bool>(), 1..60)) {
        let store = Rc::new(RefCell::new(PathStore::new()));
        let p = store.borrow_mut().allocate_path_id(PathStore::ROOT, "p");
        let pq = store.borrow_mut().allocate_path_id(p, "q");
        let mut indexer = Indexer::new(store);
        let parent = indexer.add_data_element(p, None, None).expect("add");
        let child = indexer.add_data_element(pq, Some(parent), None).expect("add");

        let mut root = RootQueryCalc::new(RootId(0), p);
        root.set_lower_match_points(vec![pq]);
        root.register_result(ResultId(0));

        let mut outstanding: u64 = 0;
        for add in ops {
            if add {
                root.top_delta(&[child], &[], &indexer);
                outstanding += 1;
            } else if outstanding > 0 {
                root.top_delta(&[], &[child], &indexer);
                outstanding -= 1;
            }
            prop_assert_eq!(root.total_raised_count(), outstanding);
            let emitted = root.emitted_matches();
            if outstanding > 0 {
                prop_assert_eq!(emitted, vec![parent]);
            } else {
                prop_assert!(emitted.is_empty());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Qualifier simplification semantics
// ---------------------------------------------------------------------------

fn atom(attr: u8) -> SingleQualifier {
    SingleQualifier {
        attribute: format!("q{attr}"),
        value: Value::Bool(true),
        target_area: TemplateId::GLOBAL,
        function_node: None,
    }
}

fn group_satisfied(group: &[SingleQualifier], assignment: &[bool; 4]) -> bool {
    group.iter().all(|a| {
        let idx = a.attribute.trim_start_matches('q').parse::<usize>().unwrap_or(0);
        assignment[idx % 4]
    })
}

proptest! {
    /// The simplified variant selects the same alternative as the original
    /// prioritised list under every truth assignment (first satisfied group
    /// wins; alternatives are unmergeable constants).
    #[test]
    fn qualifier_simplification_preserves_selection(
        groups in prop::collection::vec(prop::collection::vec(0u8..4, 0..3), 1..6),
        assignment in prop::array::uniform4(any::<bool>()),
    ) {
        let paths = Rc::new(RefCell::new(PathStore::new()));
        let mut compiler = Compiler::new(paths, OptimizationConfig::default(), 10);
        let cycle = compiler.cx.stub_cycle;

        let mut values = Vec::new();
        let mut originals: Vec<(Vec<SingleQualifier>, f64)> = Vec::new();
        for (i, attrs) in groups.iter().enumerate() {
            let group: Vec<SingleQualifier> = attrs.iter().map(|&a| atom(a)).collect();
            let payload = i as f64;
            let expr = compiler.exprs.number(payload);
            let node = compiler.pool.const_node(Value::number(payload), true, cycle);
            compiler.pool.get_mut(node).orig_expr = Some(expr);
            originals.push((group.clone(), payload));
            let qualifier = if group.is_empty() {
                CompiledQualifier::AlwaysTrue
            } else {
                CompiledQualifier::Group(group)
            };
            values.push(QualifiedValue { qualifier, node, expr });
        }

        let variant = build_qualifier_node(
            &mut compiler,
            values,
            TemplateId::GLOBAL,
            weft::fnode::DefunId::NONE,
            cycle,
        );

        // Reference semantics: first satisfied group in the original list.
        let expected = originals
            .iter()
            .find(|(g, _)| group_satisfied(g, &assignment))
            .map(|(_, payload)| *payload);

        // Evaluate the simplified node the same way.
        let actual = match &compiler.pool.get(variant).kind {
            FunctionNodeKind::Variant { qualifiers, alternatives } => qualifiers
                .iter()
                .zip(alternatives)
                .find(|(g, _)| group_satisfied(g, &assignment))
                .and_then(|(_, &alt)| compiler.pool.const_value(alt))
                .and_then(Value::as_number),
            FunctionNodeKind::Const { value, .. } => {
                if value == &Value::Undefined {
                    None
                } else {
                    value.as_number()
                }
            }
            other => panic!("unexpected node kind {other:?}"),
        };
        prop_assert_eq!(actual, expected);
    }
}
