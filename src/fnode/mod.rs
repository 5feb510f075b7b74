//! # Function-Node Graph
//!
//! The compiled form of an expression: a DAG of typed function nodes owned
//! by arenas and referenced by [`FnId`]. Constants, attribute-value
//! composers, qualifier-gated variants, builtin applications, boolean gates,
//! area selections/projections, writables and defuns are all variants of one
//! closed enum; recursive traversal is a `match`.
//!
//! Every node records where it can be evaluated (`local_to_area`,
//! `local_to_defun`), its inferred [`ValueType`], the expression it was
//! compiled from, and the compilation cycle that produced it.

use crate::expression::ExprId;
use crate::path::PathId;
use crate::template::{ExportId, TemplateId};
use crate::value::{RangeValue, SizeRanges, Value, ValueType};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Arena index of a function node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FnId(pub u32);

impl FnId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identifier of a defun context; [`DefunId::NONE`] means "not inside a
/// defun".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DefunId(pub u32);

impl DefunId {
    pub const NONE: DefunId = DefunId(0);

    pub fn is_none(self) -> bool {
        self == DefunId::NONE
    }
}

/// Builtin function vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinFunction {
    Plus,
    Minus,
    UMinus,
    Mul,
    Div,
    Pow,
    Exp,
    Ln,
    Log10,
    Log2,
    Logb,
    Sum,
    First,
    Last,
    Bool,
    Not,
    And,
    Or,
    Concat,
    ConcatStr,
    Equal,
    NotEqual,
    Merge,
    MergeWrite,
    Pointer,
    /// `[me]`
    Me,
    /// `[embedding]` (one level up)
    Embedding,
    /// `[areaOfClass, "Name"]`
    AreaOfClass,
    /// `[classOfArea, areas]`
    ClassOfArea,
    /// `[query, data]` on non-area data.
    ExecuteCompiledQuery,
}

impl BuiltinFunction {
    pub fn name(self) -> &'static str {
        match self {
            BuiltinFunction::Plus => "plus",
            BuiltinFunction::Minus => "minus",
            BuiltinFunction::UMinus => "uminus",
            BuiltinFunction::Mul => "mul",
            BuiltinFunction::Div => "div",
            BuiltinFunction::Pow => "pow",
            BuiltinFunction::Exp => "exp",
            BuiltinFunction::Ln => "ln",
            BuiltinFunction::Log10 => "log10",
            BuiltinFunction::Log2 => "log2",
            BuiltinFunction::Logb => "logb",
            BuiltinFunction::Sum => "sum",
            BuiltinFunction::First => "first",
            BuiltinFunction::Last => "last",
            BuiltinFunction::Bool => "bool",
            BuiltinFunction::Not => "not",
            BuiltinFunction::And => "and",
            BuiltinFunction::Or => "or",
            BuiltinFunction::Concat => "concat",
            BuiltinFunction::ConcatStr => "concatStr",
            BuiltinFunction::Equal => "equal",
            BuiltinFunction::NotEqual => "notEqual",
            BuiltinFunction::Merge => "merge",
            BuiltinFunction::MergeWrite => "mergeWrite",
            BuiltinFunction::Pointer => "pointer",
            BuiltinFunction::Me => "me",
            BuiltinFunction::Embedding => "embedding",
            BuiltinFunction::AreaOfClass => "areaOfClass",
            BuiltinFunction::ClassOfArea => "classOfArea",
            BuiltinFunction::ExecuteCompiledQuery => "executeCompiledQuery",
        }
    }
}

/// A runtime condition on a context attribute of a specific area template.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleQualifier {
    pub attribute: String,
    pub value: Value,
    pub target_area: TemplateId,
    /// Compiled node evaluating the attribute, when one exists.
    pub function_node: Option<FnId>,
}

impl SingleQualifier {
    /// Value-level match of the qualifier value against a runtime value:
    /// booleans by truthiness, ranges by containment, ordered sets by
    /// membership, projector matches anything present, otherwise strict
    /// equality.
    pub fn matches(qv: &Value, runtime: &Value) -> bool {
        match qv {
            Value::Bool(b) => runtime.is_true() == *b,
            Value::Range(r) => runtime.items().any(|item| r.contains(item)),
            Value::OrderedSet(items) => items.iter().any(|want| runtime.contains_element(want)),
            Value::Projector => runtime.size() > 0,
            other => runtime.contains_element(other),
        }
    }

    pub fn match_runtime(&self, runtime: &Value) -> bool {
        Self::matches(&self.value, runtime)
    }
}

/// A conjunction of qualifiers gating one variant alternative.
pub type QualifierGroup = Vec<SingleQualifier>;

/// Whether every atom of `g1` appears in `g2` (so `g2 => g1`).
pub fn is_implied_by(g1: &QualifierGroup, g2: &QualifierGroup) -> bool {
    g1.iter().all(|a| {
        g2.iter().any(|b| {
            a.attribute == b.attribute && a.target_area == b.target_area && a.value == b.value
        })
    })
}

/// Whether two groups carry the same atoms (order-insensitive).
pub fn same_group(g1: &QualifierGroup, g2: &QualifierGroup) -> bool {
    g1.len() == g2.len() && is_implied_by(g1, g2) && is_implied_by(g2, g1)
}

/// Writable flavours with engine-owned state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Data,
    Param,
    MessageQueue,
    Pointer,
}

/// Tagged function-node variants.
#[derive(Debug, Clone)]
pub enum FunctionNodeKind {
    Const {
        value: Value,
        /// The value can never change at runtime.
        wont_change: bool,
        /// Suppress implicit ordered-set wrapping on merge.
        suppress_set: bool,
    },
    /// Defun parameter reference.
    VariableRef { defun: DefunId, param: u32 },
    Av {
        attrs: BTreeMap<String, FnId>,
        suppress_set: bool,
    },
    /// Qualifier-gated alternatives; the first group that holds selects.
    Variant {
        qualifiers: Vec<QualifierGroup>,
        alternatives: Vec<FnId>,
    },
    Apply {
        function: BuiltinFunction,
        args: Vec<FnId>,
    },
    ForeignApply {
        name: Arc<str>,
        pure: bool,
        args: Vec<FnId>,
    },
    /// Emits `value` while `condition` is true, else the empty set.
    BoolGate { condition: FnId, value: FnId },
    /// Area-boolean selection of `data` by `selection` under `query`.
    BoolMatch {
        query: ExprId,
        selection: FnId,
        data: FnId,
    },
    AreaSelection {
        path: PathId,
        selection: FnId,
        data: FnId,
    },
    AreaProjection {
        export: ExportId,
        path: PathId,
        data: FnId,
        on_all_areas_of_class: bool,
    },
    /// The named child areas of `data`.
    ChildAreas { name: String, data: FnId },
    OrderedSet { items: Vec<FnId> },
    Writable {
        path: PathId,
        initial: Value,
        /// Expression the write path was built from; used to collapse
        /// writables that describe the same write state.
        source_expr: ExprId,
    },
    Storage { kind: StorageKind, path: PathId },
    /// Placeholder breaking a compilation cycle; resolved before the
    /// template is observed externally.
    Stub {
        resolution: Option<FnId>,
        stub_cycle: u32,
    },
    Defun {
        defun: DefunId,
        params: u32,
        body: FnId,
    },
    /// A closure applied to arguments that were not compile-time constants.
    DefunNode {
        defun: DefunId,
        body: FnId,
        args: Vec<FnId>,
    },
    ClassOfArea { data: FnId },
}

/// One compiled function node.
#[derive(Debug, Clone)]
pub struct FunctionNode {
    pub kind: FunctionNodeKind,
    /// Highest template the node can be evaluated at; `None` = global.
    pub local_to_area: Option<TemplateId>,
    pub local_to_defun: DefunId,
    pub value_type: ValueType,
    /// Provenance for diagnostics.
    pub orig_expr: Option<ExprId>,
    /// Compilation fixpoint cycle that produced the node.
    pub cycle: u32,
}

/// Output-change signals consumers use to invalidate downstream caches.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputSignal {
    ValueTypeChange {
        node: FnId,
        orig: ValueType,
        new: ValueType,
    },
    NrOutputAreas { node: FnId, from: u32, to: u32 },
}

/// Infer the value type of a constant.
pub fn value_type_of(value: &Value) -> ValueType {
    match value {
        Value::Undefined => ValueType::undefined(),
        Value::Bool(_) => ValueType::boolean(),
        Value::Number(_) => ValueType::number(),
        Value::String(_) => ValueType::string(),
        Value::Range(_) => ValueType::number().with_sizes(SizeRanges::exact(1)),
        Value::OrderedSet(items) => {
            let mut t = items
                .iter()
                .map(value_type_of)
                .reduce(|a, b| a.merge(&b))
                .unwrap_or_else(ValueType::undefined);
            t.sizes = SizeRanges::exact(items.len() as u32);
            t
        }
        Value::Record(map) => {
            let attrs = map
                .iter()
                .map(|(k, v)| (k.clone(), value_type_of(v)))
                .collect::<BTreeMap<_, _>>();
            ValueType::object(attrs)
        }
        Value::AreaRef(_) => ValueType {
            sizes: SizeRanges::exact(1),
            ..Default::default()
        },
        Value::Projector => ValueType::projector(),
        Value::Defun(_) => ValueType::defun(ValueType::unknown()),
        Value::Foreign(_) => ValueType::any_data(),
    }
}

/// Arena of function nodes plus the writable registry.
#[derive(Debug, Default)]
pub struct FunctionNodePool {
    nodes: Vec<FunctionNode>,
    /// Canonical writable per `(template, path)`.
    writables: HashMap<(Option<TemplateId>, PathId), FnId>,
}

impl FunctionNodePool {
    pub fn new() -> Self {
        FunctionNodePool::default()
    }

    pub fn add(&mut self, node: FunctionNode) -> FnId {
        let id = FnId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn get(&self, id: FnId) -> &FunctionNode {
        &self.nodes[id.index()]
    }

    pub fn get_mut(&mut self, id: FnId) -> &mut FunctionNode {
        &mut self.nodes[id.index()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a constant node.
    pub fn const_node(&mut self, value: Value, wont_change: bool, cycle: u32) -> FnId {
        let value_type = value_type_of(&value);
        self.add(FunctionNode {
            kind: FunctionNodeKind::Const {
                value,
                wont_change,
                suppress_set: false,
            },
            local_to_area: None,
            local_to_defun: DefunId::NONE,
            value_type,
            orig_expr: None,
            cycle,
        })
    }

    /// The canonical empty-value node used when compilation must continue
    /// after a reported error.
    pub fn empty_os_node(&mut self, cycle: u32) -> FnId {
        self.const_node(Value::Undefined, true, cycle)
    }

    /// Constant value of a node, when it is one (following stubs).
    pub fn const_value(&self, id: FnId) -> Option<&Value> {
        match &self.get(id).kind {
            FunctionNodeKind::Const { value, .. } => Some(value),
            FunctionNodeKind::Stub {
                resolution: Some(r),
                ..
            } => self.const_value(*r),
            _ => None,
        }
    }

    /// Truth of a node decidable at compile time.
    pub fn known_truth(&self, id: FnId) -> Option<bool> {
        self.const_value(id).map(Value::is_true)
    }

    /// Follow stub resolutions to the real node.
    pub fn deref_stub(&self, id: FnId) -> FnId {
        match &self.get(id).kind {
            FunctionNodeKind::Stub {
                resolution: Some(r),
                ..
            } => self.deref_stub(*r),
            _ => id,
        }
    }

    /// Canonical writable for `(template, path)`: returns the existing node
    /// (merging the requested value type into it) or creates one.
    pub fn build_writable(
        &mut self,
        template: Option<TemplateId>,
        path: PathId,
        initial: Value,
        source_expr: ExprId,
        write_type: &ValueType,
        cycle: u32,
    ) -> FnId {
        if let Some(&existing) = self.writables.get(&(template, path)) {
            let node = self.get_mut(existing);
            node.value_type = node.value_type.merge(write_type);
            return existing;
        }
        let initial_type = value_type_of(&initial);
        let id = self.add(FunctionNode {
            kind: FunctionNodeKind::Writable {
                path,
                initial,
                source_expr,
            },
            local_to_area: template,
            local_to_defun: DefunId::NONE,
            value_type: write_type.merge(&initial_type),
            orig_expr: Some(source_expr),
            cycle,
        });
        self.writables.insert((template, path), id);
        id
    }

    pub fn writable_at(&self, template: Option<TemplateId>, path: PathId) -> Option<FnId> {
        self.writables.get(&(template, path)).copied()
    }

    /// Add an engine-owned storage node at a path.
    pub fn storage_node(&mut self, kind: StorageKind, path: PathId, cycle: u32) -> FnId {
        self.add(FunctionNode {
            kind: FunctionNodeKind::Storage { kind, path },
            local_to_area: None,
            local_to_defun: DefunId::NONE,
            value_type: ValueType::any_data(),
            orig_expr: None,
            cycle,
        })
    }

    /// Insert a stub for the current cycle.
    pub fn add_stub(&mut self, value_type: ValueType, stub_cycle: u32) -> FnId {
        self.add(FunctionNode {
            kind: FunctionNodeKind::Stub {
                resolution: None,
                stub_cycle,
            },
            local_to_area: None,
            local_to_defun: DefunId::NONE,
            value_type,
            orig_expr: None,
            cycle: stub_cycle,
        })
    }

    /// Resolve a stub to its final node.
    pub fn resolve_stub(&mut self, stub: FnId, target: FnId) {
        debug_assert!(stub != target, "stub resolving to itself");
        let target_type = self.get(target).value_type.clone();
        let target_area = self.get(target).local_to_area;
        let target_defun = self.get(target).local_to_defun;
        let node = self.get_mut(stub);
        match &mut node.kind {
            FunctionNodeKind::Stub { resolution, .. } => {
                *resolution = Some(target);
                node.value_type = target_type;
                node.local_to_area = target_area;
                node.local_to_defun = target_defun;
            }
            other => panic!("resolve_stub on non-stub node: {other:?}"),
        }
    }

    /// Check the adjacent-duplicate invariant of a variant's groups: no two
    /// adjacent groups with identical atoms whose alternatives share an
    /// origin expression.
    pub fn variant_has_adjacent_duplicates(
        &self,
        qualifiers: &[QualifierGroup],
        alternatives: &[FnId],
    ) -> bool {
        qualifiers.windows(2).enumerate().any(|(i, pair)| {
            same_group(&pair[0], &pair[1])
                && alternatives.get(i).is_some()
                && alternatives.get(i + 1).is_some()
                && self.get(alternatives[i]).orig_expr.is_some()
                && self.get(alternatives[i]).orig_expr == self.get(alternatives[i + 1]).orig_expr
        })
    }
}

/// Build a range-valued constant; convenience for tests and callers.
pub fn range_value(low: f64, high: f64) -> Value {
    Value::Range(RangeValue::closed(Value::Number(low), Value::Number(high)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn const_nodes_carry_inferred_types() {
        let mut pool = FunctionNodePool::new();
        let id = pool.const_node(Value::number(5.0), true, 0);
        assert!(pool.get(id).value_type.number);
        assert_eq!(pool.get(id).value_type.sizes.max(), 1);
        assert_eq!(pool.const_value(id), Some(&Value::number(5.0)));
    }

    #[test]
    fn writable_is_canonical_per_template_and_path() {
        let mut pool = FunctionNodePool::new();
        let path = PathId(3);
        let expr = ExprId(0);
        let w1 = pool.build_writable(None, path, Value::number(1.0), expr, &ValueType::number(), 0);
        let w2 = pool.build_writable(None, path, Value::number(2.0), expr, &ValueType::string(), 0);
        assert_eq!(w1, w2);
        let t = &pool.get(w1).value_type;
        assert!(t.number && t.string);
    }

    #[test]
    fn stub_resolution_propagates_type() {
        let mut pool = FunctionNodePool::new();
        let stub = pool.add_stub(ValueType::unknown(), 1);
        let target = pool.const_node(Value::string("x"), true, 1);
        pool.resolve_stub(stub, target);
        assert_eq!(pool.deref_stub(stub), target);
        assert!(pool.get(stub).value_type.string);
    }

    #[test]
    fn qualifier_value_matching() {
        let q = Value::Range(RangeValue::closed(Value::number(1.0), Value::number(3.0)));
        assert!(SingleQualifier::matches(&q, &Value::number(2.0)));
        assert!(!SingleQualifier::matches(&q, &Value::number(4.0)));
        assert!(SingleQualifier::matches(&Value::Bool(true), &Value::number(0.0)));
        assert!(SingleQualifier::matches(&Value::Projector, &Value::string("x")));
        assert!(!SingleQualifier::matches(&Value::Projector, &Value::Undefined));
        let os = Value::os(vec![Value::string("a"), Value::string("b")]);
        assert!(SingleQualifier::matches(&os, &Value::string("b")));
    }

    #[test]
    fn implication_between_groups() {
        let mk = |attr: &str, v: f64| SingleQualifier {
            attribute: attr.to_string(),
            value: Value::number(v),
            target_area: TemplateId::GLOBAL,
            function_node: None,
        };
        let g1 = vec![mk("a", 1.0)];
        let g2 = vec![mk("a", 1.0), mk("b", 2.0)];
        assert!(is_implied_by(&g1, &g2));
        assert!(!is_implied_by(&g2, &g1));
        assert!(!same_group(&g1, &g2));
    }
}
