//! # Expression Compiler
//!
//! Converts expression trees into function nodes, per area template and
//! defun context. Compilation is cached per template (`expression_cache`),
//! cycle-guarded through stub nodes, and optimised on the way out: constant
//! folding, redundant-argument removal, qualifier simplification and
//! area-query rewrites.
//!
//! ```text
//! Expression (store id) -> [Compiler] -> FnId into FunctionNodePool
//! ```
//!
//! All compiler-global state (stub cycle counter, parameter stack, export
//! re-entry guard, warning registry) lives in [`CompilerContext`] so that
//! reentrancy is explicit.

pub mod area_query;
pub mod defun;
pub mod fold;
pub mod qualifiers;

use crate::config::OptimizationConfig;
use crate::error::WarnOnce;
use crate::expression::{ExprId, ExprKind, ExpressionStore};
use crate::fnode::{
    BuiltinFunction, DefunId, FnId, FunctionNode, FunctionNodeKind, FunctionNodePool,
    OutputSignal, QualifierGroup,
};
use crate::path::{PathId, PathStore};
use crate::template::{ExportId, TemplateId, TemplateTree};
use crate::value::{RangeValue, SizeRanges, Value, ValueType};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::Arc;

use qualifiers::{CompiledQualifier, QualifierAtom, QualifiedValue};

/// Shared single-threaded handle to the path store (the indexer holds the
/// other end).
pub type SharedPathStore = Rc<RefCell<PathStore>>;

/// Write access requested for a compiled node.
#[derive(Debug, Clone)]
pub struct WritabilitySpec {
    pub path: PathId,
    pub initial: Value,
}

/// Binding of a defun parameter name during compilation.
#[derive(Debug, Clone, Copy)]
pub enum ParamBinding {
    /// Applied to a concrete node (constant application).
    Bound(FnId),
    /// Open parameter of an enclosing defun.
    Param(DefunId, u32),
}

pub type ParamFrame = HashMap<Arc<str>, ParamBinding>;

/// A registered defun definition.
#[derive(Debug, Clone)]
pub struct DefunInfo {
    pub id: DefunId,
    pub params: Vec<Arc<str>>,
    pub body: ExprId,
    pub origin: TemplateId,
}

/// A registered host function.
#[derive(Clone)]
pub struct ForeignFunction {
    pub pure: bool,
    pub eval: Option<fn(&[Value]) -> Value>,
}

/// One qualified alternative of a merge node, before compilation.
#[derive(Debug, Clone)]
pub struct PathInfo {
    pub qualifier: Vec<QualifierAtom>,
    pub expr: ExprId,
    pub priority: i32,
    /// Attribute path beyond the node; the compiled value is wrapped in a
    /// nested AV describing it.
    pub attr_path: Vec<String>,
    /// When present, the alternative is writable at this path.
    pub writable: Option<WritabilitySpec>,
}

/// Compiler-global mutable state, passed around explicitly.
#[derive(Debug)]
pub struct CompilerContext {
    pub stub_cycle: u32,
    pub parameter_stack: Vec<ParamFrame>,
    pub export_stack: Vec<(String, TemplateId)>,
    export_counts: HashMap<(String, TemplateId), u32>,
    pub export_paths: HashMap<ExportId, PathId>,
    pub path_to_export: HashMap<PathId, ExportId>,
    next_export_id: u32,
    pub warnings: WarnOnce,
    max_export_reentry: u32,
}

impl CompilerContext {
    pub fn new(max_export_reentry: u32) -> Self {
        CompilerContext {
            stub_cycle: 1,
            parameter_stack: Vec::new(),
            export_stack: Vec::new(),
            export_counts: HashMap::new(),
            export_paths: HashMap::new(),
            path_to_export: HashMap::new(),
            // 0 is the class-membership export.
            next_export_id: 1,
            warnings: WarnOnce::new(),
            max_export_reentry,
        }
    }

    /// Advance to a fresh stub cycle; export re-entry counts reset with it.
    pub fn next_stub_cycle(&mut self) -> u32 {
        self.stub_cycle += 1;
        self.export_counts.clear();
        self.stub_cycle
    }

    /// Guard against runaway export recursion. Re-entering the same
    /// `(path, template)` beyond the configured bound is a broken invariant.
    pub fn enter_export(&mut self, path_str: &str, template: TemplateId) {
        let count = self
            .export_counts
            .entry((path_str.to_string(), template))
            .or_insert(0);
        *count += 1;
        assert!(
            *count <= self.max_export_reentry,
            "export {path_str} of template {template:?} re-entered {count} times in one cycle"
        );
        self.export_stack.push((path_str.to_string(), template));
    }

    pub fn exit_export(&mut self) {
        self.export_stack.pop();
    }
}

/// The expression-to-function-node compiler.
pub struct Compiler {
    pub exprs: ExpressionStore,
    pub templates: TemplateTree,
    pub pool: FunctionNodePool,
    pub paths: SharedPathStore,
    pub cx: CompilerContext,
    pub opt: OptimizationConfig,
    /// Output-change signals pending consumption.
    pub signals: Vec<OutputSignal>,
    pub foreign: HashMap<Arc<str>, ForeignFunction>,
    pub defuns: Vec<DefunInfo>,
}

impl Compiler {
    pub fn new(paths: SharedPathStore, opt: OptimizationConfig, max_export_reentry: u32) -> Self {
        let root = paths.borrow().get_root_path_id();
        Compiler {
            exprs: ExpressionStore::new(),
            templates: TemplateTree::new(root),
            pool: FunctionNodePool::new(),
            paths,
            cx: CompilerContext::new(max_export_reentry),
            opt,
            signals: Vec::new(),
            foreign: HashMap::new(),
            defuns: Vec::new(),
        }
    }

    pub fn register_foreign(&mut self, name: &str, pure: bool, eval: Option<fn(&[Value]) -> Value>) {
        self.foreign
            .insert(Arc::from(name), ForeignFunction { pure, eval });
    }

    /// Allocate (or find) the export id of a canonical path.
    pub fn register_export(&mut self, path: PathId) -> ExportId {
        if let Some(&id) = self.cx.path_to_export.get(&path) {
            return id;
        }
        let id = ExportId(self.cx.next_export_id);
        self.cx.next_export_id += 1;
        self.cx.export_paths.insert(id, path);
        self.cx.path_to_export.insert(path, id);
        id
    }

    /// Mark every cached node of a template as outdated so the next build
    /// recompiles it.
    pub fn invalidate_template(&mut self, template: TemplateId) {
        for entry in self.templates.get_mut(template).expression_cache.values_mut() {
            entry.outdated = true;
        }
    }

    pub fn drain_signals(&mut self) -> Vec<OutputSignal> {
        std::mem::take(&mut self.signals)
    }

    /// Whether `node` is a stub of the current cycle that has not been
    /// resolved yet.
    pub fn is_unresolved_current_stub(&self, node: FnId) -> bool {
        matches!(
            self.pool.get(node).kind,
            FunctionNodeKind::Stub {
                resolution: None,
                stub_cycle,
            } if stub_cycle == self.cx.stub_cycle
        )
    }

    /// Locality join over a set of nodes; incomparable templates fall back
    /// to `base` with a warning.
    pub fn join_localities(
        &mut self,
        nodes: impl Iterator<Item = FnId>,
        base: Option<TemplateId>,
    ) -> Option<TemplateId> {
        let mut acc: Option<TemplateId> = None;
        for id in nodes {
            let node_area = self.pool.get(id).local_to_area;
            match self.templates.deeper_template(acc, node_area) {
                Ok(joined) => acc = joined,
                Err((a, b)) => {
                    self.cx
                        .warnings
                        .warn(&format!("incomparable localities {a:?} and {b:?}"));
                    return base;
                }
            }
        }
        match self.templates.deeper_template(acc, base) {
            Ok(joined) => joined,
            Err(_) => base,
        }
    }

    // ------------------------------------------------------------------
    // Entry point
    // ------------------------------------------------------------------

    /// Compile `expr` in `origin` under `defun`, using the template cache
    /// when the request comes from the template itself (or is defun-free).
    ///
    /// A cache miss inserts a stub carrying the previous node's value type,
    /// recurses, resolves the stub, and emits a `valueTypeChange` signal if
    /// the previous inferred type stopped subsuming the new one.
    pub fn build_simple_function_node(
        &mut self,
        expr: ExprId,
        writability: Option<WritabilitySpec>,
        origin: TemplateId,
        defun: DefunId,
        suppress_set: bool,
        known_true: &[QualifierGroup],
        known_false: &[QualifierGroup],
        orig_expr: Option<ExprId>,
        context: TemplateId,
    ) -> FnId {
        let cycle = self.cx.stub_cycle;
        let cacheable = context == origin || defun.is_none();
        let cache_key = (defun, expr);

        let mut prev_type: Option<ValueType> = None;
        if cacheable {
            if let Some(entry) = self
                .templates
                .get(origin)
                .expression_cache
                .get(&cache_key)
                .cloned()
            {
                if entry.outdated {
                    prev_type = Some(self.pool.get(entry.node).value_type.clone());
                } else {
                    if self.is_unresolved_current_stub(entry.node) {
                        self.cx.warnings.warn(&format!(
                            "possible cycle at expression {} in template {}",
                            expr.0, origin.0
                        ));
                    }
                    return self.finish_build(
                        entry.node,
                        writability,
                        origin,
                        suppress_set,
                        orig_expr,
                    );
                }
            }
        }

        let stub = self.pool.add_stub(
            prev_type.clone().unwrap_or_else(ValueType::unknown),
            cycle,
        );
        if cacheable {
            self.templates.get_mut(origin).expression_cache.insert(
                cache_key,
                crate::template::CacheEntry {
                    node: stub,
                    stub_cycle: cycle,
                    outdated: false,
                },
            );
        }

        let built = self.build_expression(expr, origin, defun, known_true, known_false);
        self.pool.resolve_stub(stub, built);
        if cacheable {
            self.templates.get_mut(origin).expression_cache.insert(
                cache_key,
                crate::template::CacheEntry {
                    node: built,
                    stub_cycle: cycle,
                    outdated: false,
                },
            );
            if !self.templates.get(origin).function_nodes.contains(&built) {
                self.templates.get_mut(origin).function_nodes.push(built);
            }
        }
        if let Some(prev) = &prev_type {
            self.check_type_change(built, prev);
        }

        let mut result = built;
        if self.opt.qualifier_simplification
            && (!known_true.is_empty() || !known_false.is_empty())
        {
            result = qualifiers::pick_qualified_expression(
                self,
                result,
                known_true,
                known_false,
                origin,
                cycle,
            );
        }
        self.finish_build(result, writability, origin, suppress_set, orig_expr)
    }

    fn finish_build(
        &mut self,
        node: FnId,
        writability: Option<WritabilitySpec>,
        origin: TemplateId,
        suppress_set: bool,
        orig_expr: Option<ExprId>,
    ) -> FnId {
        let cycle = self.cx.stub_cycle;
        let mut id = node;
        if let Some(w) = writability {
            let write_type = self.pool.get(id).value_type.clone();
            let source = orig_expr.unwrap_or(ExprId(0));
            id = self
                .pool
                .build_writable(Some(origin), w.path, w.initial, source, &write_type, cycle);
        }
        if let Some(orig) = orig_expr {
            let n = self.pool.get_mut(id);
            if n.orig_expr.is_none() {
                n.orig_expr = Some(orig);
            }
        }
        if suppress_set {
            if let FunctionNodeKind::Const {
                suppress_set: flag, ..
            } = &mut self.pool.get_mut(id).kind
            {
                *flag = true;
            }
        }
        id
    }

    /// Emit output-change signals when an inferred type no longer subsumes
    /// the recompiled one, and when the area yield changed.
    pub fn check_type_change(&mut self, node: FnId, prev: &ValueType) {
        let new = self.pool.get(node).value_type.clone();
        if !prev.subsumes(&new) {
            self.signals.push(OutputSignal::ValueTypeChange {
                node,
                orig: prev.clone(),
                new: new.clone(),
            });
        }
        let prev_areas = area_yield(prev);
        let new_areas = area_yield(&new);
        if prev_areas != new_areas {
            self.signals.push(OutputSignal::NrOutputAreas {
                node,
                from: prev_areas,
                to: new_areas,
            });
        }
    }

    // ------------------------------------------------------------------
    // Expression dispatch
    // ------------------------------------------------------------------

    fn build_expression(
        &mut self,
        expr: ExprId,
        origin: TemplateId,
        defun: DefunId,
        known_true: &[QualifierGroup],
        known_false: &[QualifierGroup],
    ) -> FnId {
        let cycle = self.cx.stub_cycle;
        let kind = self.exprs.get(expr).clone();
        match kind {
            ExprKind::Number(n) => self.pool.const_node(Value::Number(n.0), true, cycle),
            ExprKind::Boolean(b) => self.pool.const_node(Value::Bool(b), true, cycle),
            ExprKind::Null | ExprKind::Undefined => self.pool.empty_os_node(cycle),
            ExprKind::Projector => self.pool.const_node(Value::Projector, true, cycle),
            ExprKind::String(s) => match defun::lookup_parameter(self, &s) {
                Some(ParamBinding::Bound(node)) => node,
                Some(ParamBinding::Param(d, index)) => self.pool.add(FunctionNode {
                    kind: FunctionNodeKind::VariableRef { defun: d, param: index },
                    local_to_area: Some(origin),
                    local_to_defun: d,
                    value_type: ValueType::unknown(),
                    orig_expr: Some(expr),
                    cycle,
                }),
                None => self.pool.const_node(Value::String(s), true, cycle),
            },
            ExprKind::Range {
                low,
                high,
                low_open,
                high_open,
            } => self.build_range(low, high, low_open, high_open, origin, defun),
            ExprKind::AttributeValue(attrs) => {
                self.build_av(&attrs, origin, defun, known_true, known_false, expr)
            }
            ExprKind::OrderedSet(items) => {
                self.build_ordered_set(&items, origin, defun, known_true, known_false)
            }
            ExprKind::Query { query, data } => {
                self.build_query(query, data, origin, defun, known_true, known_false)
            }
            ExprKind::FunctionApplication { function, args } => {
                self.build_application(function, &args, origin, defun, known_true, known_false)
            }
            ExprKind::ForeignApplication { name, args } => {
                self.build_foreign(&name, &args, origin, defun, known_true, known_false)
            }
            ExprKind::Negation(_) => {
                self.cx
                    .warnings
                    .warn("negation is only meaningful inside a query");
                self.pool.empty_os_node(cycle)
            }
            ExprKind::BuiltInFunction(_) => {
                self.cx
                    .warnings
                    .warn("builtin function used outside an application");
                self.pool.empty_os_node(cycle)
            }
        }
    }

    fn build_range(
        &mut self,
        low: ExprId,
        high: ExprId,
        low_open: bool,
        high_open: bool,
        origin: TemplateId,
        defun: DefunId,
    ) -> FnId {
        let cycle = self.cx.stub_cycle;
        let low_node = self.build_simple_function_node(
            low, None, origin, defun, false, &[], &[], Some(low), origin,
        );
        let high_node = self.build_simple_function_node(
            high, None, origin, defun, false, &[], &[], Some(high), origin,
        );
        match (
            self.pool.const_value(low_node).cloned(),
            self.pool.const_value(high_node).cloned(),
        ) {
            (Some(lo), Some(hi)) => self.pool.const_node(
                Value::Range(RangeValue {
                    low: Box::new(lo),
                    high: Box::new(hi),
                    low_open,
                    high_open,
                }),
                true,
                cycle,
            ),
            _ => {
                self.cx.warnings.warn("range endpoints must be constants");
                self.pool.empty_os_node(cycle)
            }
        }
    }

    fn build_av(
        &mut self,
        attrs: &BTreeMap<String, ExprId>,
        origin: TemplateId,
        defun: DefunId,
        known_true: &[QualifierGroup],
        known_false: &[QualifierGroup],
        orig: ExprId,
    ) -> FnId {
        let cycle = self.cx.stub_cycle;
        let mut compiled = BTreeMap::new();
        let mut value_type = ValueType {
            sizes: SizeRanges::exact(1),
            ..Default::default()
        };
        let mut all_const = true;
        for (attr, &sub) in attrs {
            let node = self.build_simple_function_node(
                sub,
                None,
                origin,
                defun,
                true,
                known_true,
                known_false,
                Some(sub),
                origin,
            );
            value_type.add_attribute(attr, self.pool.get(node).value_type.clone());
            all_const = all_const && self.pool.const_value(node).is_some();
            compiled.insert(attr.clone(), node);
        }
        if all_const && self.opt.constant_folding {
            let record: BTreeMap<String, Value> = compiled
                .iter()
                .filter_map(|(k, &v)| self.pool.const_value(v).map(|c| (k.clone(), c.clone())))
                .collect();
            return self.pool.const_node(Value::Record(record), true, cycle);
        }
        let local_to_area = self.join_localities(compiled.values().copied(), None);
        self.pool.add(FunctionNode {
            kind: FunctionNodeKind::Av {
                attrs: compiled,
                suppress_set: false,
            },
            local_to_area,
            local_to_defun: defun,
            value_type,
            orig_expr: Some(orig),
            cycle,
        })
    }

    fn build_ordered_set(
        &mut self,
        items: &[ExprId],
        origin: TemplateId,
        defun: DefunId,
        known_true: &[QualifierGroup],
        known_false: &[QualifierGroup],
    ) -> FnId {
        let cycle = self.cx.stub_cycle;
        let nodes: Vec<FnId> = items
            .iter()
            .map(|&item| {
                self.build_simple_function_node(
                    item,
                    None,
                    origin,
                    defun,
                    false,
                    known_true,
                    known_false,
                    Some(item),
                    origin,
                )
            })
            .collect();

        let types: Vec<ValueType> = nodes
            .iter()
            .map(|&n| self.pool.get(n).value_type.clone())
            .collect();
        let has_areas = types.iter().any(ValueType::is_strictly_areas);
        let has_data = types.iter().any(|t| !t.is_not_data());
        if has_areas && has_data {
            self.cx
                .warnings
                .warn("ordered set mixes data and areas; result type is best-effort");
        }

        if self.opt.constant_folding {
            let consts: Option<Vec<Value>> = nodes
                .iter()
                .map(|&n| self.pool.const_value(n).cloned())
                .collect();
            if let Some(values) = consts {
                return self.pool.const_node(Value::os(values), true, cycle);
            }
        }

        let mut value_type = types
            .iter()
            .cloned()
            .reduce(|a, b| a.merge(&b))
            .unwrap_or_else(ValueType::undefined);
        value_type.sizes = types
            .iter()
            .map(|t| t.sizes.clone())
            .reduce(|a, b| a.sum(&b))
            .unwrap_or_else(|| SizeRanges::exact(0));
        let local_to_area = self.join_localities(nodes.iter().copied(), None);
        self.pool.add(FunctionNode {
            kind: FunctionNodeKind::OrderedSet { items: nodes },
            local_to_area,
            local_to_defun: defun,
            value_type,
            orig_expr: None,
            cycle,
        })
    }

    fn build_query(
        &mut self,
        query: ExprId,
        data: ExprId,
        origin: TemplateId,
        defun: DefunId,
        known_true: &[QualifierGroup],
        known_false: &[QualifierGroup],
    ) -> FnId {
        let cycle = self.cx.stub_cycle;
        let data_node = self.build_simple_function_node(
            data,
            None,
            origin,
            defun,
            false,
            known_true,
            known_false,
            Some(data),
            origin,
        );
        let data_type = self.pool.get(data_node).value_type.clone();

        if self.opt.area_query_rewrites {
            if data_type.is_strictly_areas() {
                return area_query::build_area_query(self, query, data_node, origin, defun);
            }
            // Class membership: a class name queried against the classes
            // of an area.
            let resolved = self.pool.deref_stub(data_node);
            if matches!(
                self.pool.get(resolved).kind,
                FunctionNodeKind::ClassOfArea { .. }
            ) {
                let (path, terminal, _) = self.exprs.extract_query_path(query);
                if path.is_empty() {
                    if let Some(node) =
                        area_query::try_class_membership_gate(self, terminal, resolved, defun)
                    {
                        return node;
                    }
                }
            }
        }

        let query_node = self.build_simple_function_node(
            query,
            None,
            origin,
            defun,
            false,
            known_true,
            known_false,
            Some(query),
            origin,
        );

        if self.opt.constant_folding {
            if let (Some(q), Some(d)) = (
                self.pool.const_value(query_node).cloned(),
                self.pool.const_value(data_node).cloned(),
            ) {
                let folded = fold::query_apply_value(&q, &d);
                return self.pool.const_node(folded, true, cycle);
            }
        }

        let query_type = &self.pool.get(query_node).value_type;
        let value_type = query_type.apply_query(&data_type);
        if value_type.any_data && !data_type.any_data {
            self.cx.warnings.warn("query value type undetermined");
        }
        let local_to_area = self.join_localities([query_node, data_node].into_iter(), None);
        self.pool.add(FunctionNode {
            kind: FunctionNodeKind::Apply {
                function: BuiltinFunction::ExecuteCompiledQuery,
                args: vec![query_node, data_node],
            },
            local_to_area,
            local_to_defun: defun,
            value_type,
            orig_expr: None,
            cycle,
        })
    }

    fn build_application(
        &mut self,
        function: ExprId,
        args: &[ExprId],
        origin: TemplateId,
        defun: DefunId,
        known_true: &[QualifierGroup],
        known_false: &[QualifierGroup],
    ) -> FnId {
        let cycle = self.cx.stub_cycle;
        if let ExprKind::BuiltInFunction(b) = self.exprs.get(function) {
            let b = *b;
            return self.build_builtin_application(
                b,
                args,
                origin,
                defun,
                known_true,
                known_false,
            );
        }
        // The function position is itself an expression; a defun value
        // applies, anything else is unknown.
        let fn_node = self.build_simple_function_node(
            function,
            None,
            origin,
            defun,
            false,
            known_true,
            known_false,
            Some(function),
            origin,
        );
        let resolved = self.pool.deref_stub(fn_node);
        if matches!(
            self.pool.get(resolved).kind,
            FunctionNodeKind::Defun { .. }
        ) || matches!(self.pool.const_value(resolved), Some(Value::Defun(_)))
        {
            return defun::apply_defun(self, resolved, args, origin, defun);
        }
        self.cx
            .warnings
            .warn("application of a non-function value");
        self.pool.empty_os_node(cycle)
    }

    fn build_builtin_application(
        &mut self,
        builtin: BuiltinFunction,
        args: &[ExprId],
        origin: TemplateId,
        defun: DefunId,
        known_true: &[QualifierGroup],
        known_false: &[QualifierGroup],
    ) -> FnId {
        use BuiltinFunction::*;
        let cycle = self.cx.stub_cycle;
        if matches!(builtin, Me | Embedding | AreaOfClass | ClassOfArea) {
            return area_query::build_area_builtin(self, builtin, args, origin, defun);
        }

        let arg_nodes: Vec<FnId> = args
            .iter()
            .map(|&a| {
                self.build_simple_function_node(
                    a,
                    None,
                    origin,
                    defun,
                    false,
                    known_true,
                    known_false,
                    Some(a),
                    origin,
                )
            })
            .collect();
        self.make_builtin_node(builtin, arg_nodes, origin, defun, cycle)
    }

    /// Fold / strip / build an application over already-compiled arguments.
    pub(crate) fn make_builtin_node(
        &mut self,
        builtin: BuiltinFunction,
        arg_nodes: Vec<FnId>,
        _origin: TemplateId,
        defun: DefunId,
        cycle: u32,
    ) -> FnId {
        if self.opt.constant_folding {
            let consts: Option<Vec<Value>> = arg_nodes
                .iter()
                .map(|&n| self.pool.const_value(n).cloned())
                .collect();
            if let Some(values) = consts {
                if let Some(folded) = fold::check_constant_result(builtin, &values) {
                    return self.pool.const_node(folded, true, cycle);
                }
            }
        }

        let (builtin, arg_nodes) =
            match fold::remove_redundant_arguments(builtin, &arg_nodes, &mut self.pool, cycle) {
                fold::Rewrite::Keep => (builtin, arg_nodes),
                fold::Rewrite::Replace(id) => return id,
                fold::Rewrite::Call(f, new_args) => (f, new_args),
            };

        let types: Vec<&ValueType> = arg_nodes
            .iter()
            .map(|&n| &self.pool.get(n).value_type)
            .collect();
        let value_type = fold::infer_apply_type(builtin, &types);
        let local_to_area = self.join_localities(arg_nodes.iter().copied(), None);
        self.pool.add(FunctionNode {
            kind: FunctionNodeKind::Apply {
                function: builtin,
                args: arg_nodes,
            },
            local_to_area,
            local_to_defun: defun,
            value_type,
            orig_expr: None,
            cycle,
        })
    }

    fn build_foreign(
        &mut self,
        name: &Arc<str>,
        args: &[ExprId],
        origin: TemplateId,
        defun: DefunId,
        known_true: &[QualifierGroup],
        known_false: &[QualifierGroup],
    ) -> FnId {
        let cycle = self.cx.stub_cycle;
        let arg_nodes: Vec<FnId> = args
            .iter()
            .map(|&a| {
                self.build_simple_function_node(
                    a,
                    None,
                    origin,
                    defun,
                    false,
                    known_true,
                    known_false,
                    Some(a),
                    origin,
                )
            })
            .collect();
        let info = self.foreign.get(name).cloned();
        let pure = info.as_ref().is_some_and(|f| f.pure);
        if pure && self.opt.constant_folding {
            let consts: Option<Vec<Value>> = arg_nodes
                .iter()
                .map(|&n| self.pool.const_value(n).cloned())
                .collect();
            if let (Some(values), Some(eval)) = (consts, info.and_then(|f| f.eval)) {
                return self.pool.const_node(eval(&values), true, cycle);
            }
        }
        let local_to_area = self.join_localities(arg_nodes.iter().copied(), None);
        self.pool.add(FunctionNode {
            kind: FunctionNodeKind::ForeignApply {
                name: name.clone(),
                pure,
                args: arg_nodes,
            },
            local_to_area,
            local_to_defun: defun,
            value_type: ValueType::any_data(),
            orig_expr: None,
            cycle,
        })
    }

    // ------------------------------------------------------------------
    // Merge nodes
    // ------------------------------------------------------------------

    /// Build the node for a context path that has several qualified,
    /// prioritised definitions (possibly at deeper attribute paths).
    ///
    /// Alternatives are compiled high-priority first; each is wrapped in the
    /// AV structure describing its attribute path beyond the node; adjacent
    /// alternatives with identical qualifier groups and compatible
    /// mergeability fuse into one merge application. Writables at the same
    /// path collapse into the canonical writable through the registry.
    pub fn build_merge_node(
        &mut self,
        mut infos: Vec<PathInfo>,
        origin: TemplateId,
        defun: DefunId,
    ) -> FnId {
        let cycle = self.cx.stub_cycle;
        infos.sort_by_key(|i| std::cmp::Reverse(i.priority));

        let mut values: Vec<QualifiedValue> = Vec::new();
        let mut known_false: Vec<QualifierGroup> = Vec::new();
        for info in &infos {
            let qualifier = qualifiers::build_qualifier(self, &info.qualifier, origin);
            if matches!(qualifier, CompiledQualifier::AlwaysFalse) {
                self.cx.warnings.warn("conflicting qualifier dropped");
                continue;
            }
            let mut node = self.build_simple_function_node(
                info.expr,
                info.writable.clone(),
                origin,
                defun,
                false,
                &[],
                &known_false,
                Some(info.expr),
                origin,
            );
            node = self.wrap_attr_path(node, &info.attr_path, defun, cycle);
            if let CompiledQualifier::Group(g) | CompiledQualifier::CycleEncoded { group: g, .. } =
                &qualifier
            {
                if !qualifiers::is_mergeable(self, node) {
                    known_false.push(g.clone());
                }
            }
            values.push(QualifiedValue {
                qualifier,
                node,
                expr: info.expr,
            });
        }

        // Fuse adjacent alternatives with identical groups into one merge.
        let mut fused: Vec<QualifiedValue> = Vec::new();
        for value in values {
            if let Some(prev) = fused.last() {
                let same = match (&prev.qualifier, &value.qualifier) {
                    (CompiledQualifier::AlwaysTrue, CompiledQualifier::AlwaysTrue) => true,
                    (CompiledQualifier::Group(a), CompiledQualifier::Group(b)) => {
                        crate::fnode::same_group(a, b)
                    }
                    _ => false,
                };
                if same
                    && prev.expr != value.expr
                    && qualifiers::is_mergeable(self, prev.node)
                    && qualifiers::is_mergeable(self, value.node)
                {
                    let prev = fused.pop().map(|p| p.node);
                    let merged = self.make_builtin_node(
                        BuiltinFunction::Merge,
                        prev.into_iter().chain([value.node]).collect(),
                        origin,
                        defun,
                        cycle,
                    );
                    let qualifier = value.qualifier.clone();
                    let expr = value.expr;
                    fused.push(QualifiedValue {
                        qualifier,
                        node: merged,
                        expr,
                    });
                    continue;
                }
            }
            fused.push(value);
        }

        qualifiers::build_qualifier_node(self, fused, origin, defun, cycle)
    }

    fn wrap_attr_path(
        &mut self,
        node: FnId,
        attr_path: &[String],
        defun: DefunId,
        cycle: u32,
    ) -> FnId {
        let mut id = node;
        for attr in attr_path.iter().rev() {
            let mut value_type = ValueType {
                sizes: SizeRanges::exact(1),
                ..Default::default()
            };
            value_type.add_attribute(attr, self.pool.get(id).value_type.clone());
            let local_to_area = self.pool.get(id).local_to_area;
            let mut attrs = BTreeMap::new();
            attrs.insert(attr.clone(), id);
            id = self.pool.add(FunctionNode {
                kind: FunctionNodeKind::Av {
                    attrs,
                    suppress_set: true,
                },
                local_to_area,
                local_to_defun: defun,
                value_type,
                orig_expr: None,
                cycle,
            });
        }
        id
    }

    /// Compile a class membership definition onto a template.
    pub fn define_class(&mut self, template: TemplateId, class: &str, expr: ExprId) -> FnId {
        let node = self.build_simple_function_node(
            expr,
            None,
            template,
            DefunId::NONE,
            false,
            &[],
            &[],
            Some(expr),
            template,
        );
        self.templates
            .get_mut(template)
            .classes
            .insert(class.to_string(), node);
        node
    }
}

/// Total area yield of a type: sum of per-template maximum counts.
fn area_yield(t: &ValueType) -> u32 {
    t.areas.as_ref().map_or(0, |areas| {
        areas
            .values()
            .fold(0u32, |acc, s| acc.saturating_add(s.max()))
    })
}
