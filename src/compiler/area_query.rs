//! Area-Query Optimisation
//!
//! Queries whose data is an area set compile through
//! `build_area_query -> build_area_selection -> build_area_projection`,
//! which try progressively cheaper encodings before falling back to a
//! generic area-selection node:
//!
//! - `{class: {C: _}}` over an area set becomes a direct projection of the
//!   class export;
//! - `{child: [me]}` with a determinable embedding level becomes a
//!   child-areas chain gated by the child's existence qualifier;
//! - `"C"` applied to `[classOfArea, [me]]` becomes a boolean gate over the
//!   class-membership node;
//! - multi-attribute queries over an AV decompose into independent
//!   sub-selections, and projections over an AV reduce to an attribute pick.
//!
//! Every rewrite preserves locality; a replacement whose `local_to_area` /
//! `local_to_defun` would not be compatible falls back to the unoptimised
//! form.

use super::{Compiler, WritabilitySpec};
use crate::expression::{ExprId, ExprKind};
use crate::fnode::{
    BuiltinFunction, DefunId, FnId, FunctionNode, FunctionNodeKind,
};
use crate::template::{TemplateId, CLASS_EXPORT};
use crate::value::{SizeRange, SizeRanges, Value, ValueType};
use std::collections::BTreeMap;

/// Compile the area builtins (`me`, `embedding`, `areaOfClass`,
/// `classOfArea`).
pub fn build_area_builtin(
    compiler: &mut Compiler,
    builtin: BuiltinFunction,
    args: &[ExprId],
    origin: TemplateId,
    defun: DefunId,
) -> FnId {
    let cycle = compiler.cx.stub_cycle;
    match builtin {
        BuiltinFunction::Me => {
            let value_type = ValueType::areas(origin, SizeRanges::exact(1));
            compiler.pool.add(FunctionNode {
                kind: FunctionNodeKind::Apply {
                    function: BuiltinFunction::Me,
                    args: Vec::new(),
                },
                local_to_area: Some(origin),
                local_to_defun: defun,
                value_type,
                orig_expr: None,
                cycle,
            })
        }
        BuiltinFunction::Embedding => match compiler.templates.get_embedding(origin) {
            Some(parent) => {
                let value_type = ValueType::areas(parent, SizeRanges::exact(1));
                compiler.pool.add(FunctionNode {
                    kind: FunctionNodeKind::Apply {
                        function: BuiltinFunction::Embedding,
                        args: Vec::new(),
                    },
                    local_to_area: Some(origin),
                    local_to_defun: defun,
                    value_type,
                    orig_expr: None,
                    cycle,
                })
            }
            None => {
                compiler
                    .cx
                    .warnings
                    .warn("embedding of the global template does not exist");
                compiler.pool.empty_os_node(cycle)
            }
        },
        BuiltinFunction::AreaOfClass => {
            let class = args.first().and_then(|&a| match compiler.exprs.get(a) {
                ExprKind::String(s) => Some(s.to_string()),
                _ => None,
            });
            let Some(class) = class else {
                compiler
                    .cx
                    .warnings
                    .warn("areaOfClass expects a constant class name");
                return compiler.pool.empty_os_node(cycle);
            };
            let members = compiler.templates.templates_with_class(&class);
            let mut areas = BTreeMap::new();
            for t in &members {
                areas.insert(*t, SizeRanges::new(vec![SizeRange::at_least(0)]));
            }
            let name_node = compiler.pool.const_node(Value::string(&class), true, cycle);
            compiler.pool.add(FunctionNode {
                kind: FunctionNodeKind::Apply {
                    function: BuiltinFunction::AreaOfClass,
                    args: vec![name_node],
                },
                local_to_area: None,
                local_to_defun: defun,
                value_type: ValueType {
                    areas: Some(areas),
                    sizes: SizeRanges::any(),
                    ..Default::default()
                },
                orig_expr: None,
                cycle,
            })
        }
        BuiltinFunction::ClassOfArea => {
            let data = args.first().map(|&a| {
                compiler.build_simple_function_node(
                    a, None, origin, defun, false, &[], &[], Some(a), origin,
                )
            });
            let Some(data) = data else {
                compiler.cx.warnings.warn("classOfArea expects an area argument");
                return compiler.pool.empty_os_node(cycle);
            };
            let local_to_area = compiler.pool.get(data).local_to_area;
            compiler.pool.add(FunctionNode {
                kind: FunctionNodeKind::ClassOfArea { data },
                local_to_area,
                local_to_defun: defun,
                value_type: ValueType::string().with_sizes(SizeRanges::any()),
                orig_expr: None,
                cycle,
            })
        }
        other => panic!("not an area builtin: {other:?}"),
    }
}

/// Entry point for `[query, data]` where `data` is strictly areas.
pub fn build_area_query(
    compiler: &mut Compiler,
    query: ExprId,
    data_node: FnId,
    origin: TemplateId,
    defun: DefunId,
) -> FnId {
    // Per-qualifier data: run the area query per alternative and merge the
    // results under the same qualifiers.
    if let FunctionNodeKind::Variant {
        qualifiers,
        alternatives,
    } = &compiler.pool.get(data_node).kind
    {
        let qualifiers = qualifiers.clone();
        let alternatives = alternatives.clone();
        return build_area_query_on_qualified_av(
            compiler,
            query,
            &qualifiers,
            &alternatives,
            origin,
            defun,
        );
    }

    let (path, terminal, is_projection) = compiler.exprs.extract_query_path(query);
    let path_attrs: Vec<String> = path.iter().map(|a| a.to_string()).collect();

    // `"C"` against `[classOfArea, [me]]`.
    if path_attrs.is_empty() {
        if let Some(node) = try_class_membership_gate(compiler, terminal, data_node, defun) {
            return node;
        }
    }

    // `{class: {C: _}}`: direct projection of the class export.
    if is_projection && path_attrs.len() == 2 && path_attrs[0] == "class" {
        if let Some(node) =
            try_class_export_projection(compiler, &path_attrs[1], data_node, defun)
        {
            return node;
        }
    }

    // `{child: [me]}` / `{child: [embedding]}` with a fixed level.
    if !is_projection && path_attrs.len() == 1 {
        if let Some(node) =
            try_child_areas_chain(compiler, &path_attrs[0], terminal, data_node, origin, defun)
        {
            return node;
        }
    }

    if is_projection {
        build_area_projection(compiler, &path_attrs, data_node, defun)
    } else {
        build_area_selection(compiler, &path_attrs, terminal, data_node, origin, defun)
    }
}

/// `["C", [classOfArea, [me]]]` -> boolean gate over the class-membership
/// node at the class's template.
pub(crate) fn try_class_membership_gate(
    compiler: &mut Compiler,
    terminal: ExprId,
    data_node: FnId,
    defun: DefunId,
) -> Option<FnId> {
    let cycle = compiler.cx.stub_cycle;
    let class = match compiler.exprs.get(terminal) {
        ExprKind::String(s) => s.to_string(),
        _ => return None,
    };
    let data = match &compiler.pool.get(data_node).kind {
        FunctionNodeKind::ClassOfArea { data } => *data,
        _ => return None,
    };
    let inner = compiler.pool.deref_stub(data);
    let FunctionNodeKind::Apply {
        function: BuiltinFunction::Me,
        ..
    } = &compiler.pool.get(inner).kind
    else {
        return None;
    };
    let me_template = compiler.pool.get(inner).local_to_area?;
    let membership = compiler
        .templates
        .get(me_template)
        .classes
        .get(&class)
        .copied()?;
    let value = compiler.pool.const_node(Value::string(&class), true, cycle);
    let value_type = compiler.pool.get(value).value_type.clone();
    Some(compiler.pool.add(FunctionNode {
        kind: FunctionNodeKind::BoolGate {
            condition: membership,
            value,
        },
        local_to_area: Some(me_template),
        local_to_defun: defun,
        value_type,
        orig_expr: None,
        cycle,
    }))
}

/// `{class: {C: _}}` over an area set -> direct projection of the class
/// export; no generic area-selection node is created.
fn try_class_export_projection(
    compiler: &mut Compiler,
    class: &str,
    data_node: FnId,
    defun: DefunId,
) -> Option<FnId> {
    let cycle = compiler.cx.stub_cycle;
    let areas = compiler.pool.get(data_node).value_type.areas.clone()?;
    let on_all = matches!(
        compiler.pool.get(data_node).kind,
        FunctionNodeKind::Apply {
            function: BuiltinFunction::AreaOfClass,
            ..
        }
    );
    // Every member template must carry the class, else the rewrite loses
    // the filtering the generic selection would perform.
    let members: Vec<TemplateId> = areas.keys().copied().collect();
    let mut value_type: Option<ValueType> = None;
    for t in &members {
        let node = compiler.templates.get(*t).classes.get(class).copied()?;
        let nt = compiler.pool.get(node).value_type.clone();
        value_type = Some(match value_type {
            Some(prev) => prev.merge(&nt),
            None => nt,
        });
    }
    let local_to_area = compiler.pool.get(data_node).local_to_area;

    let path = {
        let mut paths = compiler.paths.borrow_mut();
        let root = paths.get_root_path_id();
        let class_path = paths.allocate_path_id(root, "class");
        let p = paths.allocate_path_id(class_path, class);
        paths.release_path_id(class_path);
        p
    };
    let export = compiler.register_export(path);

    Some(compiler.pool.add(FunctionNode {
        kind: FunctionNodeKind::AreaProjection {
            export,
            path,
            data: data_node,
            on_all_areas_of_class: on_all,
        },
        local_to_area,
        local_to_defun: defun,
        value_type: value_type.unwrap_or_else(ValueType::any_data),
        orig_expr: None,
        cycle,
    }))
}

/// `{child: [me]}`: the child areas named `child` of the queried area,
/// gated by the child template's existence qualifier when it has one.
fn try_child_areas_chain(
    compiler: &mut Compiler,
    child_name: &str,
    terminal: ExprId,
    data_node: FnId,
    origin: TemplateId,
    defun: DefunId,
) -> Option<FnId> {
    let cycle = compiler.cx.stub_cycle;
    // The selection value must be [me] or [embedding] with a fixed level.
    let me_like = match compiler.exprs.get(terminal) {
        ExprKind::FunctionApplication { function, .. } => matches!(
            compiler.exprs.get(*function),
            ExprKind::BuiltInFunction(BuiltinFunction::Me | BuiltinFunction::Embedding)
        ),
        _ => false,
    };
    if !me_like {
        return None;
    }
    let data_template = compiler.pool.get(data_node).local_to_area.unwrap_or(origin);
    let child_template = compiler
        .templates
        .get(data_template)
        .children
        .get(child_name)
        .copied()?;
    // The rewrite must not widen locality.
    compiler
        .templates
        .get_level_difference(data_template, child_template)?;

    let value_type = ValueType::areas(child_template, SizeRanges::new(vec![SizeRange::at_least(0)]));
    let chain = compiler.pool.add(FunctionNode {
        kind: FunctionNodeKind::ChildAreas {
            name: child_name.to_string(),
            data: data_node,
        },
        local_to_area: Some(data_template),
        local_to_defun: defun,
        value_type: value_type.clone(),
        orig_expr: None,
        cycle,
    });

    let existence = compiler
        .templates
        .get(child_template)
        .existence_qualifier
        .clone();
    let Some((attr, wanted)) = existence else {
        return Some(chain);
    };
    let attr_expr = compiler
        .templates
        .get(child_template)
        .context_attrs
        .get(&attr)
        .copied();
    let Some(attr_expr) = attr_expr else {
        return Some(chain);
    };
    let attr_node = compiler.build_simple_function_node(
        attr_expr,
        None,
        child_template,
        DefunId::NONE,
        false,
        &[],
        &[],
        Some(attr_expr),
        child_template,
    );
    let wanted_node = compiler.pool.const_node(wanted, true, cycle);
    let condition = compiler.make_builtin_node(
        BuiltinFunction::Equal,
        vec![attr_node, wanted_node],
        child_template,
        defun,
        cycle,
    );
    Some(compiler.pool.add(FunctionNode {
        kind: FunctionNodeKind::BoolGate {
            condition,
            value: chain,
        },
        local_to_area: Some(child_template),
        local_to_defun: defun,
        value_type,
        orig_expr: None,
        cycle,
    }))
}

/// Generic area selection, after decomposing multi-attribute queries.
pub fn build_area_selection(
    compiler: &mut Compiler,
    path_attrs: &[String],
    terminal: ExprId,
    data_node: FnId,
    origin: TemplateId,
    defun: DefunId,
) -> FnId {
    let cycle = compiler.cx.stub_cycle;
    // Multi-attribute selections on an AV decompose into independent
    // sub-selections, chained as nested gates over the same data.
    if path_attrs.is_empty() {
        if let ExprKind::AttributeValue(attrs) = compiler.exprs.get(terminal).clone() {
            if attrs.len() > 1 {
                let mut gated = data_node;
                for (attr, sub) in attrs {
                    let (sub_path, sub_terminal, _) = compiler.exprs.extract_query_path(sub);
                    let mut full = vec![attr];
                    full.extend(sub_path.iter().map(|a| a.to_string()));
                    gated = build_area_selection(
                        compiler,
                        &full,
                        sub_terminal,
                        gated,
                        origin,
                        defun,
                    );
                }
                return gated;
            }
        }
    }

    let selection = compiler.build_simple_function_node(
        terminal,
        None,
        origin,
        defun,
        false,
        &[],
        &[],
        Some(terminal),
        origin,
    );
    let data_type = compiler.pool.get(data_node).value_type.clone();
    let mut value_type = data_type;
    value_type.sizes = SizeRanges::new(vec![SizeRange::span(0, value_type.sizes.max())]);
    let local_to_area = compiler.pool.get(data_node).local_to_area;
    // A boolean terminal selects areas by truth of the attribute; it gets
    // the boolean-match encoding instead of a keyed selection.
    if matches!(compiler.exprs.get(terminal), ExprKind::Boolean(_)) {
        return compiler.pool.add(FunctionNode {
            kind: FunctionNodeKind::BoolMatch {
                query: terminal,
                selection,
                data: data_node,
            },
            local_to_area,
            local_to_defun: defun,
            value_type,
            orig_expr: None,
            cycle,
        });
    }
    let path = allocate_attr_path(compiler, path_attrs);
    compiler.pool.add(FunctionNode {
        kind: FunctionNodeKind::AreaSelection {
            path,
            selection,
            data: data_node,
        },
        local_to_area,
        local_to_defun: defun,
        value_type,
        orig_expr: None,
        cycle,
    })
}

/// Generic area projection through a registered export.
pub fn build_area_projection(
    compiler: &mut Compiler,
    path_attrs: &[String],
    data_node: FnId,
    defun: DefunId,
) -> FnId {
    let cycle = compiler.cx.stub_cycle;
    let path = allocate_attr_path(compiler, path_attrs);
    let export = if path_attrs.is_empty() {
        CLASS_EXPORT
    } else {
        compiler.register_export(path)
    };
    let on_all = matches!(
        compiler.pool.get(data_node).kind,
        FunctionNodeKind::Apply {
            function: BuiltinFunction::AreaOfClass,
            ..
        }
    );
    let local_to_area = compiler.pool.get(data_node).local_to_area;
    compiler.pool.add(FunctionNode {
        kind: FunctionNodeKind::AreaProjection {
            export,
            path,
            data: data_node,
            on_all_areas_of_class: on_all,
        },
        local_to_area,
        local_to_defun: defun,
        value_type: ValueType::any_data(),
        orig_expr: None,
        cycle,
    })
}

/// Per-qualifier area queries: the query runs against every alternative and
/// the results merge under the original qualifiers.
pub fn build_area_query_on_qualified_av(
    compiler: &mut Compiler,
    query: ExprId,
    qualifiers: &[crate::fnode::QualifierGroup],
    alternatives: &[FnId],
    origin: TemplateId,
    defun: DefunId,
) -> FnId {
    let cycle = compiler.cx.stub_cycle;
    let rewritten: Vec<FnId> = alternatives
        .iter()
        .map(|&alt| build_area_query(compiler, query, alt, origin, defun))
        .collect();
    super::qualifiers::finish_variant(
        compiler,
        qualifiers.to_vec(),
        rewritten,
        origin,
        defun,
        cycle,
    )
}

fn allocate_attr_path(compiler: &mut Compiler, attrs: &[String]) -> crate::path::PathId {
    let mut paths = compiler.paths.borrow_mut();
    let mut cur = paths.get_root_path_id();
    for (i, attr) in attrs.iter().enumerate() {
        let next = paths.allocate_path_id(cur, attr);
        if i > 0 {
            paths.release_path_id(cur);
        }
        cur = next;
    }
    cur
}

/// Compile a write target at an area path: the canonical writable for the
/// template/path pair.
pub fn build_writable_at(
    compiler: &mut Compiler,
    template: TemplateId,
    attrs: &[String],
    initial: Value,
    expr: ExprId,
) -> FnId {
    let path = allocate_attr_path(compiler, attrs);
    compiler.build_simple_function_node(
        expr,
        Some(WritabilitySpec { path, initial }),
        template,
        DefunId::NONE,
        false,
        &[],
        &[],
        Some(expr),
        template,
    )
}
