//! Defuns
//!
//! A defun captures a function body with free parameter names from a
//! surrounding area. The body is not compiled at definition time: applying
//! the defun to constant arguments substitutes the argument expressions into
//! the body and compiles the result (so the cache keys on the substituted
//! expression), while application to non-constant arguments compiles the
//! body once under the defun's own context with open parameter references
//! and wraps it in a closure node.

use super::{Compiler, DefunInfo, ParamBinding, ParamFrame};
use crate::expression::{ExprId, ExprKind};
use crate::fnode::{DefunId, FnId, FunctionNode, FunctionNodeKind};
use crate::template::TemplateId;
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Resolve a name against the parameter stack, innermost frame first.
pub fn lookup_parameter(compiler: &Compiler, name: &Arc<str>) -> Option<ParamBinding> {
    compiler
        .cx
        .parameter_stack
        .iter()
        .rev()
        .find_map(|frame| frame.get(name).copied())
}

/// Register a defun; the returned node is the defun value itself.
pub fn define_defun(
    compiler: &mut Compiler,
    params: &[&str],
    body: ExprId,
    origin: TemplateId,
) -> FnId {
    let id = DefunId(compiler.defuns.len() as u32 + 1);
    compiler.defuns.push(DefunInfo {
        id,
        params: params.iter().map(|p| Arc::from(*p)).collect(),
        body,
        origin,
    });
    let cycle = compiler.cx.stub_cycle;
    compiler.pool.const_node(Value::Defun(id), true, cycle)
}

fn defun_id_of(compiler: &Compiler, node: FnId) -> Option<DefunId> {
    match &compiler.pool.get(node).kind {
        FunctionNodeKind::Defun { defun, .. } => Some(*defun),
        _ => match compiler.pool.const_value(node) {
            Some(Value::Defun(id)) => Some(*id),
            _ => None,
        },
    }
}

/// Apply a defun-valued node to argument expressions.
pub fn apply_defun(
    compiler: &mut Compiler,
    fn_node: FnId,
    args: &[ExprId],
    origin: TemplateId,
    defun_ctx: DefunId,
) -> FnId {
    let cycle = compiler.cx.stub_cycle;
    let Some(defun_id) = defun_id_of(compiler, fn_node) else {
        compiler.cx.warnings.warn("application of a non-function value");
        return compiler.pool.empty_os_node(cycle);
    };
    let info = match defun_id
        .0
        .checked_sub(1)
        .and_then(|i| compiler.defuns.get(i as usize))
    {
        Some(info) => info.clone(),
        None => {
            compiler.cx.warnings.warn("application of an unknown defun");
            return compiler.pool.empty_os_node(cycle);
        }
    };
    if args.len() != info.params.len() {
        compiler.cx.warnings.warn(&format!(
            "defun expects {} arguments, got {}",
            info.params.len(),
            args.len()
        ));
        return compiler.pool.empty_os_node(cycle);
    }

    let all_const = args.iter().all(|&a| is_constant_expr(compiler, a));
    if all_const {
        // Substitute argument expressions into the body; the substituted
        // expression compiles (and caches) like any other.
        let map: HashMap<Arc<str>, ExprId> = info
            .params
            .iter()
            .cloned()
            .zip(args.iter().copied())
            .collect();
        let substituted = substitute(compiler, info.body, &map);
        return compiler.build_simple_function_node(
            substituted,
            None,
            origin,
            defun_ctx,
            false,
            &[],
            &[],
            Some(substituted),
            origin,
        );
    }

    // Closure application: compile arguments in the caller's context and
    // the body once under the defun's own context.
    let arg_nodes: Vec<FnId> = args
        .iter()
        .map(|&a| {
            compiler.build_simple_function_node(
                a,
                None,
                origin,
                defun_ctx,
                false,
                &[],
                &[],
                Some(a),
                origin,
            )
        })
        .collect();

    let frame: ParamFrame = info
        .params
        .iter()
        .enumerate()
        .map(|(i, name)| (name.clone(), ParamBinding::Param(info.id, i as u32)))
        .collect();
    compiler.cx.parameter_stack.push(frame);
    let body_node = compiler.build_simple_function_node(
        info.body,
        None,
        info.origin,
        info.id,
        false,
        &[],
        &[],
        Some(info.body),
        info.origin,
    );
    compiler.cx.parameter_stack.pop();

    let value_type = compiler.pool.get(body_node).value_type.clone();
    let local_to_area =
        compiler.join_localities(arg_nodes.iter().copied().chain([body_node]), Some(origin));
    compiler.pool.add(FunctionNode {
        kind: FunctionNodeKind::DefunNode {
            defun: info.id,
            body: body_node,
            args: arg_nodes,
        },
        local_to_area,
        local_to_defun: defun_ctx,
        value_type,
        orig_expr: None,
        cycle,
    })
}

/// Whether an expression is constant without compiling it: literals, and
/// composites of constants.
fn is_constant_expr(compiler: &Compiler, expr: ExprId) -> bool {
    match compiler.exprs.get(expr) {
        ExprKind::Number(_)
        | ExprKind::String(_)
        | ExprKind::Boolean(_)
        | ExprKind::Null
        | ExprKind::Undefined
        | ExprKind::Projector => true,
        ExprKind::OrderedSet(items) => items.iter().all(|&i| is_constant_expr(compiler, i)),
        ExprKind::AttributeValue(attrs) => {
            attrs.values().all(|&v| is_constant_expr(compiler, v))
        }
        ExprKind::Range { low, high, .. } => {
            is_constant_expr(compiler, *low) && is_constant_expr(compiler, *high)
        }
        _ => false,
    }
}

/// Rebuild `expr` with parameter-name strings replaced by the bound
/// argument expressions.
fn substitute(compiler: &mut Compiler, expr: ExprId, map: &HashMap<Arc<str>, ExprId>) -> ExprId {
    let kind = compiler.exprs.get(expr).clone();
    match kind {
        ExprKind::String(s) => map.get(&s).copied().unwrap_or(expr),
        ExprKind::AttributeValue(attrs) => {
            let rebuilt = attrs
                .into_iter()
                .map(|(k, v)| (k, substitute(compiler, v, map)))
                .collect();
            compiler.exprs.store(ExprKind::AttributeValue(rebuilt))
        }
        ExprKind::OrderedSet(items) => {
            let rebuilt = items
                .into_iter()
                .map(|i| substitute(compiler, i, map))
                .collect();
            compiler.exprs.store(ExprKind::OrderedSet(rebuilt))
        }
        ExprKind::Negation(items) => {
            let rebuilt = items
                .into_iter()
                .map(|i| substitute(compiler, i, map))
                .collect();
            compiler.exprs.store(ExprKind::Negation(rebuilt))
        }
        ExprKind::Query { query, data } => {
            let query = substitute(compiler, query, map);
            let data = substitute(compiler, data, map);
            compiler.exprs.store(ExprKind::Query { query, data })
        }
        ExprKind::FunctionApplication { function, args } => {
            let function = substitute(compiler, function, map);
            let args = args.into_iter().map(|a| substitute(compiler, a, map)).collect();
            compiler
                .exprs
                .store(ExprKind::FunctionApplication { function, args })
        }
        ExprKind::ForeignApplication { name, args } => {
            let args = args.into_iter().map(|a| substitute(compiler, a, map)).collect();
            compiler
                .exprs
                .store(ExprKind::ForeignApplication { name, args })
        }
        ExprKind::Range {
            low,
            high,
            low_open,
            high_open,
        } => {
            let low = substitute(compiler, low, map);
            let high = substitute(compiler, high, map);
            compiler.exprs.store(ExprKind::Range {
                low,
                high,
                low_open,
                high_open,
            })
        }
        // Literals have nothing to substitute.
        _ => expr,
    }
}
