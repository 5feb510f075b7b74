//! Constant Folding & Redundant-Argument Removal
//!
//! Compile-time evaluation of builtin applications whose arguments are all
//! constants, and algebraic identity stripping (`x + 0`, `x * 1`,
//! `and` with an always-true operand, `logb` with a standard base).
//!
//! Folding is a refinement: for constant arguments the folded value equals
//! what runtime evaluation of the original application would produce.

use crate::fnode::{BuiltinFunction, FnId, FunctionNodePool, SingleQualifier};
use crate::value::{SizeRange, SizeRanges, Value, ValueType};
use std::collections::BTreeMap;

/// Result of a redundant-argument rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rewrite {
    /// Nothing to strip.
    Keep,
    /// The application collapses to an existing node.
    Replace(FnId),
    /// The application becomes a different (or narrower) call.
    Call(BuiltinFunction, Vec<FnId>),
}

// ---------------------------------------------------------------------------
// Constant folding
// ---------------------------------------------------------------------------

/// Evaluate a builtin over constant arguments. `None` when the builtin is
/// not foldable (side-effecting or area-dependent).
pub fn check_constant_result(f: BuiltinFunction, args: &[Value]) -> Option<Value> {
    use BuiltinFunction::*;
    match f {
        Plus => fold_binary(args, |a, b| a + b),
        Minus => fold_binary(args, |a, b| a - b),
        Mul => fold_binary(args, |a, b| a * b),
        Div => fold_binary(args, |a, b| a / b),
        Pow => fold_binary(args, f64::powf),
        Logb => fold_binary(args, |x, b| x.ln() / b.ln()),
        UMinus => fold_unary(args, |a| -a),
        Exp => fold_unary(args, f64::exp),
        Ln => fold_unary(args, f64::ln),
        Log10 => fold_unary(args, f64::log10),
        Log2 => fold_unary(args, f64::log2),
        First => args.first().map(Value::first),
        Last => args.first().map(Value::last),
        Bool => args.first().map(|a| Value::Bool(a.is_true())),
        Not => args.first().map(|a| Value::Bool(!a.is_true())),
        And => Some(Value::Bool(args.iter().all(Value::is_true))),
        Or => Some(Value::Bool(args.iter().any(Value::is_true))),
        Concat => Some(Value::os(args.to_vec())),
        ConcatStr => Some(fold_concat_str(args)),
        Equal => fold_equal(args).map(Value::Bool),
        NotEqual => fold_equal(args).map(|eq| Value::Bool(!eq)),
        Merge | MergeWrite => Some(fold_merge(args)),
        Sum => Some(fold_sum(args)),
        Pointer => Some(Value::os(args.to_vec())),
        ExecuteCompiledQuery => {
            if args.len() == 2 {
                Some(query_apply_value(&args[0], &args[1]))
            } else {
                None
            }
        }
        // Area builtins depend on runtime areas.
        Me | Embedding | AreaOfClass | ClassOfArea => None,
    }
}

fn numbers(v: &Value) -> Vec<f64> {
    v.items().filter_map(Value::as_number).collect()
}

fn fold_unary(args: &[Value], op: impl Fn(f64) -> f64) -> Option<Value> {
    let a = args.first()?;
    Some(Value::os(
        numbers(a).into_iter().map(|x| Value::Number(op(x))).collect(),
    ))
}

/// Binary numeric op with singleton broadcast: a scalar operand applies to
/// every element of the other side; two sets combine pairwise.
fn fold_binary(args: &[Value], op: impl Fn(f64, f64) -> f64) -> Option<Value> {
    if args.len() != 2 {
        return None;
    }
    let a = numbers(&args[0]);
    let b = numbers(&args[1]);
    if a.is_empty() || b.is_empty() {
        return Some(Value::Undefined);
    }
    let out: Vec<Value> = if a.len() == 1 {
        b.iter().map(|y| Value::Number(op(a[0], *y))).collect()
    } else if b.len() == 1 {
        a.iter().map(|x| Value::Number(op(*x, b[0]))).collect()
    } else {
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| Value::Number(op(*x, *y)))
            .collect()
    };
    Some(Value::os(out))
}

fn fold_equal(args: &[Value]) -> Option<bool> {
    if args.len() != 2 {
        return None;
    }
    Some(args[0] == args[1])
}

fn plain_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.to_string(),
        Value::Number(n) => format!("{n}"),
        Value::Bool(b) => format!("{b}"),
        other => format!("{other}"),
    }
}

fn fold_concat_str(args: &[Value]) -> Value {
    let sep = args
        .get(1)
        .and_then(|s| s.items().next().map(plain_string))
        .unwrap_or_default();
    let joined = args
        .first()
        .map(|a| {
            a.items()
                .map(plain_string)
                .collect::<Vec<_>>()
                .join(&sep)
        })
        .unwrap_or_default();
    Value::string(&joined)
}

/// `[merge, a, b, ...]`: earlier arguments win per attribute.
fn fold_merge(args: &[Value]) -> Value {
    let mut acc = Value::Undefined;
    for arg in args.iter().rev() {
        acc = acc.merge_under(arg);
    }
    acc
}

fn fold_sum(args: &[Value]) -> Value {
    let total: f64 = args.iter().flat_map(numbers).sum();
    Value::Number(total)
}

// ---------------------------------------------------------------------------
// Query application over constant values
// ---------------------------------------------------------------------------

/// Apply a constant query value to a constant data value. Pure-projection
/// queries descend; selection attributes filter record elements; a mixed
/// query filters then projects.
pub fn query_apply_value(query: &Value, data: &Value) -> Value {
    match query {
        Value::Projector => data.clone(),
        Value::Record(attrs) => {
            let matched: Vec<Value> = data
                .items()
                .filter(|item| record_selected(attrs, item))
                .cloned()
                .collect();
            let projections: Vec<(&String, &Value)> = attrs
                .iter()
                .filter(|(_, v)| is_projecting(v))
                .collect();
            if projections.is_empty() {
                return Value::os(matched);
            }
            let mut out = Vec::new();
            for item in &matched {
                if let Value::Record(fields) = item {
                    for (attr, sub_q) in &projections {
                        if let Some(sub) = fields.get(*attr) {
                            out.push(query_apply_value(sub_q, sub));
                        }
                    }
                }
            }
            Value::os(out)
        }
        // A terminal query value is a selection by match.
        other => {
            let matched: Vec<Value> = data
                .items()
                .filter(|item| SingleQualifier::matches(other, item))
                .cloned()
                .collect();
            Value::os(matched)
        }
    }
}

fn is_projecting(v: &Value) -> bool {
    match v {
        Value::Projector => true,
        Value::Record(attrs) => attrs.values().any(is_projecting),
        _ => false,
    }
}

fn record_selected(query_attrs: &BTreeMap<String, Value>, item: &Value) -> bool {
    let Value::Record(fields) = item else {
        return false;
    };
    query_attrs.iter().all(|(attr, sub_q)| {
        if is_projecting(sub_q) {
            return true;
        }
        match fields.get(attr) {
            Some(field) => match sub_q {
                Value::Record(sub_attrs) => record_selected(sub_attrs, field)
                    || field.items().any(|i| record_selected(sub_attrs, i)),
                terminal => SingleQualifier::matches(terminal, field),
            },
            None => false,
        }
    })
}

// ---------------------------------------------------------------------------
// Redundant-argument removal
// ---------------------------------------------------------------------------

fn const_number(pool: &FunctionNodePool, id: FnId) -> Option<f64> {
    pool.const_value(id).and_then(Value::as_number)
}

/// Strip identity elements and rewrite to narrower builtins. Creates the
/// occasional collapse constant through `pool`.
pub fn remove_redundant_arguments(
    f: BuiltinFunction,
    args: &[FnId],
    pool: &mut FunctionNodePool,
    cycle: u32,
) -> Rewrite {
    use BuiltinFunction::*;
    match f {
        And => {
            if args
                .iter()
                .any(|&a| pool.known_truth(a) == Some(false))
            {
                return Rewrite::Replace(pool.const_node(Value::Bool(false), true, cycle));
            }
            strip_known(args, pool, true, And, Bool, cycle)
        }
        Or => {
            if args.iter().any(|&a| pool.known_truth(a) == Some(true)) {
                return Rewrite::Replace(pool.const_node(Value::Bool(true), true, cycle));
            }
            strip_known(args, pool, false, Or, Bool, cycle)
        }
        Plus => strip_numeric_identity(args, pool, 0.0, Plus, cycle),
        Mul => strip_numeric_identity(args, pool, 1.0, Mul, cycle),
        Minus if args.len() == 2 => {
            if const_number(pool, args[0]) == Some(0.0) {
                Rewrite::Call(UMinus, vec![args[1]])
            } else if const_number(pool, args[1]) == Some(0.0) {
                Rewrite::Replace(args[0])
            } else {
                Rewrite::Keep
            }
        }
        Div if args.len() == 2 => {
            if const_number(pool, args[1]) == Some(1.0) {
                Rewrite::Replace(args[0])
            } else {
                Rewrite::Keep
            }
        }
        Logb if args.len() == 2 => match const_number(pool, args[1]) {
            Some(b) if b == 10.0 => Rewrite::Call(Log10, vec![args[0]]),
            Some(b) if b == 2.0 => Rewrite::Call(Log2, vec![args[0]]),
            Some(b) if b == std::f64::consts::E => Rewrite::Call(Ln, vec![args[0]]),
            _ => Rewrite::Keep,
        },
        Pow if args.len() == 2 => {
            if const_number(pool, args[0]) == Some(std::f64::consts::E) {
                Rewrite::Call(Exp, vec![args[1]])
            } else {
                Rewrite::Keep
            }
        }
        _ => Rewrite::Keep,
    }
}

/// Drop boolean-gate operands whose truth is the identity for the gate.
fn strip_known(
    args: &[FnId],
    pool: &mut FunctionNodePool,
    identity: bool,
    gate: BuiltinFunction,
    single_wrap: BuiltinFunction,
    cycle: u32,
) -> Rewrite {
    let kept: Vec<FnId> = args
        .iter()
        .copied()
        .filter(|&a| pool.known_truth(a) != Some(identity))
        .collect();
    if kept.len() == args.len() {
        return Rewrite::Keep;
    }
    match kept.len() {
        0 => Rewrite::Replace(pool.const_node(Value::Bool(identity), true, cycle)),
        1 => {
            // Preserve the boolean interpretation of the gate unless the
            // remaining operand is already boolean.
            if pool.get(kept[0]).value_type.boolean {
                Rewrite::Replace(kept[0])
            } else {
                Rewrite::Call(single_wrap, kept)
            }
        }
        _ => Rewrite::Call(gate, kept),
    }
}

fn strip_numeric_identity(
    args: &[FnId],
    pool: &mut FunctionNodePool,
    identity: f64,
    f: BuiltinFunction,
    cycle: u32,
) -> Rewrite {
    if args.len() < 2 {
        return Rewrite::Keep;
    }
    let kept: Vec<FnId> = args
        .iter()
        .copied()
        .filter(|&a| const_number(pool, a) != Some(identity))
        .collect();
    if kept.len() == args.len() {
        return Rewrite::Keep;
    }
    match kept.len() {
        0 => Rewrite::Replace(pool.const_node(Value::Number(identity), true, cycle)),
        1 => Rewrite::Replace(kept[0]),
        _ => Rewrite::Call(f, kept),
    }
}

// ---------------------------------------------------------------------------
// Application type inference
// ---------------------------------------------------------------------------

/// Value type of a builtin application given its argument types.
pub fn infer_apply_type(f: BuiltinFunction, arg_types: &[&ValueType]) -> ValueType {
    use BuiltinFunction::*;
    match f {
        Plus | Minus | UMinus | Mul | Div | Pow | Exp | Ln | Log10 | Log2 | Logb | Sum => {
            ValueType::number().with_sizes(SizeRanges::zero_or_one())
        }
        Bool | Not | And | Or | Equal | NotEqual => ValueType::boolean(),
        ConcatStr => ValueType::string(),
        First | Last => {
            let mut t = arg_types
                .first()
                .map_or_else(ValueType::unknown, |t| (*t).clone());
            t.sizes = SizeRanges::zero_or_one();
            t
        }
        Concat | Merge | MergeWrite => {
            let mut t = arg_types
                .iter()
                .copied()
                .cloned()
                .reduce(|a, b| a.merge(&b))
                .unwrap_or_else(ValueType::undefined);
            if f == Concat {
                t.sizes = arg_types
                    .iter()
                    .map(|t| t.sizes.clone())
                    .reduce(|a, b| a.sum(&b))
                    .unwrap_or_else(|| SizeRanges::exact(0));
            }
            t
        }
        Pointer => ValueType {
            data_source: true,
            sizes: SizeRanges::new(vec![SizeRange::at_least(0)]),
            ..Default::default()
        },
        Me | Embedding | AreaOfClass => ValueType {
            areas: Some(BTreeMap::new()),
            sizes: SizeRanges::any(),
            ..Default::default()
        },
        ClassOfArea => ValueType::string().with_sizes(SizeRanges::any()),
        ExecuteCompiledQuery => match arg_types {
            [q, d] => q.apply_query(d),
            _ => ValueType::any_data(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_broadcasts_singletons() {
        let os = Value::os(vec![Value::number(1.0), Value::number(2.0)]);
        let folded = check_constant_result(BuiltinFunction::Plus, &[os, Value::number(10.0)]);
        assert_eq!(
            folded,
            Some(Value::os(vec![Value::number(11.0), Value::number(12.0)]))
        );
    }

    #[test]
    fn empty_operand_folds_to_empty() {
        let folded =
            check_constant_result(BuiltinFunction::Mul, &[Value::Undefined, Value::number(3.0)]);
        assert_eq!(folded, Some(Value::Undefined));
    }

    #[test]
    fn first_and_last_on_empty_stay_empty() {
        assert_eq!(
            check_constant_result(BuiltinFunction::First, &[Value::Undefined]),
            Some(Value::Undefined)
        );
        assert_eq!(
            check_constant_result(BuiltinFunction::Last, &[Value::Undefined]),
            Some(Value::Undefined)
        );
    }

    #[test]
    fn merge_earlier_argument_wins() {
        let mut a = BTreeMap::new();
        a.insert("x".to_string(), Value::number(1.0));
        let mut b = BTreeMap::new();
        b.insert("x".to_string(), Value::number(2.0));
        b.insert("y".to_string(), Value::number(3.0));
        let folded = check_constant_result(
            BuiltinFunction::Merge,
            &[Value::Record(a), Value::Record(b)],
        );
        match folded {
            Some(Value::Record(m)) => {
                assert_eq!(m["x"], Value::number(1.0));
                assert_eq!(m["y"], Value::number(3.0));
            }
            other => panic!("unexpected fold: {other:?}"),
        }
    }

    #[test]
    fn query_value_selects_and_projects() {
        let mut item = BTreeMap::new();
        item.insert("a".to_string(), Value::number(5.0));
        item.insert("b".to_string(), Value::number(6.0));
        let data = Value::Record(item);

        // {a: _} projects
        let mut q = BTreeMap::new();
        q.insert("a".to_string(), Value::Projector);
        assert_eq!(query_apply_value(&Value::Record(q), &data), Value::number(5.0));

        // {a: 5, b: _} selects on a then projects b
        let mut q2 = BTreeMap::new();
        q2.insert("a".to_string(), Value::number(5.0));
        q2.insert("b".to_string(), Value::Projector);
        assert_eq!(
            query_apply_value(&Value::Record(q2), &data),
            Value::number(6.0)
        );

        // mismatched selection yields empty
        let mut q3 = BTreeMap::new();
        q3.insert("a".to_string(), Value::number(7.0));
        q3.insert("b".to_string(), Value::Projector);
        assert_eq!(query_apply_value(&Value::Record(q3), &data), Value::Undefined);
    }

    #[test]
    fn redundant_argument_identities() {
        let mut pool = FunctionNodePool::new();
        let x = pool.add_stub(ValueType::number(), 0);
        let zero = pool.const_node(Value::number(0.0), true, 0);
        let one = pool.const_node(Value::number(1.0), true, 0);

        assert_eq!(
            remove_redundant_arguments(BuiltinFunction::Plus, &[x, zero], &mut pool, 0),
            Rewrite::Replace(x)
        );
        assert_eq!(
            remove_redundant_arguments(BuiltinFunction::Minus, &[zero, x], &mut pool, 0),
            Rewrite::Call(BuiltinFunction::UMinus, vec![x])
        );
        assert_eq!(
            remove_redundant_arguments(BuiltinFunction::Div, &[x, one], &mut pool, 0),
            Rewrite::Replace(x)
        );
        let ten = pool.const_node(Value::number(10.0), true, 0);
        assert_eq!(
            remove_redundant_arguments(BuiltinFunction::Logb, &[x, ten], &mut pool, 0),
            Rewrite::Call(BuiltinFunction::Log10, vec![x])
        );
        let e = pool.const_node(Value::number(std::f64::consts::E), true, 0);
        assert_eq!(
            remove_redundant_arguments(BuiltinFunction::Pow, &[e, x], &mut pool, 0),
            Rewrite::Call(BuiltinFunction::Exp, vec![x])
        );
    }

    #[test]
    fn and_with_always_true_drops_operand() {
        let mut pool = FunctionNodePool::new();
        let t = pool.const_node(Value::Bool(true), true, 0);
        let x = pool.add_stub(ValueType::number(), 0);
        // non-boolean operand keeps its bool interpretation
        assert_eq!(
            remove_redundant_arguments(BuiltinFunction::And, &[t, x], &mut pool, 0),
            Rewrite::Call(BuiltinFunction::Bool, vec![x])
        );
        let b = pool.add_stub(ValueType::boolean(), 0);
        assert_eq!(
            remove_redundant_arguments(BuiltinFunction::And, &[t, b], &mut pool, 0),
            Rewrite::Replace(b)
        );
        let f = pool.const_node(Value::Bool(false), true, 0);
        match remove_redundant_arguments(BuiltinFunction::And, &[x, f], &mut pool, 0) {
            Rewrite::Replace(id) => {
                assert_eq!(pool.const_value(id), Some(&Value::Bool(false)));
            }
            other => panic!("unexpected rewrite: {other:?}"),
        }
    }
}
