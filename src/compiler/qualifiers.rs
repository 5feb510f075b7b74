//! Qualifier Compilation & Simplification
//!
//! Builds the conjunction gating one variant alternative, short-circuiting
//! atoms whose context attribute is known at compile time, and assembles
//! variant nodes from prioritised alternatives while dropping duplicates and
//! unreachable entries.
//!
//! The simplification preserves semantics: for every assignment of truth
//! values to qualifier atoms consistent with the known-true / known-false
//! context, the simplified variant selects the same alternative as the
//! unsimplified list would.

use super::Compiler;
use crate::expression::ExprId;
use crate::fnode::{
    is_implied_by, DefunId, FnId, FunctionNode, FunctionNodeKind, QualifierGroup, SingleQualifier,
};
use crate::template::TemplateId;
use crate::value::{SizeRange, SizeRanges, Value, ValueType};

/// An uncompiled qualifier atom as it appears in an area description.
#[derive(Debug, Clone, PartialEq)]
pub struct QualifierAtom {
    pub attribute: String,
    pub value: Value,
    pub target_area: TemplateId,
}

/// Outcome of compiling a conjunction of atoms.
#[derive(Debug, Clone)]
pub enum CompiledQualifier {
    /// Every atom is statically true.
    AlwaysTrue,
    /// Some atom is statically false; the alternative is unreachable.
    AlwaysFalse,
    Group(QualifierGroup),
    /// A qualifier attribute referred back into its own compilation; the
    /// group is kept with the stub node and matched as a query on the
    /// function's runtime value.
    CycleEncoded { group: QualifierGroup, at: usize },
}

/// One prioritised qualified alternative, ready for variant assembly.
#[derive(Debug, Clone)]
pub struct QualifiedValue {
    pub qualifier: CompiledQualifier,
    pub node: FnId,
    pub expr: ExprId,
}

/// Compile a conjunction of atoms against the target templates' context
/// attributes.
pub fn build_qualifier(
    compiler: &mut Compiler,
    atoms: &[QualifierAtom],
    _origin: TemplateId,
) -> CompiledQualifier {
    let mut group: QualifierGroup = Vec::new();
    let mut cycle_at: Option<usize> = None;

    for (i, atom) in atoms.iter().enumerate() {
        let attr_expr = compiler
            .templates
            .get(atom.target_area)
            .context_attrs
            .get(&atom.attribute)
            .copied();
        let function_node = match attr_expr {
            Some(expr) => {
                let node = compiler.build_simple_function_node(
                    expr,
                    None,
                    atom.target_area,
                    DefunId::NONE,
                    false,
                    &[],
                    &[],
                    Some(expr),
                    atom.target_area,
                );
                if compiler.is_unresolved_current_stub(node) {
                    compiler.cx.warnings.warn(&format!(
                        "cycle in qualifier {}@{:?}",
                        atom.attribute, atom.target_area
                    ));
                    cycle_at = Some(i);
                }
                if let Some(v) = compiler.pool.const_value(node) {
                    // Statically decidable atom.
                    if SingleQualifier::matches(&atom.value, v) {
                        continue;
                    }
                    return CompiledQualifier::AlwaysFalse;
                }
                Some(node)
            }
            None => None,
        };
        group.push(SingleQualifier {
            attribute: atom.attribute.clone(),
            value: atom.value.clone(),
            target_area: atom.target_area,
            function_node,
        });
    }

    if group.is_empty() {
        return CompiledQualifier::AlwaysTrue;
    }
    match cycle_at {
        Some(at) => CompiledQualifier::CycleEncoded { group, at },
        None => CompiledQualifier::Group(group),
    }
}

/// Whether an alternative can merge with lower-priority alternatives
/// (attribute-value shapes merge; terminals replace).
pub fn is_mergeable(compiler: &Compiler, node: FnId) -> bool {
    let t = &compiler.pool.get(node).value_type;
    t.object.is_some() || t.any_data || t.unknown
}

/// Index of the last earlier group implied by `group` whose alternative is
/// unmergeable, i.e. an alternative that is always selected first (and
/// terminally) whenever `group` holds.
fn last_implied_unmergeable(
    compiler: &Compiler,
    groups: &[QualifierGroup],
    alts: &[FnId],
    group: &QualifierGroup,
) -> Option<usize> {
    groups
        .iter()
        .enumerate()
        .rev()
        .find(|(i, g)| is_implied_by(g, group) && !is_mergeable(compiler, alts[*i]))
        .map(|(i, _)| i)
}

/// Assemble a variant from prioritised qualified values.
///
/// Scenario rules, applied in input order:
/// 1. identical consecutive group with the same expression id replaces the
///    earlier entry;
/// 2. a group implied by an earlier unmergeable alternative is unreachable
///    and is dropped;
/// 3. everything else becomes a gated alternative.
///
/// Groups of dropped-conflicting values feed `known_false` for the
/// remaining input.
pub fn build_qualifier_node(
    compiler: &mut Compiler,
    values: Vec<QualifiedValue>,
    origin: TemplateId,
    defun: DefunId,
    cycle: u32,
) -> FnId {
    let mut groups: Vec<QualifierGroup> = Vec::new();
    let mut alts: Vec<FnId> = Vec::new();
    let mut known_false: Vec<QualifierGroup> = Vec::new();

    for value in values {
        let group = match value.qualifier {
            CompiledQualifier::AlwaysFalse => continue,
            CompiledQualifier::AlwaysTrue => Vec::new(),
            CompiledQualifier::Group(g) => g,
            CompiledQualifier::CycleEncoded { group, .. } => group,
        };

        // A group that contains a known-false conjunction can never hold.
        if known_false.iter().any(|kf| is_implied_by(kf, &group)) {
            continue;
        }

        // Scenario 1: identical consecutive group, same expression.
        if let (Some(last_g), Some(&last_a)) = (groups.last(), alts.last()) {
            if crate::fnode::same_group(last_g, &group)
                && compiler.pool.get(last_a).orig_expr == Some(value.expr)
            {
                groups.pop();
                alts.pop();
                groups.push(group);
                alts.push(value.node);
                continue;
            }
        }

        // Scenario 2: unreachable behind an earlier unmergeable alternative.
        if !group.is_empty()
            && last_implied_unmergeable(compiler, &groups, &alts, &group).is_some()
        {
            continue;
        }

        let unmergeable = !is_mergeable(compiler, value.node);
        let terminal = group.is_empty() && unmergeable;
        groups.push(group.clone());
        alts.push(value.node);
        if unmergeable && !group.is_empty() {
            // Later values only apply when this qualifier is false.
            known_false.push(group);
        }
        if terminal {
            // An unconditional unmergeable alternative shadows the rest.
            break;
        }
    }

    finish_variant(compiler, groups, alts, origin, defun, cycle)
}

/// Collapse trivial variants and create the node.
pub(super) fn finish_variant(
    compiler: &mut Compiler,
    groups: Vec<QualifierGroup>,
    alts: Vec<FnId>,
    origin: TemplateId,
    defun: DefunId,
    cycle: u32,
) -> FnId {
    debug_assert_eq!(groups.len(), alts.len());
    if alts.is_empty() {
        return compiler.pool.empty_os_node(cycle);
    }
    if alts.len() == 1 && groups[0].is_empty() {
        return alts[0];
    }
    debug_assert!(
        !compiler.pool.variant_has_adjacent_duplicates(&groups, &alts),
        "variant with adjacent duplicate qualifier groups"
    );

    let may_all_fail = !groups.iter().any(Vec::is_empty);
    let mut value_type = alts
        .iter()
        .map(|&a| compiler.pool.get(a).value_type.clone())
        .reduce(|a, b| a.merge(&b))
        .unwrap_or_else(ValueType::unknown);
    if may_all_fail {
        value_type.undef = true;
        value_type.sizes = value_type
            .sizes
            .union(&SizeRanges::new(vec![SizeRange::exact(0)]));
    }

    let local_to_area = compiler.join_localities(alts.iter().copied(), Some(origin));
    compiler.pool.add(FunctionNode {
        kind: FunctionNodeKind::Variant {
            qualifiers: groups,
            alternatives: alts,
        },
        local_to_area,
        local_to_defun: defun,
        value_type,
        orig_expr: None,
        cycle,
    })
}

/// Prune a variant's alternatives under a qualifier context: groups that
/// contain a known-false conjunction are dropped; a group fully implied by
/// the known-true context always holds, so an unmergeable alternative there
/// shadows the rest of the list.
pub fn pick_qualified_expression(
    compiler: &mut Compiler,
    node: FnId,
    known_true: &[QualifierGroup],
    known_false: &[QualifierGroup],
    origin: TemplateId,
    cycle: u32,
) -> FnId {
    let (qualifiers, alternatives) = match &compiler.pool.get(node).kind {
        FunctionNodeKind::Variant {
            qualifiers,
            alternatives,
        } => (qualifiers.clone(), alternatives.clone()),
        _ => return node,
    };

    let defun = compiler.pool.get(node).local_to_defun;
    let mut groups: Vec<QualifierGroup> = Vec::new();
    let mut alts: Vec<FnId> = Vec::new();
    let mut changed = false;

    for (group, alt) in qualifiers.into_iter().zip(alternatives) {
        if known_false.iter().any(|kf| is_implied_by(kf, &group)) {
            changed = true;
            continue;
        }
        let always_true =
            group.is_empty() || known_true.iter().any(|kt| is_implied_by(&group, kt));
        if always_true {
            let shadows = !is_mergeable(compiler, alt);
            changed = changed || !group.is_empty();
            groups.push(Vec::new());
            alts.push(alt);
            if shadows {
                break;
            }
        } else {
            groups.push(group);
            alts.push(alt);
        }
    }

    if !changed {
        return node;
    }
    finish_variant(compiler, groups, alts, origin, defun, cycle)
}
