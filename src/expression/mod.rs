//! # Expression Store
//!
//! Immutable expression trees, hash-consed so that identical sub-expressions
//! share one id (and therefore one compiled function node per template
//! cache). Child references are always canonical ids, so structural equality
//! reduces to shallow equality of the node itself.
//!
//! Also hosts query decomposition: [`ExpressionStore::extract_query_path`]
//! splits a nested single-attribute query into its path and terminal, and
//! [`ExpressionStore::extract_query_components`] flattens a full query into
//! ordered selection / projection records for query-calc construction.

use crate::fnode::BuiltinFunction;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Canonical id of a stored expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub u32);

/// Number literal with canonical NaN/zero bit patterns so expressions can be
/// hashed.
#[derive(Debug, Clone, Copy)]
pub struct NumberLit(pub f64);

impl NumberLit {
    fn bits(self) -> u64 {
        if self.0.is_nan() {
            f64::NAN.to_bits()
        } else if self.0 == 0.0 {
            0.0_f64.to_bits()
        } else {
            self.0.to_bits()
        }
    }
}

impl PartialEq for NumberLit {
    fn eq(&self, other: &Self) -> bool {
        self.bits() == other.bits()
    }
}

impl Eq for NumberLit {}

impl Hash for NumberLit {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bits().hash(state);
    }
}

/// One expression node. Children are canonical ids into the same store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExprKind {
    /// `{attr: value, ...}`
    AttributeValue(BTreeMap<String, ExprId>),
    /// `o(e1, e2, ...)`
    OrderedSet(Vec<ExprId>),
    /// `[query, data]`
    Query { query: ExprId, data: ExprId },
    /// `[f, arg1, ...]`
    FunctionApplication { function: ExprId, args: Vec<ExprId> },
    /// `n(e1, ...)`
    Negation(Vec<ExprId>),
    /// `r(low, high)` with open/closed ends
    Range {
        low: ExprId,
        high: ExprId,
        low_open: bool,
        high_open: bool,
    },
    String(Arc<str>),
    Number(NumberLit),
    Boolean(bool),
    Null,
    Undefined,
    /// `_`
    Projector,
    BuiltInFunction(BuiltinFunction),
    /// Host-language function application by registered name.
    ForeignApplication { name: Arc<str>, args: Vec<ExprId> },
}

/// A stored expression with its canonical id.
#[derive(Debug, Clone)]
pub struct Expression {
    pub id: ExprId,
    pub kind: ExprKind,
}

/// One ordered component of a decomposed query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryComponent {
    /// Selection at `path`; `positive == false` for negated terms.
    Select {
        path: Vec<Arc<str>>,
        positive: bool,
        selection: ExprId,
    },
    /// Projection at `path`, landing at `destination` in the result shape.
    Project {
        path: Vec<Arc<str>>,
        destination: Vec<Arc<str>>,
    },
}

/// Top-level attributes that address an area section rather than a data
/// attribute. `content` addresses the data itself so it contributes no path
/// element.
const SECTION_ATTRS: [&str; 4] = ["context", "param", "content", "children"];

/// Hash-consing store of expressions.
#[derive(Debug, Default)]
pub struct ExpressionStore {
    exprs: Vec<Expression>,
    interned: HashMap<ExprKind, ExprId>,
}

impl ExpressionStore {
    pub fn new() -> Self {
        ExpressionStore::default()
    }

    /// Store an expression, returning the canonical id (fresh on first
    /// insertion).
    pub fn store(&mut self, kind: ExprKind) -> ExprId {
        if let Some(&id) = self.interned.get(&kind) {
            return id;
        }
        let id = ExprId(self.exprs.len() as u32);
        self.exprs.push(Expression {
            id,
            kind: kind.clone(),
        });
        self.interned.insert(kind, id);
        id
    }

    pub fn get(&self, id: ExprId) -> &ExprKind {
        &self.exprs[id.0 as usize].kind
    }

    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }

    // ------------------------------------------------------------------
    // Convenience constructors
    // ------------------------------------------------------------------

    pub fn number(&mut self, n: f64) -> ExprId {
        self.store(ExprKind::Number(NumberLit(n)))
    }

    pub fn string(&mut self, s: &str) -> ExprId {
        self.store(ExprKind::String(Arc::from(s)))
    }

    pub fn boolean(&mut self, b: bool) -> ExprId {
        self.store(ExprKind::Boolean(b))
    }

    pub fn projector(&mut self) -> ExprId {
        self.store(ExprKind::Projector)
    }

    pub fn undefined(&mut self) -> ExprId {
        self.store(ExprKind::Undefined)
    }

    pub fn builtin(&mut self, f: BuiltinFunction) -> ExprId {
        self.store(ExprKind::BuiltInFunction(f))
    }

    pub fn av(&mut self, attrs: Vec<(&str, ExprId)>) -> ExprId {
        let map = attrs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        self.store(ExprKind::AttributeValue(map))
    }

    pub fn apply(&mut self, f: BuiltinFunction, args: Vec<ExprId>) -> ExprId {
        let function = self.builtin(f);
        self.store(ExprKind::FunctionApplication { function, args })
    }

    pub fn query(&mut self, query: ExprId, data: ExprId) -> ExprId {
        self.store(ExprKind::Query { query, data })
    }

    pub fn ordered_set(&mut self, items: Vec<ExprId>) -> ExprId {
        self.store(ExprKind::OrderedSet(items))
    }

    // ------------------------------------------------------------------
    // Query decomposition
    // ------------------------------------------------------------------

    /// Decompose a `{a: {b: ...}}`-shaped expression into its attribute
    /// path, terminal expression, and whether the terminal is a projector.
    /// Descent stops at the first node that is not a single-attribute AV.
    pub fn extract_query_path(&self, id: ExprId) -> (Vec<Arc<str>>, ExprId, bool) {
        let mut path = Vec::new();
        let mut cur = id;
        loop {
            match self.get(cur) {
                ExprKind::AttributeValue(attrs) if attrs.len() == 1 => {
                    let Some((attr, &next)) = attrs.iter().next() else {
                        return (path, cur, false);
                    };
                    path.push(Arc::from(attr.as_str()));
                    cur = next;
                }
                kind => {
                    let is_projection = matches!(kind, ExprKind::Projector);
                    return (path, cur, is_projection);
                }
            }
        }
    }

    /// Flatten a query into ordered selection and projection components.
    ///
    /// A leading section attribute (`context`, `param`, `children`) stays on
    /// the path; `content` addresses the data itself and is dropped from it.
    /// The destination of a projection is always the attribute path as
    /// written, so the result shape mirrors the query.
    pub fn extract_query_components(&self, id: ExprId) -> Vec<QueryComponent> {
        let mut out = Vec::new();
        self.collect_components(id, &mut Vec::new(), &mut Vec::new(), true, &mut out);
        out
    }

    fn collect_components(
        &self,
        id: ExprId,
        path: &mut Vec<Arc<str>>,
        written: &mut Vec<Arc<str>>,
        positive: bool,
        out: &mut Vec<QueryComponent>,
    ) {
        match self.get(id) {
            ExprKind::AttributeValue(attrs) => {
                for (attr, &sub) in attrs {
                    let top_level = written.is_empty();
                    let section = top_level && SECTION_ATTRS.contains(&attr.as_str());
                    let arc: Arc<str> = Arc::from(attr.as_str());
                    written.push(arc.clone());
                    let pushed = if section && attr == "content" {
                        false
                    } else {
                        path.push(arc);
                        true
                    };
                    self.collect_components(sub, path, written, positive, out);
                    if pushed {
                        path.pop();
                    }
                    written.pop();
                }
            }
            ExprKind::Negation(items) => {
                for &sub in items {
                    self.collect_components(sub, path, written, !positive, out);
                }
            }
            ExprKind::Projector => {
                out.push(QueryComponent::Project {
                    path: path.clone(),
                    destination: written.clone(),
                });
            }
            _ => {
                out.push(QueryComponent::Select {
                    path: path.clone(),
                    positive,
                    selection: id,
                });
            }
        }
    }

    /// Canonicalise a query under a `{context: ...}` wrapping when it does
    /// not already address a section.
    pub fn normalize_query(&mut self, id: ExprId) -> ExprId {
        let needs_wrap = match self.get(id) {
            ExprKind::AttributeValue(attrs) => !attrs
                .keys()
                .all(|k| SECTION_ATTRS.contains(&k.as_str())),
            ExprKind::Negation(_) | ExprKind::Projector => true,
            _ => false,
        };
        if !needs_wrap {
            return id;
        }
        let mut map = BTreeMap::new();
        map.insert("context".to_string(), id);
        self.store(ExprKind::AttributeValue(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_hash_conses() {
        let mut store = ExpressionStore::new();
        let five_a = store.number(5.0);
        let five_b = store.number(5.0);
        assert_eq!(five_a, five_b);
        let av_a = store.av(vec![("a", five_a)]);
        let av_b = store.av(vec![("a", five_b)]);
        assert_eq!(av_a, av_b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn extract_single_path() {
        let mut store = ExpressionStore::new();
        let p = store.projector();
        let inner = store.av(vec![("b", p)]);
        let q = store.av(vec![("a", inner)]);
        let (path, terminal, is_projection) = store.extract_query_path(q);
        let attrs: Vec<&str> = path.iter().map(|a| &**a).collect();
        assert_eq!(attrs, vec!["a", "b"]);
        assert_eq!(terminal, p);
        assert!(is_projection);
    }

    #[test]
    fn components_split_select_and_project() {
        let mut store = ExpressionStore::new();
        let five = store.number(5.0);
        let p = store.projector();
        let q = store.av(vec![("a", five), ("b", p)]);
        let comps = store.extract_query_components(q);
        assert_eq!(comps.len(), 2);
        assert!(matches!(
            &comps[0],
            QueryComponent::Select { positive: true, selection, .. } if *selection == five
        ));
        match &comps[1] {
            QueryComponent::Project { path, destination } => {
                assert_eq!(&*path[0], "b");
                assert_eq!(&*destination[0], "b");
            }
            other => panic!("expected projection, got {other:?}"),
        }
    }

    #[test]
    fn negation_flips_polarity() {
        let mut store = ExpressionStore::new();
        let five = store.number(5.0);
        let negated = store.store(ExprKind::Negation(vec![five]));
        let q = store.av(vec![("a", negated)]);
        let comps = store.extract_query_components(q);
        assert_eq!(
            comps,
            vec![QueryComponent::Select {
                path: vec![Arc::from("a")],
                positive: false,
                selection: five,
            }]
        );
    }

    #[test]
    fn content_section_drops_path_element() {
        let mut store = ExpressionStore::new();
        let p = store.projector();
        let inner = store.av(vec![("x", p)]);
        let q = store.av(vec![("content", inner)]);
        let comps = store.extract_query_components(q);
        match &comps[0] {
            QueryComponent::Project { path, destination } => {
                let attrs: Vec<&str> = path.iter().map(|a| &**a).collect();
                assert_eq!(attrs, vec!["x"]);
                let dest: Vec<&str> = destination.iter().map(|a| &**a).collect();
                assert_eq!(dest, vec!["content", "x"]);
            }
            other => panic!("expected projection, got {other:?}"),
        }
    }

    #[test]
    fn normalize_wraps_bare_queries() {
        let mut store = ExpressionStore::new();
        let five = store.number(5.0);
        let bare = store.av(vec![("a", five)]);
        let wrapped = store.normalize_query(bare);
        assert_ne!(bare, wrapped);
        match store.get(wrapped) {
            ExprKind::AttributeValue(attrs) => {
                assert_eq!(attrs.get("context"), Some(&bare));
            }
            other => panic!("expected AV, got {other:?}"),
        }
        // Already sectioned queries are left alone.
        let sectioned = store.av(vec![("context", five)]);
        assert_eq!(store.normalize_query(sectioned), sectioned);
    }
}
