//! # Query-Calculation Tree
//!
//! The runtime mirror of a query's structure: terminal nodes (simple
//! selections, id sets, projections, the always-true node) register with
//! indexer path nodes; composite nodes (intersection, union, negation)
//! aggregate the matches of their sub-nodes, raised to the composite's
//! path. Matches propagate additively and subtractively as deltas toward
//! the match parent, ending at a root query-calculation node.
//!
//! The tree never calls anything back: every state change returns a
//! [`MatchDelta`] that the engine dispatches upward.

pub mod root;

use crate::indexer::{DataElementId, Indexer, SubscriberInfo};
use crate::fnode::SingleQualifier;
use crate::path::PathId;
use crate::value::Value;
use root::RootId;
use std::collections::{HashMap, HashSet};

/// Arena index of a query-calculation node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryCalcId(pub u32);

/// Where a node's match deltas go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchParent {
    Detached,
    Root(RootId),
    Node(QueryCalcId),
}

/// A match update flowing toward the match parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchDelta {
    pub source: QueryCalcId,
    pub parent: MatchParent,
    pub added: Vec<DataElementId>,
    pub removed: Vec<DataElementId>,
}

impl MatchDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Compiled description of a query's structure, used to build the tree.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryDesc {
    /// `n(false)`: matches everything at the prefix path.
    True,
    /// Terminal selection by value/range match at a path.
    Simple { path: PathId, selection: Value },
    /// Terminal match against a caller-supplied id set.
    Ids {
        path: PathId,
        ids: Vec<DataElementId>,
    },
    /// Projection of the data at a path, mapped to a destination path in
    /// the result indexer.
    Projection { path: PathId, mapped_path: PathId },
    Intersection(Vec<QueryDesc>),
    Union(Vec<QueryDesc>),
    /// Elements at `path` not matched by any negated term.
    Negation {
        path: PathId,
        negated: Vec<QueryDesc>,
    },
}

/// Node variants. Composite nodes keep per-child raised contributions so
/// multi-level matches aggregate correctly.
#[derive(Debug)]
pub enum QueryCalcKind {
    True,
    Simple { selection: Value },
    Ids {
        requested: HashSet<DataElementId>,
        /// Requested but not present in the indexer.
        other_query_ids: HashSet<DataElementId>,
    },
    Intersection { children: Vec<QueryCalcId> },
    Union { children: Vec<QueryCalcId> },
    Negation { children: Vec<QueryCalcId> },
    Projection { mapped_path: PathId },
}

#[derive(Debug)]
pub struct QueryCalcNode {
    pub id: QueryCalcId,
    pub kind: QueryCalcKind,
    pub path: PathId,
    pub match_parent: MatchParent,
    /// Current matched set, at this node's path.
    pub matches: HashSet<DataElementId>,
    /// For composites: per child, raised id -> contribution count.
    child_contrib: HashMap<QueryCalcId, HashMap<DataElementId, u32>>,
    /// For negation: the elements present at the path.
    universe: HashSet<DataElementId>,
    /// Cycle number of the last structural refresh.
    pub refresh_cycle: u32,
    /// Paths with data at or below this node's path.
    pub match_points: Vec<PathId>,
}

impl QueryCalcNode {
    pub fn is_selection(&self) -> bool {
        !matches!(self.kind, QueryCalcKind::Projection { .. })
    }

    pub fn is_projection(&self) -> bool {
        matches!(self.kind, QueryCalcKind::Projection { .. })
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            QueryCalcKind::True
                | QueryCalcKind::Simple { .. }
                | QueryCalcKind::Ids { .. }
                | QueryCalcKind::Projection { .. }
        )
    }
}

/// Arena of query-calculation nodes.
#[derive(Debug, Default)]
pub struct QueryCalcPool {
    nodes: Vec<QueryCalcNode>,
}

impl QueryCalcPool {
    pub fn new() -> Self {
        QueryCalcPool::default()
    }

    pub fn get(&self, id: QueryCalcId) -> &QueryCalcNode {
        &self.nodes[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: QueryCalcId) -> &mut QueryCalcNode {
        &mut self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn add_node(&mut self, kind: QueryCalcKind, path: PathId) -> QueryCalcId {
        let id = QueryCalcId(self.nodes.len() as u32);
        self.nodes.push(QueryCalcNode {
            id,
            kind,
            path,
            match_parent: MatchParent::Detached,
            matches: HashSet::new(),
            child_contrib: HashMap::new(),
            universe: HashSet::new(),
            refresh_cycle: 0,
            match_points: Vec::new(),
        });
        id
    }

    /// Build the tree for a query description. Terminal nodes register with
    /// the indexer; composite children point their match parent here.
    pub fn build(
        &mut self,
        desc: &QueryDesc,
        indexer: &mut Indexer,
        prefix_path: PathId,
    ) -> QueryCalcId {
        let id = match desc {
            QueryDesc::True => self.add_node(QueryCalcKind::True, prefix_path),
            QueryDesc::Simple { path, selection } => self.add_node(
                QueryCalcKind::Simple {
                    selection: selection.clone(),
                },
                *path,
            ),
            QueryDesc::Ids { path, ids } => self.add_node(
                QueryCalcKind::Ids {
                    requested: ids.iter().copied().collect(),
                    other_query_ids: HashSet::new(),
                },
                *path,
            ),
            QueryDesc::Projection { path, mapped_path } => self.add_node(
                QueryCalcKind::Projection {
                    mapped_path: *mapped_path,
                },
                *path,
            ),
            QueryDesc::Intersection(subs) => {
                let children: Vec<QueryCalcId> = subs
                    .iter()
                    .map(|s| self.build(s, indexer, prefix_path))
                    .collect();
                let node = self.add_node(
                    QueryCalcKind::Intersection {
                        children: children.clone(),
                    },
                    prefix_path,
                );
                for c in children {
                    self.get_mut(c).match_parent = MatchParent::Node(node);
                }
                node
            }
            QueryDesc::Union(subs) => {
                let children: Vec<QueryCalcId> = subs
                    .iter()
                    .map(|s| self.build(s, indexer, prefix_path))
                    .collect();
                let node = self.add_node(
                    QueryCalcKind::Union {
                        children: children.clone(),
                    },
                    prefix_path,
                );
                for c in children {
                    self.get_mut(c).match_parent = MatchParent::Node(node);
                }
                node
            }
            QueryDesc::Negation { path, negated } => {
                let children: Vec<QueryCalcId> = negated
                    .iter()
                    .map(|s| self.build(s, indexer, prefix_path))
                    .collect();
                let node = self.add_node(
                    QueryCalcKind::Negation {
                        children: children.clone(),
                    },
                    *path,
                );
                for c in children {
                    self.get_mut(c).match_parent = MatchParent::Node(node);
                }
                node
            }
        };
        let node = self.get(id);
        if node.is_terminal() || matches!(node.kind, QueryCalcKind::Negation { .. }) {
            let info = SubscriberInfo {
                path: node.path,
                is_selection: node.is_selection(),
                is_projection: node.is_projection(),
                do_not_index: !matches!(node.kind, QueryCalcKind::Simple { .. }),
            };
            indexer.add_query_calc_to_path_node(id, info);
        }
        id
    }

    /// Tear down a tree, unregistering terminals from the indexer.
    pub fn destroy(&mut self, id: QueryCalcId, indexer: &mut Indexer) {
        let children: Vec<QueryCalcId> = match &self.get(id).kind {
            QueryCalcKind::Intersection { children }
            | QueryCalcKind::Union { children }
            | QueryCalcKind::Negation { children } => children.clone(),
            _ => Vec::new(),
        };
        for c in children {
            self.destroy(c, indexer);
        }
        let node = self.get_mut(id);
        let path = node.path;
        node.match_parent = MatchParent::Detached;
        node.matches.clear();
        node.child_contrib.clear();
        node.universe.clear();
        indexer.remove_query_calc_from_path_node(id, path);
    }

    // ------------------------------------------------------------------
    // Indexer-facing surface
    // ------------------------------------------------------------------

    /// Elements appeared at the node's registered path.
    pub fn add_matches(
        &mut self,
        id: QueryCalcId,
        elements: &[DataElementId],
        indexer: &Indexer,
    ) -> Option<MatchDelta> {
        if matches!(self.get(id).kind, QueryCalcKind::Negation { .. }) {
            return self.negation_universe_add(id, elements);
        }
        let path = self.get(id).path;
        let mut added = Vec::new();
        match &mut self.get_mut(id).kind {
            QueryCalcKind::True | QueryCalcKind::Projection { .. } => {
                added.extend_from_slice(elements);
            }
            QueryCalcKind::Simple { selection } => {
                let selection = selection.clone();
                for &e in elements {
                    let key = indexer.get_key(path, e).cloned().unwrap_or(Value::Undefined);
                    if SingleQualifier::matches(&selection, &key) {
                        added.push(e);
                    }
                }
            }
            QueryCalcKind::Ids {
                requested,
                other_query_ids,
            } => {
                for &e in elements {
                    if requested.contains(&e) {
                        other_query_ids.remove(&e);
                        added.push(e);
                    }
                }
            }
            QueryCalcKind::Negation { .. }
            | QueryCalcKind::Intersection { .. }
            | QueryCalcKind::Union { .. } => {
                debug_assert!(false, "composite node registered at a path node");
                return None;
            }
        }
        self.commit(id, added, Vec::new())
    }

    /// Elements left the node's registered path.
    pub fn remove_matches(
        &mut self,
        id: QueryCalcId,
        elements: &[DataElementId],
    ) -> Option<MatchDelta> {
        if matches!(self.get(id).kind, QueryCalcKind::Negation { .. }) {
            return self.negation_universe_remove(id, elements);
        }
        if let QueryCalcKind::Ids {
            requested,
            other_query_ids,
        } = &mut self.get_mut(id).kind
        {
            for &e in elements {
                if requested.contains(&e) {
                    other_query_ids.insert(e);
                }
            }
        }
        let removed: Vec<DataElementId> = {
            let node = self.get(id);
            elements
                .iter()
                .copied()
                .filter(|e| node.matches.contains(e))
                .collect()
        };
        self.commit(id, Vec::new(), removed)
    }

    /// The node's path node was cleared.
    pub fn remove_all_indexer_matches(&mut self, id: QueryCalcId) -> Option<MatchDelta> {
        let all: Vec<DataElementId> = self.get(id).matches.iter().copied().collect();
        self.get_mut(id).universe.clear();
        self.commit(id, Vec::new(), all)
    }

    /// A key changed at the node's path: re-evaluate one element.
    pub fn key_changed(
        &mut self,
        id: QueryCalcId,
        element: DataElementId,
        indexer: &Indexer,
    ) -> Option<MatchDelta> {
        let path = self.get(id).path;
        let QueryCalcKind::Simple { selection } = &self.get(id).kind else {
            return None;
        };
        let key = indexer
            .get_key(path, element)
            .cloned()
            .unwrap_or(Value::Undefined);
        let now = SingleQualifier::matches(selection, &key)
            && indexer
                .path_node(path)
                .is_some_and(|n| n.contains(element));
        let was = self.get(id).matches.contains(&element);
        match (was, now) {
            (false, true) => self.commit(id, vec![element], Vec::new()),
            (true, false) => self.commit(id, Vec::new(), vec![element]),
            _ => None,
        }
    }

    /// Match points forwarded from the indexer.
    pub fn set_match_points(&mut self, id: QueryCalcId, paths: Vec<PathId>) {
        self.get_mut(id).match_points = paths;
    }

    pub fn add_to_match_points(&mut self, id: QueryCalcId, path: PathId) {
        let node = self.get_mut(id);
        if !node.match_points.contains(&path) {
            node.match_points.push(path);
            node.match_points.sort();
        }
    }

    pub fn remove_from_match_points(&mut self, id: QueryCalcId, path: PathId) {
        self.get_mut(id).match_points.retain(|&p| p != path);
    }

    // ------------------------------------------------------------------
    // Id-query surface
    // ------------------------------------------------------------------

    /// Extend an id node's requested set; the delta against the indexer is
    /// computed immediately.
    pub fn add_data_elements(
        &mut self,
        id: QueryCalcId,
        ids: &[DataElementId],
        indexer: &Indexer,
    ) -> Option<MatchDelta> {
        let path = self.get(id).path;
        let diff = indexer.filter_data_nodes_at_path_with_diff(path, ids);
        let mut added = Vec::new();
        if let QueryCalcKind::Ids {
            requested,
            other_query_ids,
        } = &mut self.get_mut(id).kind
        {
            for &e in ids {
                if !requested.insert(e) {
                    continue;
                }
                if diff.present.contains(&e) {
                    added.push(e);
                } else {
                    other_query_ids.insert(e);
                }
            }
        }
        self.commit(id, added, Vec::new())
    }

    pub fn remove_data_elements(
        &mut self,
        id: QueryCalcId,
        ids: &[DataElementId],
    ) -> Option<MatchDelta> {
        let mut removed = Vec::new();
        if let QueryCalcKind::Ids {
            requested,
            other_query_ids,
        } = &mut self.get_mut(id).kind
        {
            for &e in ids {
                if requested.remove(&e) {
                    other_query_ids.remove(&e);
                    removed.push(e);
                }
            }
        }
        let removed: Vec<DataElementId> = {
            let node = self.get(id);
            removed
                .into_iter()
                .filter(|e| node.matches.contains(e))
                .collect()
        };
        self.commit(id, Vec::new(), removed)
    }

    /// Re-validate an id node against the indexer: matches are the
    /// requested ids present at the path, everything else is parked in
    /// `other_query_ids`.
    pub fn refresh_id_query(
        &mut self,
        id: QueryCalcId,
        indexer: &Indexer,
    ) -> Option<MatchDelta> {
        let path = self.get(id).path;
        let requested: Vec<DataElementId> = match &self.get(id).kind {
            QueryCalcKind::Ids { requested, .. } => requested.iter().copied().collect(),
            _ => return None,
        };
        let diff = indexer.filter_data_nodes_at_path_with_diff(path, &requested);
        let present: HashSet<DataElementId> = diff.present.iter().copied().collect();
        if let QueryCalcKind::Ids {
            requested,
            other_query_ids,
        } = &mut self.get_mut(id).kind
        {
            *other_query_ids = requested.difference(&present).copied().collect();
        }
        let (added, removed) = {
            let node = self.get(id);
            let added: Vec<DataElementId> = present
                .iter()
                .copied()
                .filter(|e| !node.matches.contains(e))
                .collect();
            let removed: Vec<DataElementId> = node
                .matches
                .iter()
                .copied()
                .filter(|e| !present.contains(e))
                .collect();
            (added, removed)
        };
        self.commit(id, added, removed)
    }

    // ------------------------------------------------------------------
    // Composite aggregation
    // ------------------------------------------------------------------

    /// A child's delta arrives at its composite parent. Child matches are
    /// raised to the parent's path before aggregation.
    pub fn child_delta(
        &mut self,
        parent: QueryCalcId,
        child: QueryCalcId,
        added: &[DataElementId],
        removed: &[DataElementId],
        indexer: &Indexer,
    ) -> Option<MatchDelta> {
        let parent_path = self.get(parent).path;
        let raise = |ids: &[DataElementId]| -> Vec<DataElementId> {
            ids.iter()
                .filter_map(|&e| indexer.raise_to_path(e, parent_path).ok())
                .collect()
        };
        let raised_added = raise(added);
        let raised_removed = raise(removed);

        {
            let node = self.get_mut(parent);
            let contrib = node.child_contrib.entry(child).or_default();
            for e in &raised_added {
                *contrib.entry(*e).or_insert(0) += 1;
            }
            for e in &raised_removed {
                if let Some(count) = contrib.get_mut(e) {
                    *count -= 1;
                    if *count == 0 {
                        contrib.remove(e);
                    }
                }
            }
        }
        self.reaggregate(parent)
    }

    /// Recompute a composite's matched set from its contributions and emit
    /// the difference.
    fn reaggregate(&mut self, id: QueryCalcId) -> Option<MatchDelta> {
        let new_matches: HashSet<DataElementId> = {
            let node = self.get(id);
            match &node.kind {
                QueryCalcKind::Intersection { children } => {
                    let mut iter = children.iter();
                    let first = iter.next().and_then(|c| node.child_contrib.get(c));
                    match first {
                        Some(first_map) => first_map
                            .keys()
                            .copied()
                            .filter(|e| {
                                children.iter().all(|c| {
                                    node.child_contrib
                                        .get(c)
                                        .is_some_and(|m| m.contains_key(e))
                                })
                            })
                            .collect(),
                        None => HashSet::new(),
                    }
                }
                QueryCalcKind::Union { .. } => node
                    .child_contrib
                    .values()
                    .flat_map(|m| m.keys().copied())
                    .collect(),
                QueryCalcKind::Negation { .. } => {
                    let negated: HashSet<DataElementId> = node
                        .child_contrib
                        .values()
                        .flat_map(|m| m.keys().copied())
                        .collect();
                    node.universe
                        .iter()
                        .copied()
                        .filter(|e| !negated.contains(e))
                        .collect()
                }
                _ => return None,
            }
        };
        let (added, removed) = {
            let node = self.get(id);
            let added: Vec<DataElementId> = new_matches
                .iter()
                .copied()
                .filter(|e| !node.matches.contains(e))
                .collect();
            let removed: Vec<DataElementId> = node
                .matches
                .iter()
                .copied()
                .filter(|e| !new_matches.contains(e))
                .collect();
            (added, removed)
        };
        self.commit(id, added, removed)
    }

    fn negation_universe_add(
        &mut self,
        id: QueryCalcId,
        elements: &[DataElementId],
    ) -> Option<MatchDelta> {
        {
            let node = self.get_mut(id);
            for &e in elements {
                node.universe.insert(e);
            }
        }
        self.reaggregate(id)
    }

    fn negation_universe_remove(
        &mut self,
        id: QueryCalcId,
        elements: &[DataElementId],
    ) -> Option<MatchDelta> {
        {
            let node = self.get_mut(id);
            for e in elements {
                node.universe.remove(e);
            }
        }
        self.reaggregate(id)
    }

    /// Apply a delta to the node's matched set and hand it to the match
    /// parent.
    fn commit(
        &mut self,
        id: QueryCalcId,
        added: Vec<DataElementId>,
        removed: Vec<DataElementId>,
    ) -> Option<MatchDelta> {
        if added.is_empty() && removed.is_empty() {
            return None;
        }
        let node = self.get_mut(id);
        let added: Vec<DataElementId> = added
            .into_iter()
            .filter(|e| node.matches.insert(*e))
            .collect();
        let removed: Vec<DataElementId> = removed
            .into_iter()
            .filter(|e| node.matches.remove(e))
            .collect();
        if added.is_empty() && removed.is_empty() {
            return None;
        }
        Some(MatchDelta {
            source: id,
            parent: node.match_parent,
            added,
            removed,
        })
    }

    /// Cycle-numbered structural refresh: recompute every node of the tree
    /// in pre-order and re-emit its full match set as a delta against what
    /// the parent saw.
    pub fn refresh_query(
        &mut self,
        top: QueryCalcId,
        indexer: &Indexer,
        cycle: u32,
    ) -> Vec<MatchDelta> {
        let mut deltas = Vec::new();
        self.refresh_node(top, indexer, cycle, &mut deltas);
        deltas
    }

    fn refresh_node(
        &mut self,
        id: QueryCalcId,
        indexer: &Indexer,
        cycle: u32,
        deltas: &mut Vec<MatchDelta>,
    ) {
        if self.get(id).refresh_cycle == cycle {
            return;
        }
        self.get_mut(id).refresh_cycle = cycle;
        let path = self.get(id).path;

        enum Plan {
            Replace(Vec<DataElementId>),
            RefreshIds,
            RebuildUniverse,
            Composite,
        }
        let (plan, kind_children) = match &self.get(id).kind {
            QueryCalcKind::True | QueryCalcKind::Projection { .. } => {
                (Plan::Replace(indexer.get_all_matches(path)), Vec::new())
            }
            QueryCalcKind::Simple { selection } => {
                let present: Vec<DataElementId> = indexer
                    .get_all_matches_as_obj(path)
                    .into_iter()
                    .filter(|(_, key)| SingleQualifier::matches(selection, key))
                    .map(|(e, _)| e)
                    .collect();
                (Plan::Replace(present), Vec::new())
            }
            QueryCalcKind::Ids { .. } => (Plan::RefreshIds, Vec::new()),
            QueryCalcKind::Negation { children } => {
                (Plan::RebuildUniverse, children.clone())
            }
            QueryCalcKind::Intersection { children } | QueryCalcKind::Union { children } => {
                (Plan::Composite, children.clone())
            }
        };

        let delta = match plan {
            Plan::Replace(present) => self.replace_matches(id, present),
            Plan::RefreshIds => self.refresh_id_query(id, indexer),
            Plan::RebuildUniverse => {
                self.get_mut(id).universe = indexer.get_all_matches(path).into_iter().collect();
                self.reaggregate(id)
            }
            Plan::Composite => None,
        };
        if let Some(d) = delta {
            deltas.push(d);
        }
        for c in kind_children {
            self.refresh_node(c, indexer, cycle, deltas);
        }
    }

    fn replace_matches(
        &mut self,
        id: QueryCalcId,
        present: Vec<DataElementId>,
    ) -> Option<MatchDelta> {
        let present_set: HashSet<DataElementId> = present.into_iter().collect();
        let (added, removed) = {
            let node = self.get(id);
            let added: Vec<DataElementId> = present_set
                .iter()
                .copied()
                .filter(|e| !node.matches.contains(e))
                .collect();
            let removed: Vec<DataElementId> = node
                .matches
                .iter()
                .copied()
                .filter(|e| !present_set.contains(e))
                .collect();
            (added, removed)
        };
        self.commit(id, added, removed)
    }
}
