//! # Result Nodes
//!
//! Results thread data through a composition chain: a terminal data result
//! draws elements straight from an indexer path, a query result wraps a
//! root query-calculation node, and an identity result decorates its
//! content source with identities. Each result publishes a dominated match
//! set to the results composed on top of it.
//!
//! Activation is reference counted: a result is active* while at least one
//! active composed consumer descends from it, and a pure data result is
//! registered to its indexer path node only while a non-query active
//! consumer needs it (queries register with the indexer directly).

pub mod identity;

use crate::indexer::{DataElementId, IdentificationId, Indexer};
use crate::path::PathId;
use crate::querycalc::root::RootId;
use crate::value::Value;
use identity::IdentityResultState;
use std::collections::{HashMap, HashSet};

/// Arena index of a result node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResultId(pub u32);

/// Side effects the engine must apply after an activation change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultAction {
    RegisterPath { result: ResultId, path: PathId },
    UnregisterPath { result: ResultId, path: PathId },
    AddOrderStar { path: PathId },
    RemoveOrderStar { path: PathId },
}

/// Result variants.
#[derive(Debug)]
pub enum ResultKind {
    /// Terminal data at an indexer path.
    Data {
        path: PathId,
        identification: Option<IdentificationId>,
        replaceable: bool,
        registered_to_path: bool,
    },
    /// Wraps a root query-calculation node.
    Query { root: RootId },
    /// Attaches identities to its content source's elements.
    Identity(IdentityResultState),
}

/// One result node in a composition chain.
#[derive(Debug)]
pub struct ResultNode {
    pub id: ResultId,
    pub kind: ResultKind,
    /// The single data source below this result (identity results carry
    /// their two sources in their state).
    pub data_source: Option<ResultId>,
    /// Results composed on top of this one.
    pub composed: Vec<ResultId>,
    /// Count of active composed consumers (active*).
    pub active_count: u32,
    /// Of those, the ones that are not query results.
    pub non_query_active: u32,
    /// Dominated match set currently published.
    pub matches: HashSet<DataElementId>,
    /// Insertion order of the dominated matches.
    pub match_order: Vec<DataElementId>,
    pub order_star: u32,
    pub queued: bool,
}

impl ResultNode {
    /// Dominated matches equal the content source's (nothing filtered).
    pub fn is_match_transparent(&self) -> bool {
        matches!(self.kind, ResultKind::Identity(_))
    }

    pub fn is_replaceable_terminal_result(&self) -> bool {
        matches!(
            self.kind,
            ResultKind::Data {
                replaceable: true,
                ..
            }
        )
    }

    pub fn is_query(&self) -> bool {
        matches!(self.kind, ResultKind::Query { .. })
    }
}

/// Arena of result nodes.
#[derive(Debug, Default)]
pub struct ResultPool {
    nodes: Vec<ResultNode>,
    /// Data results currently registered per path.
    path_registry: HashMap<PathId, HashSet<ResultId>>,
}

impl ResultPool {
    pub fn new() -> Self {
        ResultPool::default()
    }

    pub fn get(&self, id: ResultId) -> &ResultNode {
        &self.nodes[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: ResultId) -> &mut ResultNode {
        &mut self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn add_node(&mut self, kind: ResultKind) -> ResultId {
        let id = ResultId(self.nodes.len() as u32);
        self.nodes.push(ResultNode {
            id,
            kind,
            data_source: None,
            composed: Vec::new(),
            active_count: 0,
            non_query_active: 0,
            matches: HashSet::new(),
            match_order: Vec::new(),
            order_star: 0,
            queued: false,
        });
        id
    }

    pub fn add_data_result(
        &mut self,
        path: PathId,
        identification: Option<IdentificationId>,
        replaceable: bool,
    ) -> ResultId {
        self.add_node(ResultKind::Data {
            path,
            identification,
            replaceable,
            registered_to_path: false,
        })
    }

    pub fn add_query_result(&mut self, root: RootId) -> ResultId {
        self.add_node(ResultKind::Query { root })
    }

    pub fn add_identity_result(&mut self, state: IdentityResultState) -> ResultId {
        self.add_node(ResultKind::Identity(state))
    }

    // ------------------------------------------------------------------
    // Chain wiring
    // ------------------------------------------------------------------

    /// Compose `consumer` on top of `source`.
    pub fn compose(&mut self, source: ResultId, consumer: ResultId) {
        self.get_mut(consumer).data_source = Some(source);
        let composed = &mut self.get_mut(source).composed;
        if !composed.contains(&consumer) {
            composed.push(consumer);
        }
    }

    /// Rewire `consumer` onto a new source. Replacing a terminal data
    /// source requires it to be replaceable.
    pub fn set_data(&mut self, consumer: ResultId, new_source: ResultId) -> bool {
        if let Some(old) = self.get(consumer).data_source {
            let old_node = self.get(old);
            if matches!(old_node.kind, ResultKind::Data { .. })
                && !old_node.is_replaceable_terminal_result()
            {
                return false;
            }
            self.get_mut(old).composed.retain(|&c| c != consumer);
        }
        self.compose(new_source, consumer);
        true
    }

    /// Replace the terminal data at the bottom of `consumer`'s chain.
    pub fn set_terminal_data(&mut self, consumer: ResultId, new_terminal: ResultId) -> bool {
        let mut cur = consumer;
        while let Some(source) = self.get(cur).data_source {
            if matches!(self.get(source).kind, ResultKind::Data { .. }) {
                let replaceable = self.get(source).is_replaceable_terminal_result();
                if !replaceable {
                    return false;
                }
                self.get_mut(source).composed.retain(|&c| c != cur);
                self.compose(new_terminal, cur);
                return true;
            }
            cur = source;
        }
        self.compose(new_terminal, cur);
        true
    }

    // ------------------------------------------------------------------
    // Activation
    // ------------------------------------------------------------------

    /// A composed consumer is about to become active on `id`. Propagates
    /// the active* count down the chain; a data result registers to its
    /// path node when its first non-query active consumer arrives.
    pub fn about_to_add_active_composed(
        &mut self,
        id: ResultId,
        consumer_is_query: bool,
        actions: &mut Vec<ResultAction>,
    ) {
        let node = self.get_mut(id);
        node.active_count += 1;
        if !consumer_is_query {
            node.non_query_active += 1;
        }
        let first_active = node.active_count == 1;
        let first_non_query = !consumer_is_query && node.non_query_active == 1;
        if first_non_query {
            let newly_registered = match &mut self.get_mut(id).kind {
                ResultKind::Data {
                    path,
                    registered_to_path,
                    ..
                } if !*registered_to_path => {
                    *registered_to_path = true;
                    Some(*path)
                }
                _ => None,
            };
            if let Some(path) = newly_registered {
                self.path_registry.entry(path).or_default().insert(id);
                actions.push(ResultAction::RegisterPath { result: id, path });
            }
        }
        if first_active {
            let is_query = self.get(id).is_query();
            let sources = self.sources_of(id);
            for s in sources {
                self.about_to_add_active_composed(s, is_query, actions);
            }
        }
    }

    /// Inverse of [`ResultPool::about_to_add_active_composed`].
    pub fn active_composed_removed(
        &mut self,
        id: ResultId,
        consumer_is_query: bool,
        actions: &mut Vec<ResultAction>,
    ) {
        let node = self.get_mut(id);
        debug_assert!(node.active_count > 0);
        node.active_count = node.active_count.saturating_sub(1);
        if !consumer_is_query {
            node.non_query_active = node.non_query_active.saturating_sub(1);
        }
        let last_active = node.active_count == 0;
        let last_non_query = !consumer_is_query && node.non_query_active == 0;
        if last_non_query {
            let newly_unregistered = match &mut self.get_mut(id).kind {
                ResultKind::Data {
                    path,
                    registered_to_path,
                    ..
                } if *registered_to_path => {
                    *registered_to_path = false;
                    Some(*path)
                }
                _ => None,
            };
            if let Some(path) = newly_unregistered {
                if let Some(set) = self.path_registry.get_mut(&path) {
                    set.remove(&id);
                }
                actions.push(ResultAction::UnregisterPath { result: id, path });
            }
        }
        if last_active {
            let is_query = self.get(id).is_query();
            let sources = self.sources_of(id);
            for s in sources {
                self.active_composed_removed(s, is_query, actions);
            }
        }
    }

    fn sources_of(&self, id: ResultId) -> Vec<ResultId> {
        let node = self.get(id);
        match &node.kind {
            ResultKind::Identity(state) => {
                let mut out = Vec::new();
                if let Some(s) = state.identified {
                    out.push(s);
                }
                if let Some(s) = state.identification_source {
                    out.push(s);
                }
                out
            }
            _ => node.data_source.into_iter().collect(),
        }
    }

    pub fn is_active(&self, id: ResultId) -> bool {
        self.get(id).active_count > 0
    }

    /// Data results registered at a path.
    pub fn registered_at_path(&self, path: PathId) -> Vec<ResultId> {
        self.path_registry
            .get(&path)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Order-star interest
    // ------------------------------------------------------------------

    /// Composed order interest propagates down the chain so the terminal
    /// data's indexer can maintain ordered outputs.
    pub fn add_order_star(&mut self, id: ResultId, actions: &mut Vec<ResultAction>) {
        let node = self.get_mut(id);
        node.order_star += 1;
        if node.order_star == 1 {
            if let ResultKind::Data { path, .. } = &self.get(id).kind {
                actions.push(ResultAction::AddOrderStar { path: *path });
            }
            for s in self.sources_of(id) {
                self.add_order_star(s, actions);
            }
        }
    }

    pub fn remove_order_star(&mut self, id: ResultId, actions: &mut Vec<ResultAction>) {
        let node = self.get_mut(id);
        if node.order_star == 0 {
            return;
        }
        node.order_star -= 1;
        if node.order_star == 0 {
            if let ResultKind::Data { path, .. } = &self.get(id).kind {
                actions.push(ResultAction::RemoveOrderStar { path: *path });
            }
            for s in self.sources_of(id) {
                self.remove_order_star(s, actions);
            }
        }
    }

    // ------------------------------------------------------------------
    // Dominated matches
    // ------------------------------------------------------------------

    /// Apply a match delta from the result's data source; returns the
    /// delta this result publishes to its composed consumers.
    pub fn apply_matches(
        &mut self,
        id: ResultId,
        added: &[DataElementId],
        removed: &[DataElementId],
    ) -> (Vec<DataElementId>, Vec<DataElementId>) {
        let node = self.get_mut(id);
        let mut pub_added = Vec::new();
        let mut pub_removed = Vec::new();
        for &e in added {
            if node.matches.insert(e) {
                node.match_order.push(e);
                pub_added.push(e);
            }
        }
        for &e in removed {
            if node.matches.remove(&e) {
                node.match_order.retain(|&m| m != e);
                pub_removed.push(e);
            }
        }
        (pub_added, pub_removed)
    }

    /// Replace the whole dominated set (queued full pushes).
    pub fn replace_matches(
        &mut self,
        id: ResultId,
        elements: Vec<DataElementId>,
    ) -> (Vec<DataElementId>, Vec<DataElementId>) {
        let new: HashSet<DataElementId> = elements.iter().copied().collect();
        let removed: Vec<DataElementId> = {
            let node = self.get(id);
            node.matches.difference(&new).copied().collect()
        };
        let added: Vec<DataElementId> = {
            let node = self.get(id);
            elements
                .iter()
                .copied()
                .filter(|e| !node.matches.contains(e))
                .collect()
        };
        self.apply_matches(id, &added, &removed)
    }

    pub fn remove_all_matches(&mut self, id: ResultId) -> Vec<DataElementId> {
        let node = self.get_mut(id);
        let removed = std::mem::take(&mut node.match_order);
        node.matches.clear();
        removed
    }

    pub fn get_dominated_matches(&self, id: ResultId) -> Vec<DataElementId> {
        self.get(id).match_order.clone()
    }

    pub fn get_dominated_matches_as_obj(
        &self,
        id: ResultId,
        indexer: &Indexer,
    ) -> HashMap<DataElementId, Value> {
        let path = self.get_dominated_proj_path(id);
        self.get(id)
            .match_order
            .iter()
            .map(|&e| {
                let v = path
                    .and_then(|p| indexer.get_key(p, e).cloned())
                    .unwrap_or(Value::Undefined);
                (e, v)
            })
            .collect()
    }

    /// The ids of `candidates` currently dominated by this result.
    pub fn filter_dominated_matches(
        &self,
        id: ResultId,
        candidates: &[DataElementId],
    ) -> Vec<DataElementId> {
        let node = self.get(id);
        candidates
            .iter()
            .copied()
            .filter(|e| node.matches.contains(e))
            .collect()
    }

    /// Positions (into `candidates`) of the dominated ids.
    pub fn filter_dominated_matches_positions(
        &self,
        id: ResultId,
        candidates: &[DataElementId],
    ) -> Vec<usize> {
        let node = self.get(id);
        candidates
            .iter()
            .enumerate()
            .filter(|(_, e)| node.matches.contains(e))
            .map(|(i, _)| i)
            .collect()
    }

    /// Path the result's dominated matches live at; follows the chain for
    /// match-transparent results.
    pub fn get_dominated_proj_path(&self, id: ResultId) -> Option<PathId> {
        let mut cur = id;
        loop {
            let node = self.get(cur);
            match &node.kind {
                ResultKind::Data { path, .. } => return Some(*path),
                ResultKind::Identity(state) => {
                    cur = state.identified.or(node.data_source)?;
                }
                ResultKind::Query { .. } => {
                    cur = node.data_source?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activation_registers_terminal_data_once() {
        let mut pool = ResultPool::new();
        let data = pool.add_data_result(PathId(1), None, false);
        let mut actions = Vec::new();
        pool.about_to_add_active_composed(data, false, &mut actions);
        assert_eq!(
            actions,
            vec![ResultAction::RegisterPath {
                result: data,
                path: PathId(1)
            }]
        );
        actions.clear();
        pool.about_to_add_active_composed(data, false, &mut actions);
        assert!(actions.is_empty());
        pool.active_composed_removed(data, false, &mut actions);
        assert!(actions.is_empty());
        pool.active_composed_removed(data, false, &mut actions);
        assert_eq!(
            actions,
            vec![ResultAction::UnregisterPath {
                result: data,
                path: PathId(1)
            }]
        );
    }

    #[test]
    fn query_consumers_do_not_register_data_paths() {
        let mut pool = ResultPool::new();
        let data = pool.add_data_result(PathId(1), None, false);
        let mut actions = Vec::new();
        pool.about_to_add_active_composed(data, true, &mut actions);
        assert!(actions.is_empty());
    }

    #[test]
    fn set_data_respects_replaceability() {
        let mut pool = ResultPool::new();
        let fixed = pool.add_data_result(PathId(1), None, false);
        let replaceable = pool.add_data_result(PathId(2), None, true);
        let other = pool.add_data_result(PathId(3), None, false);
        let query = pool.add_query_result(RootId(0));

        pool.compose(fixed, query);
        assert!(!pool.set_data(query, other));

        let query2 = pool.add_query_result(RootId(1));
        pool.compose(replaceable, query2);
        assert!(pool.set_data(query2, other));
        assert_eq!(pool.get(query2).data_source, Some(other));
        assert!(!pool.get(replaceable).composed.contains(&query2));
    }

    #[test]
    fn dominated_match_filtering() {
        let mut pool = ResultPool::new();
        let data = pool.add_data_result(PathId(1), None, false);
        let (added, _) = pool.apply_matches(
            data,
            &[DataElementId(1), DataElementId(2), DataElementId(3)],
            &[],
        );
        assert_eq!(added.len(), 3);
        let filtered = pool.filter_dominated_matches(
            data,
            &[DataElementId(2), DataElementId(9)],
        );
        assert_eq!(filtered, vec![DataElementId(2)]);
        let positions = pool.filter_dominated_matches_positions(
            data,
            &[DataElementId(9), DataElementId(3)],
        );
        assert_eq!(positions, vec![1]);
    }
}
