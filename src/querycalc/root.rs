//! Root Query-Calculation Node
//!
//! The interface between result nodes and the top node of a
//! query-calculation tree. The root raises incoming matches to the query's
//! prefix path (reference counted, so multi-level matches emit exactly
//! once), lowers a result's selection matches to the registered lower match
//! points when projection matches are requested, and keeps the bookkeeping
//! of generating projections for multi-projection queries.
//!
//! During a structural refresh the previous raise table is parked in
//! `suspended_raised` so removal updates that still originate from the old
//! query structure resolve correctly, and queued result nodes receive one
//! full match push at refresh end instead of incremental deltas.

use super::{QueryCalcId, QueryCalcPool};
use crate::indexer::{DataElementId, Indexer};
use crate::path::PathId;
use crate::result::ResultId;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Arena index of a root query-calculation node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RootId(pub u32);

/// A projection that emits into the result (merge) indexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratingProjEntry {
    pub query_calc: QueryCalcId,
    pub path_id: PathId,
    pub parent: Option<QueryCalcId>,
    pub parent_attr: Option<Arc<str>>,
    /// Path the projection maps its matches to in the result indexer.
    pub mapped_path_id: PathId,
}

/// Updates the root addresses to its registered result nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum RootNotification {
    AddMatches {
        result: ResultId,
        elements: Vec<DataElementId>,
    },
    RemoveMatches {
        result: ResultId,
        elements: Vec<DataElementId>,
    },
    RemoveAllMatches { result: ResultId },
    /// The set of generating projections changed.
    ProjChanged {
        result: ResultId,
        added: Vec<GeneratingProjEntry>,
        removed: Vec<QueryCalcId>,
    },
    /// Full match set pushed to a queued result at refresh end.
    FullMatchSet {
        result: ResultId,
        elements: Vec<DataElementId>,
    },
}

/// Mediates between one query-calculation tree and N result nodes.
#[derive(Debug)]
pub struct RootQueryCalc {
    pub id: RootId,
    pub prefix_path: PathId,
    pub query_calc: Option<QueryCalcId>,
    results: Vec<ResultId>,
    queued: HashSet<ResultId>,
    /// Raised id -> number of raw matches currently raising to it.
    raised_matches: HashMap<DataElementId, u32>,
    /// Raise table snapshot held across a structural refresh.
    suspended_raised: Option<HashMap<DataElementId, u32>>,
    pub lower_match_points: BTreeSet<PathId>,
    pub generating_projs: HashMap<QueryCalcId, GeneratingProjEntry>,
    pub is_projection: bool,
}

impl RootQueryCalc {
    pub fn new(id: RootId, prefix_path: PathId) -> Self {
        RootQueryCalc {
            id,
            prefix_path,
            query_calc: None,
            results: Vec::new(),
            queued: HashSet::new(),
            raised_matches: HashMap::new(),
            suspended_raised: None,
            lower_match_points: BTreeSet::new(),
            generating_projs: HashMap::new(),
            is_projection: false,
        }
    }

    pub fn register_result(&mut self, result: ResultId) -> RootNotification {
        if !self.results.contains(&result) {
            self.results.push(result);
        }
        RootNotification::FullMatchSet {
            result,
            elements: self.emitted_matches(),
        }
    }

    pub fn unregister_result(&mut self, result: ResultId) {
        self.results.retain(|&r| r != result);
        self.queued.remove(&result);
    }

    /// Queue a result: incremental updates bypass it until
    /// [`RootQueryCalc::flush_queued`] pushes the full set.
    pub fn queue_result(&mut self, result: ResultId) {
        self.queued.insert(result);
    }

    pub fn results(&self) -> &[ResultId] {
        &self.results
    }

    /// The match set currently visible to result nodes.
    pub fn emitted_matches(&self) -> Vec<DataElementId> {
        self.raised_matches.keys().copied().collect()
    }

    pub fn raised_count(&self, id: DataElementId) -> u32 {
        self.raised_matches.get(&id).copied().unwrap_or(0)
    }

    /// Sum of all raise counts (test surface for the count invariant).
    pub fn total_raised_count(&self) -> u64 {
        self.raised_matches.values().map(|&c| u64::from(c)).sum()
    }

    fn raising_needed(&self, indexer: &Indexer) -> bool {
        let paths = indexer.path_store();
        let store = paths.borrow();
        let prefix_len = store.path_len(self.prefix_path);
        self.lower_match_points
            .iter()
            .any(|&p| store.path_len(p) > prefix_len)
    }

    // ------------------------------------------------------------------
    // Match flow from the top node
    // ------------------------------------------------------------------

    /// A delta from the top query-calc node. Raw ids raise to the prefix
    /// path; the first arrival of a raised id emits an add, later arrivals
    /// only count. Removal is symmetric, consulting the suspended table for
    /// ids raised under the previous query structure.
    pub fn top_delta(
        &mut self,
        added: &[DataElementId],
        removed: &[DataElementId],
        indexer: &Indexer,
    ) -> Vec<RootNotification> {
        let raising = self.raising_needed(indexer) || !self.raised_matches.is_empty();
        let mut emitted_add = Vec::new();
        let mut emitted_remove = Vec::new();

        for &raw in added {
            let raised = if raising {
                indexer.raise_to_path(raw, self.prefix_path).unwrap_or(raw)
            } else {
                raw
            };
            let count = self.raised_matches.entry(raised).or_insert(0);
            *count += 1;
            if *count == 1 {
                emitted_add.push(raised);
            }
        }
        for &raw in removed {
            let raised = if raising {
                indexer.raise_to_path(raw, self.prefix_path).unwrap_or(raw)
            } else {
                raw
            };
            let resolved = if self.raised_matches.contains_key(&raised) {
                Some(raised)
            } else {
                // The raw id may have been raised under the old structure.
                self.suspended_raised
                    .as_ref()
                    .and_then(|s| s.contains_key(&raised).then_some(raised))
            };
            let Some(target) = resolved else {
                continue;
            };
            if let Some(count) = self.raised_matches.get_mut(&target) {
                *count -= 1;
                if *count == 0 {
                    self.raised_matches.remove(&target);
                    emitted_remove.push(target);
                }
            } else if let Some(suspended) = self.suspended_raised.as_mut() {
                if let Some(count) = suspended.get_mut(&target) {
                    *count -= 1;
                    if *count == 0 {
                        suspended.remove(&target);
                        emitted_remove.push(target);
                    }
                }
            }
        }

        self.emit(emitted_add, emitted_remove)
    }

    fn emit(
        &self,
        added: Vec<DataElementId>,
        removed: Vec<DataElementId>,
    ) -> Vec<RootNotification> {
        let mut out = Vec::new();
        for &result in &self.results {
            if self.queued.contains(&result) {
                continue;
            }
            if !added.is_empty() {
                out.push(RootNotification::AddMatches {
                    result,
                    elements: added.clone(),
                });
            }
            if !removed.is_empty() {
                out.push(RootNotification::RemoveMatches {
                    result,
                    elements: removed.clone(),
                });
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Structural changes
    // ------------------------------------------------------------------

    /// Swap in a new top query-calc node. Detaching a selection clears its
    /// emitted matches first; the raise table is parked so late removals
    /// from the old structure still resolve; the new top's matches re-emit
    /// in full.
    pub fn assign_query_calc(
        &mut self,
        new_top: Option<QueryCalcId>,
        pool: &mut QueryCalcPool,
        indexer: &Indexer,
        is_projection: bool,
    ) -> Vec<RootNotification> {
        let mut out = Vec::new();
        if self.query_calc.is_some() && !self.is_projection {
            // removeAllSelectionMatches
            for &result in &self.results {
                out.push(RootNotification::RemoveAllMatches { result });
            }
        }
        self.suspended_raised = Some(std::mem::take(&mut self.raised_matches));
        self.query_calc = new_top;
        self.is_projection = is_projection;

        if let Some(top) = new_top {
            pool.get_mut(top).match_parent = super::MatchParent::Root(self.id);
            self.lower_match_points = pool.get(top).match_points.iter().copied().collect();
            let matches: Vec<DataElementId> = pool.get(top).matches.iter().copied().collect();
            out.extend(self.top_delta(&matches, &[], indexer));
        }
        self.suspended_raised = None;
        out
    }

    pub fn set_lower_match_points(&mut self, paths: Vec<PathId>) {
        self.lower_match_points = paths.into_iter().collect();
    }

    pub fn add_lower_match_point(&mut self, path: PathId) {
        self.lower_match_points.insert(path);
    }

    pub fn remove_lower_match_point(&mut self, path: PathId) {
        self.lower_match_points.remove(&path);
    }

    /// Park the raise table for the duration of a refresh.
    pub fn suspend_raised(&mut self) {
        if self.suspended_raised.is_none() {
            self.suspended_raised = Some(self.raised_matches.clone());
        }
    }

    pub fn resume_raised(&mut self) {
        self.suspended_raised = None;
    }

    // ------------------------------------------------------------------
    // Projection matches
    // ------------------------------------------------------------------

    /// Lower a result's selection matches to every registered lower match
    /// point; the union is the projection-match input of the top node.
    pub fn get_projection_matches(
        &self,
        selection_matches: &[DataElementId],
        indexer: &Indexer,
    ) -> Vec<DataElementId> {
        let lower: Vec<PathId> = self.lower_match_points.iter().copied().collect();
        match indexer.lower_data_elements_to(selection_matches, &lower) {
            Ok(ids) => {
                let mut seen = HashSet::new();
                ids.into_iter().filter(|id| seen.insert(*id)).collect()
            }
            Err(_) => selection_matches.to_vec(),
        }
    }

    // ------------------------------------------------------------------
    // Generating projections
    // ------------------------------------------------------------------

    pub fn terminal_generating_proj_num(&self) -> usize {
        self.generating_projs.len()
    }

    pub fn is_multi_projection(&self) -> bool {
        self.generating_projs.len() > 1
    }

    /// Replace the generating-projection set and tell results what changed
    /// so their downstream merge indexers can reconfigure.
    pub fn update_generating_projs(
        &mut self,
        entries: Vec<GeneratingProjEntry>,
    ) -> Vec<RootNotification> {
        let new: HashMap<QueryCalcId, GeneratingProjEntry> = entries
            .into_iter()
            .map(|e| (e.query_calc, e))
            .collect();
        let added: Vec<GeneratingProjEntry> = new
            .values()
            .filter(|&e| self.generating_projs.get(&e.query_calc) != Some(e))
            .cloned()
            .collect();
        let removed: Vec<QueryCalcId> = self
            .generating_projs
            .keys()
            .copied()
            .filter(|qc| !new.contains_key(qc))
            .collect();
        self.generating_projs = new;
        if added.is_empty() && removed.is_empty() {
            return Vec::new();
        }
        self.results
            .iter()
            .map(|&result| RootNotification::ProjChanged {
                result,
                added: added.clone(),
                removed: removed.clone(),
            })
            .collect()
    }

    /// Push the full match set to every queued result and unqueue them.
    pub fn flush_queued(&mut self) -> Vec<RootNotification> {
        let matches = self.emitted_matches();
        let queued: Vec<ResultId> = self.queued.drain().collect();
        queued
            .into_iter()
            .map(|result| RootNotification::FullMatchSet {
                result,
                elements: matches.clone(),
            })
            .collect()
    }
}
