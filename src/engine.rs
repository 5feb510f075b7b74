//! # Query Engine
//!
//! The facade owning every subsystem: the compiler (expressions, templates,
//! function nodes), the indexer, the query-calculation pools with their
//! roots, the result chains, the merge side tables, the write queue and the
//! cooperative scheduler.
//!
//! ```text
//! Expression --[Compiler]--> FunctionNode
//! Query      --[decompose]-> QueryDesc --[build]--> query-calc tree
//!                                               \-> RootQueryCalc -> results
//! Data edits --[Indexer notifications]--> dispatch loop --> quiescence
//! ```
//!
//! The engine is single-threaded and task-driven: data edits queue indexer
//! notifications, [`QueryEngine::run_until_quiescent`] drains them through
//! the scheduler's priority order (content before write commits, writes
//! before messages) until nothing remains.

use crate::compiler::{Compiler, SharedPathStore};
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::expression::{ExprId, QueryComponent};
use crate::fnode::{DefunId, FnId, FunctionNodeKind};
use crate::indexer::{
    DataElementId, IdentificationId, Indexer, IndexerNotification, MonitorId,
};
use crate::merge::{ChildrenByIdentity, MappedDataElements};
use crate::path::{PathId, PathStore};
use crate::querycalc::root::{
    GeneratingProjEntry, RootId, RootNotification, RootQueryCalc,
};
use crate::querycalc::{
    MatchDelta, MatchParent, QueryCalcId, QueryCalcKind, QueryCalcPool, QueryDesc,
};
use crate::result::identity::IdentityResultState;
use crate::result::{ResultAction, ResultId, ResultKind, ResultPool};
use crate::scheduler::{TaskKind, TaskQueue};
use crate::template::TemplateId;
use crate::value::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Pending writes to writable nodes, published atomically at commit.
#[derive(Debug, Default)]
struct WriteQueue {
    pending: Vec<(FnId, Value)>,
}

/// The reactive query engine.
pub struct QueryEngine {
    pub config: Config,
    pub compiler: Compiler,
    pub indexer: Indexer,
    pub querycalcs: QueryCalcPool,
    roots: Vec<RootQueryCalc>,
    pub results: ResultPool,
    pub children_by_identity: ChildrenByIdentity,
    pub mapped_elements: MappedDataElements,
    scheduler: TaskQueue,
    writes: WriteQueue,
    /// Published writable values.
    writable_values: HashMap<FnId, Value>,
    monitor_owner: HashMap<MonitorId, ResultId>,
    next_monitor: u32,
    next_identification: u32,
    refresh_cycle: u32,
}

impl QueryEngine {
    pub fn new(config: Config) -> Self {
        let paths: SharedPathStore = Rc::new(RefCell::new(PathStore::new()));
        let compiler = Compiler::new(
            paths.clone(),
            config.optimization.clone(),
            config.scheduler.max_export_reentry,
        );
        let indexer = Indexer::new(paths);
        let scheduler = TaskQueue::new(config.scheduler.max_content_cycles);
        QueryEngine {
            config,
            compiler,
            indexer,
            querycalcs: QueryCalcPool::new(),
            roots: Vec::new(),
            results: ResultPool::new(),
            children_by_identity: ChildrenByIdentity::new(),
            // Merge targets allocate from a high namespace so they never
            // collide with indexer element ids.
            mapped_elements: MappedDataElements::new(1 << 48),
            scheduler,
            writes: WriteQueue::default(),
            writable_values: HashMap::new(),
            monitor_owner: HashMap::new(),
            next_monitor: 1,
            next_identification: 1,
            refresh_cycle: 0,
        }
    }

    pub fn root(&self, id: RootId) -> &RootQueryCalc {
        &self.roots[id.0 as usize]
    }

    /// Output-change signals accumulated by compilation; consumers drain
    /// these to invalidate downstream caches.
    pub fn drain_output_signals(&mut self) -> Vec<crate::fnode::OutputSignal> {
        self.compiler.drain_signals()
    }

    pub fn root_mut(&mut self, id: RootId) -> &mut RootQueryCalc {
        &mut self.roots[id.0 as usize]
    }

    // ------------------------------------------------------------------
    // Data edits
    // ------------------------------------------------------------------

    /// Insert a data element and schedule propagation.
    pub fn add_data_element(
        &mut self,
        path: PathId,
        parent: Option<DataElementId>,
        key: Option<Value>,
    ) -> EngineResult<DataElementId> {
        let id = self.indexer.add_data_element(path, parent, key)?;
        for result in self.results.registered_at_path(path) {
            let (added, removed) = self.results.apply_matches(result, &[id], &[]);
            self.forward_result_delta(result, &added, &removed);
        }
        self.scheduler.schedule(TaskKind::ContentRefresh);
        Ok(id)
    }

    pub fn remove_data_element(&mut self, id: DataElementId) -> EngineResult<()> {
        let path = self.indexer.get_path_id(id);
        self.indexer.remove_data_element(id)?;
        if let Some(path) = path {
            for result in self.results.registered_at_path(path) {
                let (added, removed) = self.results.apply_matches(result, &[], &[id]);
                self.forward_result_delta(result, &added, &removed);
            }
        }
        self.scheduler.schedule(TaskKind::ContentRefresh);
        Ok(())
    }

    pub fn update_key(&mut self, path: PathId, id: DataElementId, value: Value) {
        self.indexer.update_keys(path, id, value);
        self.scheduler.schedule(TaskKind::ContentRefresh);
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Compile a query expression into a tree description rooted at
    /// `prefix_path`. Selection terminals must compile to constants; a
    /// non-constant selection degrades to a warned always-true term.
    pub fn query_desc_from_expr(&mut self, query: ExprId, prefix_path: PathId) -> QueryDesc {
        let normalized = self.compiler.exprs.normalize_query(query);
        let components = self.compiler.exprs.extract_query_components(normalized);
        let mut positives = Vec::new();
        let mut negatives = Vec::new();
        for component in components {
            match component {
                QueryComponent::Select {
                    path,
                    positive,
                    selection,
                } => {
                    let path_id = self.allocate_component_path(prefix_path, &path);
                    let value = self.selection_value(selection);
                    let desc = QueryDesc::Simple {
                        path: path_id,
                        selection: value,
                    };
                    if positive {
                        positives.push(desc);
                    } else {
                        negatives.push(desc);
                    }
                }
                QueryComponent::Project { path, destination } => {
                    let path_id = self.allocate_component_path(prefix_path, &path);
                    let mapped = {
                        let store = self.indexer.path_store();
                        let mut store = store.borrow_mut();
                        let mut cur = store.get_root_path_id();
                        for attr in &destination {
                            let next = store.allocate_path_id(cur, attr);
                            cur = next;
                        }
                        cur
                    };
                    positives.push(QueryDesc::Projection {
                        path: path_id,
                        mapped_path: mapped,
                    });
                }
            }
        }
        if !negatives.is_empty() {
            positives.push(QueryDesc::Negation {
                path: prefix_path,
                negated: negatives,
            });
        }
        match positives.len() {
            0 => QueryDesc::True,
            1 => positives.pop().unwrap_or(QueryDesc::True),
            _ => QueryDesc::Intersection(positives),
        }
    }

    fn allocate_component_path(
        &mut self,
        prefix: PathId,
        attrs: &[std::sync::Arc<str>],
    ) -> PathId {
        let store = self.indexer.path_store();
        let mut store = store.borrow_mut();
        let mut cur = prefix;
        for attr in attrs {
            let next = store.allocate_path_id(cur, attr);
            cur = next;
        }
        cur
    }

    /// The constant value of a selection terminal.
    fn selection_value(&mut self, selection: ExprId) -> Value {
        let node = self.compiler.build_simple_function_node(
            selection,
            None,
            TemplateId::GLOBAL,
            DefunId::NONE,
            false,
            &[],
            &[],
            Some(selection),
            TemplateId::GLOBAL,
        );
        match self.compiler.pool.const_value(node) {
            Some(v) => v.clone(),
            None => {
                self.compiler
                    .cx
                    .warnings
                    .warn("non-constant selection treated as match-anything");
                Value::Projector
            }
        }
    }

    /// Attach a query to the indexer: builds the tree, a root node, and a
    /// query result registered with it. The initial matches propagate on
    /// the next run to quiescence.
    pub fn attach_query(&mut self, desc: &QueryDesc, prefix_path: PathId) -> (RootId, ResultId) {
        let root_id = RootId(self.roots.len() as u32);
        let mut root = RootQueryCalc::new(root_id, prefix_path);
        let top = self.querycalcs.build(desc, &mut self.indexer, prefix_path);
        let is_projection = self.tree_has_projection(top);
        let notifications =
            root.assign_query_calc(Some(top), &mut self.querycalcs, &self.indexer, is_projection);
        let result = self.results.add_query_result(root_id);
        let seed = root.register_result(result);
        self.roots.push(root);
        self.apply_root_notifications(notifications);
        self.apply_root_notifications(vec![seed]);
        self.refresh_generating_projs(root_id);
        self.scheduler.schedule(TaskKind::ContentRefresh);
        (root_id, result)
    }

    fn tree_has_projection(&self, id: QueryCalcId) -> bool {
        let node = self.querycalcs.get(id);
        match &node.kind {
            QueryCalcKind::Projection { .. } => true,
            QueryCalcKind::Intersection { children }
            | QueryCalcKind::Union { children }
            | QueryCalcKind::Negation { children } => children
                .iter()
                .any(|&c| self.tree_has_projection(c)),
            _ => false,
        }
    }

    /// Structural refresh of an attached query: cycle-numbered tree
    /// refresh, generating-projection diff, queued full pushes.
    pub fn refresh_query(&mut self, root_id: RootId) {
        self.refresh_cycle += 1;
        let cycle = self.refresh_cycle;
        let Some(top) = self.root(root_id).query_calc else {
            return;
        };
        // Active results replay their projections at refresh end.
        let registered: Vec<ResultId> = self.root(root_id).results().to_vec();
        for result in registered {
            if self.results.is_active(result) {
                self.root_mut(root_id).queue_result(result);
            }
        }
        self.root_mut(root_id).suspend_raised();
        let deltas = self.querycalcs.refresh_query(top, &self.indexer, cycle);
        for delta in deltas {
            self.propagate_delta(delta);
        }
        self.refresh_generating_projs(root_id);
        self.root_mut(root_id).resume_raised();
        let flushed = self.root_mut(root_id).flush_queued();
        self.apply_root_notifications(flushed);
    }

    /// Recompute the generating projections of a root: projection
    /// terminals, intersections with two or more projection sub-nodes, and
    /// an un-dominated selection-projection top.
    fn refresh_generating_projs(&mut self, root_id: RootId) {
        let Some(top) = self.root(root_id).query_calc else {
            return;
        };
        let mut entries = Vec::new();
        self.collect_generating_projs(top, None, &mut entries);
        if entries.is_empty() && self.root(root_id).is_projection {
            let node = self.querycalcs.get(top);
            entries.push(GeneratingProjEntry {
                query_calc: top,
                path_id: node.path,
                parent: None,
                parent_attr: None,
                mapped_path_id: node.path,
            });
        }
        let notifications = self.root_mut(root_id).update_generating_projs(entries);
        self.apply_root_notifications(notifications);
    }

    fn collect_generating_projs(
        &self,
        id: QueryCalcId,
        parent: Option<QueryCalcId>,
        out: &mut Vec<GeneratingProjEntry>,
    ) {
        let node = self.querycalcs.get(id);
        match &node.kind {
            QueryCalcKind::Projection { mapped_path } => {
                let parent_attr = parent.and_then(|p| {
                    let parent_path = self.querycalcs.get(p).path;
                    self.indexer.get_first_attr_after_prefix(parent_path, node.path)
                });
                out.push(GeneratingProjEntry {
                    query_calc: id,
                    path_id: node.path,
                    parent,
                    parent_attr,
                    mapped_path_id: *mapped_path,
                });
            }
            QueryCalcKind::Intersection { children } => {
                let proj_children: Vec<QueryCalcId> = children
                    .iter()
                    .copied()
                    .filter(|&c| self.querycalcs.get(c).is_projection())
                    .collect();
                if proj_children.len() >= 2 {
                    // The intersection itself generates; its children map
                    // through it.
                    out.push(GeneratingProjEntry {
                        query_calc: id,
                        path_id: node.path,
                        parent,
                        parent_attr: None,
                        mapped_path_id: node.path,
                    });
                }
                for &c in children {
                    self.collect_generating_projs(c, Some(id), out);
                }
            }
            QueryCalcKind::Union { children } | QueryCalcKind::Negation { children } => {
                for &c in children {
                    self.collect_generating_projs(c, Some(id), out);
                }
            }
            _ => {}
        }
    }

    /// Projection matches of a result: its selection matches lowered to
    /// the root's lower match points.
    pub fn projection_matches(&self, root_id: RootId, result: ResultId) -> Vec<DataElementId> {
        let selection = self.results.get_dominated_matches(result);
        self.root(root_id)
            .get_projection_matches(&selection, &self.indexer)
    }

    // ------------------------------------------------------------------
    // Activation
    // ------------------------------------------------------------------

    /// An external (non-query) consumer starts using a result; data results
    /// down the chain register to their path nodes and seed their matches.
    pub fn activate_result(&mut self, id: ResultId) {
        let mut actions = Vec::new();
        self.results
            .about_to_add_active_composed(id, false, &mut actions);
        self.apply_result_actions(actions);
    }

    pub fn deactivate_result(&mut self, id: ResultId) {
        let mut actions = Vec::new();
        self.results
            .active_composed_removed(id, false, &mut actions);
        self.apply_result_actions(actions);
    }

    /// Composed order interest propagates down so the indexer maintains
    /// ordered outputs at the terminal paths.
    pub fn add_order_star(&mut self, id: ResultId) {
        let mut actions = Vec::new();
        self.results.add_order_star(id, &mut actions);
        self.apply_result_actions(actions);
    }

    pub fn remove_order_star(&mut self, id: ResultId) {
        let mut actions = Vec::new();
        self.results.remove_order_star(id, &mut actions);
        self.apply_result_actions(actions);
    }

    fn apply_result_actions(&mut self, actions: Vec<ResultAction>) {
        for action in actions {
            match action {
                ResultAction::RegisterPath { result, path } => {
                    let present = self.indexer.get_all_matches(path);
                    let (added, removed) = self.results.apply_matches(result, &present, &[]);
                    self.forward_result_delta(result, &added, &removed);
                }
                ResultAction::UnregisterPath { result, .. } => {
                    let removed = self.results.remove_all_matches(result);
                    self.forward_result_delta(result, &[], &removed);
                }
                ResultAction::AddOrderStar { path } => {
                    self.indexer.add_order_star_func_at_path(path);
                }
                ResultAction::RemoveOrderStar { path } => {
                    self.indexer.remove_order_star_func_at_path(path);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Identity results
    // ------------------------------------------------------------------

    /// Create an identity result over an identified path; `fixed` selects
    /// constant identities, otherwise compressed key values are used.
    pub fn add_identity_result(
        &mut self,
        identified_path: PathId,
        identification_path: PathId,
        fixed: Option<Value>,
    ) -> (ResultId, IdentificationId) {
        let identification = IdentificationId(self.next_identification);
        self.next_identification += 1;
        self.indexer.register_identification(identification);
        let monitor = MonitorId(self.next_monitor);
        self.next_monitor += 1;
        self.indexer.add_key_listener(identification_path, monitor);
        let state = IdentityResultState::new(
            identification,
            identified_path,
            identification_path,
            fixed,
            monitor,
        );
        let result = self.results.add_identity_result(state);
        self.monitor_owner.insert(monitor, result);
        (result, identification)
    }

    /// Feed identification matches to an identity result.
    pub fn identify(&mut self, result: ResultId, matches: &[DataElementId]) {
        if let ResultKind::Identity(state) = &mut self.results.get_mut(result).kind {
            state.identification_added(matches, &mut self.indexer);
        }
        self.scheduler.schedule(TaskKind::ContentRefresh);
    }

    pub fn unidentify(&mut self, result: ResultId, matches: &[DataElementId]) {
        if let ResultKind::Identity(state) = &mut self.results.get_mut(result).kind {
            state.identification_removed(matches, &mut self.indexer);
        }
        self.scheduler.schedule(TaskKind::ContentRefresh);
    }

    pub fn destroy_identity_result(&mut self, result: ResultId) {
        if let ResultKind::Identity(state) = &mut self.results.get_mut(result).kind {
            state.destroy(&mut self.indexer);
            self.monitor_owner.remove(&state.monitor);
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Queue a write to a node. Non-writable targets are reported once and
    /// dropped at pre-write.
    pub fn write(&mut self, target: FnId, value: Value) {
        self.writes.pending.push((target, value));
        self.scheduler.schedule(TaskKind::PreWrite);
    }

    pub fn writable_value(&self, target: FnId) -> Option<&Value> {
        self.writable_values.get(&target)
    }

    fn pre_write(&mut self) {
        let pending = std::mem::take(&mut self.writes.pending);
        let mut validated = Vec::with_capacity(pending.len());
        for (target, value) in pending {
            match &self.compiler.pool.get(target).kind {
                FunctionNodeKind::Writable { .. } | FunctionNodeKind::Storage { .. } => {
                    validated.push((target, value));
                }
                _ => {
                    self.compiler
                        .cx
                        .warnings
                        .warn("write to a non-writable node dropped");
                }
            }
        }
        self.writes.pending = validated;
        if !self.writes.pending.is_empty() {
            self.scheduler.schedule(TaskKind::CommitWrites);
        }
    }

    fn commit_writes(&mut self) {
        let pending = std::mem::take(&mut self.writes.pending);
        let changed = !pending.is_empty();
        for (target, value) in pending {
            self.writable_values.insert(target, value);
        }
        if changed {
            self.scheduler.schedule(TaskKind::ContentRefresh);
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Drain scheduler tasks and indexer notifications until the system is
    /// quiescent. Errors with `TaskLoopBlocked` when the runaway guard
    /// trips.
    pub fn run_until_quiescent(&mut self) -> EngineResult<()> {
        if self.indexer.has_notifications() {
            self.scheduler.schedule(TaskKind::ContentRefresh);
        }
        loop {
            let Some(task) = self.scheduler.next_task() else {
                if self.scheduler.is_blocked() {
                    return Err(EngineError::TaskLoopBlocked {
                        cycles: self.config.scheduler.max_content_cycles,
                    });
                }
                break;
            };
            match task {
                TaskKind::ContentRefresh => {
                    self.dispatch_notifications();
                    if !self.scheduler.note_content_cycle() {
                        continue;
                    }
                    if self.indexer.has_notifications() {
                        self.scheduler.reschedule(TaskKind::ContentRefresh);
                    }
                }
                TaskKind::PreWrite => self.pre_write(),
                TaskKind::CommitWrites => self.commit_writes(),
                TaskKind::NextMessage | TaskKind::PathNodeExecution => {}
                TaskKind::IndexerGc => self.indexer.end_cycle(),
            }
            if self.scheduler.is_empty() && !self.indexer.has_notifications() {
                break;
            }
        }
        self.scheduler.content_quiescent();
        self.indexer.end_cycle();
        Ok(())
    }

    fn dispatch_notifications(&mut self) {
        let notifications = self.indexer.drain_notifications();
        for notification in notifications {
            self.dispatch_one(notification);
        }
    }

    fn dispatch_one(&mut self, notification: IndexerNotification) {
        match notification {
            IndexerNotification::MatchesAdded { target, elements } => {
                let delta = self
                    .querycalcs
                    .add_matches(target, &elements, &self.indexer);
                self.propagate_opt(delta);
            }
            IndexerNotification::MatchesRemoved { target, elements } => {
                let delta = self.querycalcs.remove_matches(target, &elements);
                self.propagate_opt(delta);
            }
            IndexerNotification::AllMatchesRemoved { target } => {
                let delta = self.querycalcs.remove_all_indexer_matches(target);
                self.propagate_opt(delta);
            }
            IndexerNotification::SetMatchPoints { target, paths } => {
                self.querycalcs.set_match_points(target, paths.clone());
                if let Some(root) = self.root_of(target) {
                    // The root's set is the union over all registered
                    // terminals, so a set only ever adds.
                    for path in paths {
                        self.root_mut(root).add_lower_match_point(path);
                    }
                }
            }
            IndexerNotification::AddToMatchPoints { target, path } => {
                self.querycalcs.add_to_match_points(target, path);
                if let Some(root) = self.root_of(target) {
                    self.root_mut(root).add_lower_match_point(path);
                }
            }
            IndexerNotification::RemoveFromMatchPoints { target, path } => {
                self.querycalcs.remove_from_match_points(target, path);
                if let Some(root) = self.root_of(target) {
                    self.root_mut(root).remove_lower_match_point(path);
                }
            }
            IndexerNotification::KeyChanged {
                target, element, ..
            } => {
                let delta = self.querycalcs.key_changed(target, element, &self.indexer);
                self.propagate_opt(delta);
            }
            IndexerNotification::MonitorKeyChanged {
                monitor, element, ..
            } => {
                if let Some(&result) = self.monitor_owner.get(&monitor) {
                    if let ResultKind::Identity(state) =
                        &mut self.results.get_mut(result).kind
                    {
                        state.update_compressed_values(element, &mut self.indexer);
                    }
                }
            }
            IndexerNotification::IdentityChanged {
                identification,
                element,
                new: Some(new),
                ..
            } => {
                // Dominating parents with merged children follow the new
                // identity.
                let _updates = self.children_by_identity.update_identity(
                    element,
                    &new,
                    0,
                    identification,
                );
            }
            IndexerNotification::IdentityChanged { .. } => {}
        }
    }

    /// The root a node ultimately reports to, following the match-parent
    /// chain.
    fn root_of(&self, mut id: QueryCalcId) -> Option<RootId> {
        loop {
            match self.querycalcs.get(id).match_parent {
                MatchParent::Root(root) => return Some(root),
                MatchParent::Node(parent) => id = parent,
                MatchParent::Detached => return None,
            }
        }
    }

    fn propagate_opt(&mut self, delta: Option<MatchDelta>) {
        if let Some(d) = delta {
            self.propagate_delta(d);
        }
    }

    fn propagate_delta(&mut self, delta: MatchDelta) {
        match delta.parent {
            MatchParent::Detached => {}
            MatchParent::Node(parent) => {
                let next = self.querycalcs.child_delta(
                    parent,
                    delta.source,
                    &delta.added,
                    &delta.removed,
                    &self.indexer,
                );
                self.propagate_opt(next);
            }
            MatchParent::Root(root_id) => {
                let notifications = self.root_mut_internal(root_id, |root, indexer| {
                    root.top_delta(&delta.added, &delta.removed, indexer)
                });
                self.apply_root_notifications(notifications);
            }
        }
    }

    fn root_mut_internal<F, T>(&mut self, root_id: RootId, f: F) -> T
    where
        F: FnOnce(&mut RootQueryCalc, &Indexer) -> T,
    {
        let root = &mut self.roots[root_id.0 as usize];
        f(root, &self.indexer)
    }

    fn apply_root_notifications(&mut self, notifications: Vec<RootNotification>) {
        for notification in notifications {
            match notification {
                RootNotification::AddMatches { result, elements } => {
                    let (added, removed) = self.results.apply_matches(result, &elements, &[]);
                    self.forward_result_delta(result, &added, &removed);
                }
                RootNotification::RemoveMatches { result, elements } => {
                    let (added, removed) = self.results.apply_matches(result, &[], &elements);
                    self.forward_result_delta(result, &added, &removed);
                }
                RootNotification::RemoveAllMatches { result } => {
                    let removed = self.results.remove_all_matches(result);
                    self.forward_result_delta(result, &[], &removed);
                }
                RootNotification::FullMatchSet { result, elements } => {
                    let (added, removed) = self.results.replace_matches(result, elements);
                    self.forward_result_delta(result, &added, &removed);
                }
                RootNotification::ProjChanged { .. } => {
                    // Downstream merge indexers reconfigure their mapped
                    // paths from the entries; the mapping tables handle the
                    // per-element work lazily.
                }
            }
        }
    }

    /// Push a result's published delta to the results composed on it; an
    /// identity result treats identification-source deltas as identity
    /// updates rather than match updates.
    fn forward_result_delta(
        &mut self,
        source: ResultId,
        added: &[DataElementId],
        removed: &[DataElementId],
    ) {
        if added.is_empty() && removed.is_empty() {
            return;
        }
        let composed = self.results.get(source).composed.clone();
        for consumer in composed {
            let is_identification_source = match &self.results.get(consumer).kind {
                ResultKind::Identity(state) => state.identification_source == Some(source),
                _ => false,
            };
            if is_identification_source {
                if let ResultKind::Identity(state) = &mut self.results.get_mut(consumer).kind {
                    state.identification_added(added, &mut self.indexer);
                    state.identification_removed(removed, &mut self.indexer);
                }
                continue;
            }
            let (pub_added, pub_removed) = self.results.apply_matches(consumer, added, removed);
            self.forward_result_delta(consumer, &pub_added, &pub_removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_construction_is_clean() {
        let engine = QueryEngine::new(Config::default());
        assert!(engine.querycalcs.is_empty());
        assert!(engine.results.is_empty());
        assert!(engine.children_by_identity.is_empty());
        assert!(engine.mapped_elements.is_empty());
    }
}
