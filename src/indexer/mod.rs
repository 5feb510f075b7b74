//! # Indexer
//!
//! In-memory store of data elements organised by canonical paths, with the
//! query-facing surface the runtime consumes: per-path element sets and
//! keys, query-calc subscriptions with match and match-point notifications,
//! the identity registry with its value compressor, order interest, and
//! data-element lowering for merge indexers.
//!
//! The indexer never calls back into subscribers. Every observable change
//! is queued as an [`IndexerNotification`] and drained by the engine's
//! dispatch loop, so update ordering is explicit.

use crate::error::{IndexerError, IndexerResult};
use crate::path::{PathId, PathStore};
use crate::querycalc::QueryCalcId;
use crate::value::Value;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

/// Process-unique id of a data element; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataElementId(pub u64);

/// Id of a registered identification (one identity labelling of elements).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentificationId(pub u32);

/// Id of a key-update monitor (identity monitors subscribe with these).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MonitorId(pub u32);

/// An identity attached to a data element. Compressed identities live in
/// their own variant so they can never collide with element-id identities.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Element(DataElementId),
    Compressed(u64),
    Constant(Value),
}

/// One stored data element.
#[derive(Debug, Clone)]
pub struct DataElement {
    pub id: DataElementId,
    pub path: PathId,
    pub parent: Option<DataElementId>,
}

/// Registration info a query-calc node supplies when subscribing.
#[derive(Debug, Clone)]
pub struct SubscriberInfo {
    pub path: PathId,
    pub is_selection: bool,
    pub is_projection: bool,
    /// The subscriber never needs key values (no indexing work for it).
    pub do_not_index: bool,
}

/// Queued observable changes, drained by the engine dispatch loop.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexerNotification {
    MatchesAdded {
        target: QueryCalcId,
        elements: Vec<DataElementId>,
    },
    MatchesRemoved {
        target: QueryCalcId,
        elements: Vec<DataElementId>,
    },
    /// The subscriber's path node was cleared wholesale.
    AllMatchesRemoved { target: QueryCalcId },
    /// Initial match-point set on subscription.
    SetMatchPoints {
        target: QueryCalcId,
        paths: Vec<PathId>,
    },
    AddToMatchPoints { target: QueryCalcId, path: PathId },
    RemoveFromMatchPoints { target: QueryCalcId, path: PathId },
    /// A key changed under a subscribed path.
    KeyChanged {
        target: QueryCalcId,
        path: PathId,
        element: DataElementId,
    },
    /// A key changed under a monitored path.
    MonitorKeyChanged {
        monitor: MonitorId,
        path: PathId,
        element: DataElementId,
    },
    /// An identity labelling changed.
    IdentityChanged {
        identification: IdentificationId,
        element: DataElementId,
        old: Option<Identity>,
        new: Option<Identity>,
    },
}

/// Per-path state: the element set (in insertion order), keys, transient
/// diff sets, and registered consumers.
#[derive(Debug, Default)]
pub struct PathNode {
    elements: HashSet<DataElementId>,
    order: Vec<DataElementId>,
    keys: HashMap<DataElementId, Value>,
    adding: HashSet<DataElementId>,
    removing: HashSet<DataElementId>,
    query_calcs: HashMap<QueryCalcId, SubscriberInfo>,
    key_listeners: HashSet<MonitorId>,
    order_star_count: u32,
}

impl PathNode {
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn contains(&self, id: DataElementId) -> bool {
        self.elements.contains(&id)
    }
}

/// Assigns dense codes to key values for compressed identities.
#[derive(Debug, Default)]
pub struct ValueCompressor {
    codes: HashMap<Value, u64>,
    next: u64,
}

impl ValueCompressor {
    pub fn compress(&mut self, value: &Value) -> u64 {
        if let Some(&code) = self.codes.get(value) {
            return code;
        }
        self.next += 1;
        self.codes.insert(value.clone(), self.next);
        self.next
    }
}

/// Present / being-added / being-removed split of a filtered id set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterDiff {
    pub present: Vec<DataElementId>,
    pub being_added: Vec<DataElementId>,
    pub being_removed: Vec<DataElementId>,
}

/// The data-element indexed store.
pub struct Indexer {
    paths: Rc<RefCell<PathStore>>,
    elements: HashMap<DataElementId, DataElement>,
    /// Elements removed this cycle; raising during retraction still needs
    /// their parent chains.
    removed_elements: HashMap<DataElementId, DataElement>,
    children: HashMap<DataElementId, Vec<DataElementId>>,
    path_nodes: HashMap<PathId, PathNode>,
    identifications: HashMap<IdentificationId, HashMap<DataElementId, Identity>>,
    registered_identifications: HashSet<IdentificationId>,
    compressor: ValueCompressor,
    notifications: VecDeque<IndexerNotification>,
    next_element: u64,
}

impl Indexer {
    pub fn new(paths: Rc<RefCell<PathStore>>) -> Self {
        Indexer {
            paths,
            elements: HashMap::new(),
            removed_elements: HashMap::new(),
            children: HashMap::new(),
            path_nodes: HashMap::new(),
            identifications: HashMap::new(),
            registered_identifications: HashSet::new(),
            compressor: ValueCompressor::default(),
            notifications: VecDeque::new(),
            next_element: 1,
        }
    }

    // ------------------------------------------------------------------
    // Path delegation
    // ------------------------------------------------------------------

    pub fn get_root_path_id(&self) -> PathId {
        self.paths.borrow().get_root_path_id()
    }

    pub fn allocate_path_id(&self, prefix: PathId, attr: &str) -> PathId {
        self.paths.borrow_mut().allocate_path_id(prefix, attr)
    }

    pub fn allocate_concat_path_id(&self, a: PathId, b: PathId) -> PathId {
        self.paths.borrow_mut().allocate_concat_path_id(a, b)
    }

    pub fn get_common_prefix(&self, paths: &[PathId]) -> PathId {
        self.paths.borrow().get_common_prefix(paths)
    }

    pub fn get_first_attr_after_prefix(
        &self,
        prefix: PathId,
        path: PathId,
    ) -> Option<std::sync::Arc<str>> {
        self.paths.borrow().get_first_attr_after_prefix(prefix, path)
    }

    pub fn release_path_id(&self, id: PathId) {
        self.paths.borrow_mut().release_path_id(id);
    }

    pub fn path_store(&self) -> Rc<RefCell<PathStore>> {
        self.paths.clone()
    }

    // ------------------------------------------------------------------
    // Data elements
    // ------------------------------------------------------------------

    /// Add a data element at `path`. The parent, when given, must live at a
    /// strictly shorter prefix of `path`.
    pub fn add_data_element(
        &mut self,
        path: PathId,
        parent: Option<DataElementId>,
        key: Option<Value>,
    ) -> IndexerResult<DataElementId> {
        if let Some(p) = parent {
            let parent_el = self
                .elements
                .get(&p)
                .ok_or(IndexerError::NoSuchElement(p))?;
            let paths = self.paths.borrow();
            if parent_el.path == path || !paths.is_prefix_of(parent_el.path, path) {
                return Err(IndexerError::UnknownLayout { element: p, path });
            }
        }
        let id = DataElementId(self.next_element);
        self.next_element += 1;
        self.elements.insert(id, DataElement { id, path, parent });
        if let Some(p) = parent {
            self.children.entry(p).or_default().push(id);
        }
        self.insert_at_path(id, path, key);
        Ok(id)
    }

    fn insert_at_path(&mut self, id: DataElementId, path: PathId, key: Option<Value>) {
        let node = self.path_nodes.entry(path).or_default();
        let was_empty = node.is_empty();
        if node.elements.insert(id) {
            node.order.push(id);
            node.adding.insert(id);
        }
        if let Some(k) = key {
            node.keys.insert(id, k);
        }
        let targets: Vec<QueryCalcId> = node.query_calcs.keys().copied().collect();
        for target in targets {
            self.notifications.push_back(IndexerNotification::MatchesAdded {
                target,
                elements: vec![id],
            });
        }
        if was_empty {
            self.emit_match_point_change(path, true);
        }
    }

    /// Remove a data element from its path (and from the store). The
    /// element's chain entry stays resolvable until the end of the cycle.
    pub fn remove_data_element(&mut self, id: DataElementId) -> IndexerResult<()> {
        let element = self
            .elements
            .remove(&id)
            .ok_or(IndexerError::NoSuchElement(id))?;
        self.removed_elements.insert(id, element.clone());
        if let Some(p) = element.parent {
            if let Some(siblings) = self.children.get_mut(&p) {
                siblings.retain(|&c| c != id);
                if siblings.is_empty() {
                    self.children.remove(&p);
                }
            }
        }
        let mut became_empty = false;
        if let Some(node) = self.path_nodes.get_mut(&element.path) {
            if node.elements.remove(&id) {
                node.order.retain(|&e| e != id);
                node.keys.remove(&id);
                node.adding.remove(&id);
                node.removing.insert(id);
                became_empty = node.is_empty();
            }
            let targets: Vec<QueryCalcId> = node.query_calcs.keys().copied().collect();
            for target in targets {
                self.notifications
                    .push_back(IndexerNotification::MatchesRemoved {
                        target,
                        elements: vec![id],
                    });
            }
        }
        if became_empty {
            self.emit_match_point_change(element.path, false);
        }
        Ok(())
    }

    /// Clear a whole path node.
    pub fn clear_path(&mut self, path: PathId) {
        let Some(node) = self.path_nodes.get_mut(&path) else {
            return;
        };
        let ids: Vec<DataElementId> = node.order.clone();
        let targets: Vec<QueryCalcId> = node.query_calcs.keys().copied().collect();
        for target in targets {
            self.notifications
                .push_back(IndexerNotification::AllMatchesRemoved { target });
        }
        for id in ids {
            if let Some(element) = self.elements.remove(&id) {
                self.removed_elements.insert(id, element);
            }
            self.children.remove(&id);
        }
        let node = self.path_nodes.get_mut(&path).expect("checked above");
        let was_empty = node.is_empty();
        node.elements.clear();
        node.order.clear();
        node.keys.clear();
        node.adding.clear();
        if !was_empty {
            self.emit_match_point_change(path, false);
        }
    }

    pub fn has_entry(&self, id: DataElementId) -> bool {
        self.elements.contains_key(&id)
    }

    pub fn get_parent_id(&self, id: DataElementId) -> Option<DataElementId> {
        self.elements.get(&id).and_then(|e| e.parent)
    }

    pub fn get_path_id(&self, id: DataElementId) -> Option<PathId> {
        self.elements.get(&id).map(|e| e.path)
    }

    /// Chain entry of a live or just-removed element.
    fn element_info(&self, id: DataElementId) -> Option<&DataElement> {
        self.elements.get(&id).or_else(|| self.removed_elements.get(&id))
    }

    /// Walk the parent chain until the element's path equals `path` or is a
    /// prefix of it.
    pub fn raise_to_path(&self, id: DataElementId, path: PathId) -> IndexerResult<DataElementId> {
        let paths = self.paths.borrow();
        let mut cur = id;
        loop {
            let element = self
                .element_info(cur)
                .ok_or(IndexerError::NoSuchElement(cur))?;
            if element.path == path || paths.is_prefix_of(element.path, path) {
                return Ok(cur);
            }
            match element.parent {
                Some(p) => cur = p,
                None => return Ok(cur),
            }
        }
    }

    /// As [`Indexer::raise_to_path`], but the walk must land exactly at
    /// `path`.
    pub fn raise_exactly_to_path(
        &self,
        id: DataElementId,
        path: PathId,
    ) -> Option<DataElementId> {
        let mut cur = id;
        loop {
            let element = self.element_info(cur)?;
            if element.path == path {
                return Some(cur);
            }
            cur = element.parent?;
        }
    }

    // ------------------------------------------------------------------
    // Path-node access
    // ------------------------------------------------------------------

    pub fn get_all_matches(&self, path: PathId) -> Vec<DataElementId> {
        self.path_nodes
            .get(&path)
            .map(|n| n.order.clone())
            .unwrap_or_default()
    }

    pub fn get_all_matches_as_obj(&self, path: PathId) -> HashMap<DataElementId, Value> {
        self.path_nodes
            .get(&path)
            .map(|n| {
                n.order
                    .iter()
                    .map(|&id| {
                        (id, n.keys.get(&id).cloned().unwrap_or(Value::Undefined))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_key(&self, path: PathId, id: DataElementId) -> Option<&Value> {
        self.path_nodes.get(&path)?.keys.get(&id)
    }

    pub fn path_node(&self, path: PathId) -> Option<&PathNode> {
        self.path_nodes.get(&path)
    }

    pub fn filter_data_nodes_at_path(
        &self,
        path: PathId,
        ids: &[DataElementId],
    ) -> Vec<DataElementId> {
        let Some(node) = self.path_nodes.get(&path) else {
            return Vec::new();
        };
        ids.iter().copied().filter(|id| node.contains(*id)).collect()
    }

    pub fn filter_data_nodes_at_path_with_diff(
        &self,
        path: PathId,
        ids: &[DataElementId],
    ) -> FilterDiff {
        let Some(node) = self.path_nodes.get(&path) else {
            return FilterDiff::default();
        };
        let mut diff = FilterDiff::default();
        for &id in ids {
            if node.contains(id) {
                diff.present.push(id);
                if node.adding.contains(&id) {
                    diff.being_added.push(id);
                }
            } else if node.removing.contains(&id) {
                diff.being_removed.push(id);
            }
        }
        diff
    }

    pub fn filter_nodes_just_being_added(
        &self,
        path: PathId,
        ids: &[DataElementId],
    ) -> Vec<DataElementId> {
        self.filter_data_nodes_at_path_with_diff(path, ids).being_added
    }

    pub fn filter_nodes_just_being_removed(
        &self,
        path: PathId,
        ids: &[DataElementId],
    ) -> Vec<DataElementId> {
        self.filter_data_nodes_at_path_with_diff(path, ids).being_removed
    }

    /// End-of-cycle maintenance: the transient diff sets reset and removed
    /// elements are released for good.
    pub fn end_cycle(&mut self) {
        for node in self.path_nodes.values_mut() {
            node.adding.clear();
            node.removing.clear();
        }
        self.removed_elements.clear();
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Register a query-calc node at its path. Emits the current element
    /// set as an initial add and the current lower match points.
    pub fn add_query_calc_to_path_node(&mut self, id: QueryCalcId, info: SubscriberInfo) {
        let path = info.path;
        let node = self.path_nodes.entry(path).or_default();
        node.query_calcs.insert(id, info);
        let existing = node.order.clone();
        let match_points = self.match_points_below(path);
        self.notifications
            .push_back(IndexerNotification::SetMatchPoints {
                target: id,
                paths: match_points,
            });
        if !existing.is_empty() {
            self.notifications.push_back(IndexerNotification::MatchesAdded {
                target: id,
                elements: existing,
            });
        }
    }

    pub fn remove_query_calc_from_path_node(&mut self, id: QueryCalcId, path: PathId) {
        if let Some(node) = self.path_nodes.get_mut(&path) {
            node.query_calcs.remove(&id);
        }
    }

    /// Non-empty paths at or below `prefix`.
    pub fn match_points_below(&self, prefix: PathId) -> Vec<PathId> {
        let paths = self.paths.borrow();
        let mut out: Vec<PathId> = self
            .path_nodes
            .iter()
            .filter(|(p, n)| !n.is_empty() && paths.is_prefix_of(prefix, **p))
            .map(|(p, _)| *p)
            .collect();
        out.sort();
        out
    }

    fn emit_match_point_change(&mut self, path: PathId, added: bool) {
        let paths = self.paths.borrow();
        let mut updates = Vec::new();
        for (p, node) in &self.path_nodes {
            if !paths.is_prefix_of(*p, path) {
                continue;
            }
            for &target in node.query_calcs.keys() {
                updates.push((target, path));
            }
        }
        drop(paths);
        for (target, path) in updates {
            let notification = if added {
                IndexerNotification::AddToMatchPoints { target, path }
            } else {
                IndexerNotification::RemoveFromMatchPoints { target, path }
            };
            self.notifications.push_back(notification);
        }
    }

    /// Update a key; selection subscribers and key listeners at the path
    /// are told.
    pub fn update_keys(&mut self, path: PathId, id: DataElementId, value: Value) {
        let Some(node) = self.path_nodes.get_mut(&path) else {
            return;
        };
        if !node.contains(id) {
            return;
        }
        node.keys.insert(id, value);
        let targets: Vec<QueryCalcId> = node
            .query_calcs
            .iter()
            .filter(|(_, info)| !info.do_not_index)
            .map(|(&t, _)| t)
            .collect();
        let monitors: Vec<MonitorId> = node.key_listeners.iter().copied().collect();
        for target in targets {
            self.notifications.push_back(IndexerNotification::KeyChanged {
                target,
                path,
                element: id,
            });
        }
        for monitor in monitors {
            self.notifications
                .push_back(IndexerNotification::MonitorKeyChanged {
                    monitor,
                    path,
                    element: id,
                });
        }
    }

    /// Whether any consumer at `path` needs key values maintained.
    pub fn need_key_update_for_query(&self, path: PathId) -> bool {
        self.path_nodes.get(&path).is_some_and(|node| {
            !node.key_listeners.is_empty()
                || node
                    .query_calcs
                    .values()
                    .any(|info| info.is_selection && !info.do_not_index)
        })
    }

    pub fn add_key_listener(&mut self, path: PathId, monitor: MonitorId) {
        self.path_nodes
            .entry(path)
            .or_default()
            .key_listeners
            .insert(monitor);
    }

    pub fn remove_key_listener(&mut self, path: PathId, monitor: MonitorId) {
        if let Some(node) = self.path_nodes.get_mut(&path) {
            node.key_listeners.remove(&monitor);
        }
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    pub fn register_identification(&mut self, id: IdentificationId) {
        self.registered_identifications.insert(id);
        self.identifications.entry(id).or_default();
    }

    pub fn unregister_identification(&mut self, id: IdentificationId) {
        self.registered_identifications.remove(&id);
        self.identifications.remove(&id);
    }

    pub fn has_identification_requests(&self, id: IdentificationId) -> bool {
        self.registered_identifications.contains(&id)
    }

    /// Attach identities (replacing-add) to elements.
    pub fn add_identities(
        &mut self,
        ids: &[DataElementId],
        identities: &[Identity],
        identification: IdentificationId,
    ) {
        debug_assert_eq!(ids.len(), identities.len());
        let map = self.identifications.entry(identification).or_default();
        let mut changes = Vec::new();
        for (&id, identity) in ids.iter().zip(identities) {
            let old = map.insert(id, identity.clone());
            if old.as_ref() != Some(identity) {
                changes.push((id, old, identity.clone()));
            }
        }
        for (element, old, new) in changes {
            self.notifications
                .push_back(IndexerNotification::IdentityChanged {
                    identification,
                    element,
                    old,
                    new: Some(new),
                });
        }
    }

    pub fn remove_identities(&mut self, ids: &[DataElementId], identification: IdentificationId) {
        let Some(map) = self.identifications.get_mut(&identification) else {
            return;
        };
        let mut changes = Vec::new();
        for &id in ids {
            if let Some(old) = map.remove(&id) {
                changes.push((id, old));
            }
        }
        for (element, old) in changes {
            self.notifications
                .push_back(IndexerNotification::IdentityChanged {
                    identification,
                    element,
                    old: Some(old),
                    new: None,
                });
        }
    }

    pub fn remove_all_identities(&mut self, identification: IdentificationId) {
        let ids: Vec<DataElementId> = self
            .identifications
            .get(&identification)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default();
        self.remove_identities(&ids, identification);
    }

    pub fn get_all_identities(
        &self,
        identification: IdentificationId,
    ) -> HashMap<DataElementId, Identity> {
        self.identifications
            .get(&identification)
            .cloned()
            .unwrap_or_default()
    }

    /// The identity of an element under an identification; elements without
    /// an explicit identity are identified by their own id.
    pub fn get_identity(&self, identification: IdentificationId, id: DataElementId) -> Identity {
        self.identifications
            .get(&identification)
            .and_then(|m| m.get(&id))
            .cloned()
            .unwrap_or(Identity::Element(id))
    }

    pub fn compress_value(&mut self, value: &Value) -> u64 {
        self.compressor.compress(value)
    }

    // ------------------------------------------------------------------
    // Order interest
    // ------------------------------------------------------------------

    pub fn add_order_star_func_at_path(&mut self, path: PathId) {
        self.path_nodes.entry(path).or_default().order_star_count += 1;
    }

    pub fn remove_order_star_func_at_path(&mut self, path: PathId) {
        if let Some(node) = self.path_nodes.get_mut(&path) {
            node.order_star_count = node.order_star_count.saturating_sub(1);
        }
    }

    pub fn has_order_interest(&self, path: PathId) -> bool {
        self.path_nodes
            .get(&path)
            .is_some_and(|n| n.order_star_count > 0)
    }

    /// Elements at a path in their dominated comparison order (insertion
    /// order of the store).
    pub fn get_dominated_comparison_at_path(&self, path: PathId) -> Vec<DataElementId> {
        self.get_all_matches(path)
    }

    // ------------------------------------------------------------------
    // Lowering
    // ------------------------------------------------------------------

    /// Expand ids with all their descendants living at any of the given
    /// lower paths. An id that cannot be resolved at all fails with
    /// `UnknownLayout`.
    pub fn lower_data_elements_to(
        &self,
        ids: &[DataElementId],
        lower_paths: &[PathId],
    ) -> IndexerResult<Vec<DataElementId>> {
        let mut out = Vec::new();
        for &id in ids {
            if !self.elements.contains_key(&id) {
                return Err(IndexerError::NoSuchElement(id));
            }
            out.push(id);
            self.collect_descendants_at(id, lower_paths, &mut out)?;
        }
        Ok(out)
    }

    fn collect_descendants_at(
        &self,
        id: DataElementId,
        lower_paths: &[PathId],
        out: &mut Vec<DataElementId>,
    ) -> IndexerResult<()> {
        let Some(children) = self.children.get(&id) else {
            return Ok(());
        };
        for &child in children {
            let element = self
                .elements
                .get(&child)
                .ok_or(IndexerError::UnknownLayout {
                    element: child,
                    path: PathStore::ROOT,
                })?;
            if lower_paths.contains(&element.path) {
                out.push(child);
            }
            self.collect_descendants_at(child, lower_paths, out)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    pub fn drain_notifications(&mut self) -> Vec<IndexerNotification> {
        self.notifications.drain(..).collect()
    }

    pub fn has_notifications(&self) -> bool {
        !self.notifications.is_empty()
    }
}
