//! Mapped data elements
//!
//! Allocates target data-element ids for `(source, path, dominating)`
//! triples in a merge indexer. Path ids are interned into positional slots
//! so the per-source storage stays dense; a mapping whose target equals its
//! dominating node reuses the dominating id instead of allocating.

use crate::indexer::DataElementId;
use crate::path::PathId;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct TargetEntry {
    target: DataElementId,
    refcount: u32,
}

/// Per-source, per-slot mappings keyed by the dominating node.
type SlotEntry = HashMap<Option<DataElementId>, TargetEntry>;

#[derive(Debug, Default)]
struct PathSlot {
    path: Option<PathId>,
    uses: u32,
}

/// Source-to-target data-element translation for a merge indexer.
#[derive(Debug)]
pub struct MappedDataElements {
    slots: Vec<PathSlot>,
    slot_of_path: HashMap<PathId, usize>,
    free_slots: Vec<usize>,
    sources: HashMap<DataElementId, Vec<Option<SlotEntry>>>,
    next_target: u64,
}

impl MappedDataElements {
    /// `first_target_id` seeds the allocator for fresh target ids.
    pub fn new(first_target_id: u64) -> Self {
        MappedDataElements {
            slots: Vec::new(),
            slot_of_path: HashMap::new(),
            free_slots: Vec::new(),
            sources: HashMap::new(),
            next_target: first_target_id,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    fn slot_index(&mut self, path: PathId) -> usize {
        if let Some(&slot) = self.slot_of_path.get(&path) {
            self.slots[slot].uses += 1;
            return slot;
        }
        let slot = match self.free_slots.pop() {
            Some(free) => free,
            None => {
                self.slots.push(PathSlot::default());
                self.slots.len() - 1
            }
        };
        self.slots[slot] = PathSlot {
            path: Some(path),
            uses: 1,
        };
        self.slot_of_path.insert(path, slot);
        slot
    }

    fn release_slot(&mut self, slot: usize) {
        let entry = &mut self.slots[slot];
        entry.uses -= 1;
        if entry.uses == 0 {
            if let Some(path) = entry.path.take() {
                self.slot_of_path.remove(&path);
            }
            self.free_slots.push(slot);
        }
    }

    /// Allocate (or find) the target id for `(source, path, dominating)`.
    /// With `target_equals_dominating` the dominating id itself is the
    /// target and no fresh id is allocated.
    pub fn add_target_id(
        &mut self,
        source: DataElementId,
        path: PathId,
        dominating: Option<DataElementId>,
        target_equals_dominating: bool,
    ) -> DataElementId {
        let slot = self.slot_index(path);
        let per_source = self.sources.entry(source).or_default();
        if per_source.len() <= slot {
            per_source.resize_with(slot + 1, || None);
        }
        let by_dominating = per_source[slot].get_or_insert_with(HashMap::new);
        if let Some(entry) = by_dominating.get_mut(&dominating) {
            entry.refcount += 1;
            // The interned slot reference taken above is only held once per
            // live mapping.
            let target = entry.target;
            self.release_slot(slot);
            return target;
        }
        let target = match (target_equals_dominating, dominating) {
            (true, Some(dom)) => dom,
            _ => {
                let id = DataElementId(self.next_target);
                self.next_target += 1;
                id
            }
        };
        by_dominating.insert(dominating, TargetEntry { target, refcount: 1 });
        target
    }

    pub fn get_target_id(
        &self,
        source: DataElementId,
        path: PathId,
        dominating: Option<DataElementId>,
    ) -> Option<DataElementId> {
        let slot = *self.slot_of_path.get(&path)?;
        self.sources
            .get(&source)?
            .get(slot)?
            .as_ref()?
            .get(&dominating)
            .map(|e| e.target)
    }

    /// Drop one reference on a mapping; the mapping (and its slot use)
    /// disappears on the last release.
    pub fn remove_target_id(
        &mut self,
        source: DataElementId,
        path: PathId,
        dominating: Option<DataElementId>,
    ) {
        let Some(&slot) = self.slot_of_path.get(&path) else {
            return;
        };
        let Some(per_source) = self.sources.get_mut(&source) else {
            return;
        };
        let Some(Some(by_dominating)) = per_source.get_mut(slot) else {
            return;
        };
        let Some(entry) = by_dominating.get_mut(&dominating) else {
            return;
        };
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return;
        }
        by_dominating.remove(&dominating);
        if by_dominating.is_empty() {
            per_source[slot] = None;
        }
        if per_source.iter().all(Option::is_none) {
            self.sources.remove(&source);
        }
        self.release_slot(slot);
    }

    /// Bulk lookup of target ids at a path for a set of sources. With
    /// `fallback_to_source`, a source without a mapping contributes its own
    /// id (path-propagated merges).
    pub fn get_all_target_ids_at_path(
        &self,
        path: PathId,
        sources: &[DataElementId],
        fallback_to_source: bool,
    ) -> Vec<DataElementId> {
        let slot = self.slot_of_path.get(&path).copied();
        let mut out = Vec::new();
        for &source in sources {
            let targets = slot.and_then(|s| {
                self.sources
                    .get(&source)
                    .and_then(|v| v.get(s))
                    .and_then(Option::as_ref)
            });
            match targets {
                Some(by_dominating) if !by_dominating.is_empty() => {
                    out.extend(by_dominating.values().map(|e| e.target));
                }
                _ if fallback_to_source => out.push(source),
                _ => {}
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_add_returns_same_target() {
        let mut m = MappedDataElements::new(100);
        let p1 = PathId(1);
        let t1 = m.add_target_id(DataElementId(5), p1, None, false);
        let t2 = m.add_target_id(DataElementId(5), p1, None, false);
        assert_eq!(t1, t2);
        assert_eq!(m.get_target_id(DataElementId(5), p1, None), Some(t1));
    }

    #[test]
    fn target_equals_dominating_reuses_id() {
        let mut m = MappedDataElements::new(100);
        let p2 = PathId(2);
        let t = m.add_target_id(
            DataElementId(5),
            p2,
            Some(DataElementId(10)),
            true,
        );
        assert_eq!(t, DataElementId(10));
    }

    #[test]
    fn removal_sequence_restores_empty() {
        let mut m = MappedDataElements::new(100);
        let p1 = PathId(1);
        let p2 = PathId(2);
        let t1 = m.add_target_id(DataElementId(5), p1, None, false);
        let t1b = m.add_target_id(DataElementId(5), p1, None, false);
        assert_eq!(t1, t1b);
        let t2 = m.add_target_id(DataElementId(5), p2, Some(DataElementId(10)), true);
        assert_eq!(t2, DataElementId(10));

        // Two references on (p1, None), one on (p2, Some(10)).
        m.remove_target_id(DataElementId(5), p1, None);
        assert_eq!(m.get_target_id(DataElementId(5), p1, None), Some(t1));
        m.remove_target_id(DataElementId(5), p1, None);
        assert_eq!(m.get_target_id(DataElementId(5), p1, None), None);
        m.remove_target_id(DataElementId(5), p2, Some(DataElementId(10)));
        assert!(m.is_empty());
    }

    #[test]
    fn slots_are_reused_across_paths() {
        let mut m = MappedDataElements::new(100);
        let p1 = PathId(1);
        m.add_target_id(DataElementId(1), p1, None, false);
        m.remove_target_id(DataElementId(1), p1, None);
        // The freed slot serves a different path.
        let p9 = PathId(9);
        m.add_target_id(DataElementId(2), p9, None, false);
        assert_eq!(m.slot_of_path.get(&p9), Some(&0));
    }

    #[test]
    fn bulk_lookup_with_fallback() {
        let mut m = MappedDataElements::new(100);
        let p = PathId(3);
        let t = m.add_target_id(DataElementId(1), p, None, false);
        let ids = m.get_all_target_ids_at_path(
            p,
            &[DataElementId(1), DataElementId(2)],
            true,
        );
        assert_eq!(ids, vec![t, DataElementId(2)]);
        let strict = m.get_all_target_ids_at_path(
            p,
            &[DataElementId(1), DataElementId(2)],
            false,
        );
        assert_eq!(strict, vec![t]);
    }
}
