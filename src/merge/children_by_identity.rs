//! Children grouped by identity
//!
//! At a merge indexer's prefix path node, child nodes are merged under
//! dominating parents chosen by identity. Three maps are kept in lock-step:
//! identity buckets (identity -> group -> child set), the reverse child map
//! (child -> group -> identity + parent), and per-parent reference counts.
//!
//! Invariants: every `(child, group)` mapping appears in exactly one
//! identity bucket and in the reverse map; counts never go negative; empty
//! inner maps are removed eagerly.

use crate::indexer::{DataElementId, IdentificationId, Identity};
use std::collections::{HashMap, HashSet};

/// Id of a merge group (one source of children).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u32);

/// Registration of a group: which source indexer and identification it
/// draws identities from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupRegistration {
    pub source_indexer: u32,
    pub identification: IdentificationId,
}

/// One rewrite produced by [`ChildrenByIdentity::update_identity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityUpdate {
    pub child: DataElementId,
    pub group: GroupId,
    pub old_identity: Identity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ChildEntry {
    identity: Identity,
    parent: DataElementId,
}

#[derive(Debug, Default)]
struct ParentEntry {
    /// Mappings where the child is the parent itself.
    same_id: u32,
    children: HashMap<DataElementId, u32>,
}

impl ParentEntry {
    fn is_empty(&self) -> bool {
        self.same_id == 0 && self.children.is_empty()
    }
}

/// Child nodes to be merged under dominating parents selected by identity.
#[derive(Debug, Default)]
pub struct ChildrenByIdentity {
    identities: HashMap<Identity, HashMap<GroupId, HashSet<DataElementId>>>,
    children: HashMap<DataElementId, HashMap<GroupId, ChildEntry>>,
    parents: HashMap<DataElementId, ParentEntry>,
    groups: HashMap<GroupId, GroupRegistration>,
    num_children: usize,
}

impl ChildrenByIdentity {
    pub fn new() -> Self {
        ChildrenByIdentity::default()
    }

    pub fn register_group(
        &mut self,
        group: GroupId,
        source_indexer: u32,
        identification: IdentificationId,
    ) {
        self.groups.insert(
            group,
            GroupRegistration {
                source_indexer,
                identification,
            },
        );
    }

    /// Number of distinct child ids with at least one mapping.
    pub fn num_children(&self) -> usize {
        self.num_children
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty() && self.children.is_empty() && self.parents.is_empty()
    }

    /// Children registered under an identity for a group.
    pub fn children_of_identity(
        &self,
        identity: &Identity,
        group: GroupId,
    ) -> Option<&HashSet<DataElementId>> {
        self.identities.get(identity)?.get(&group)
    }

    /// The identity a `(child, group)` mapping is registered under.
    pub fn identity_of(&self, child: DataElementId, group: GroupId) -> Option<&Identity> {
        self.children.get(&child)?.get(&group).map(|e| &e.identity)
    }

    /// Register a child under a dominating parent for a group. Re-adding an
    /// existing `(child, group)` mapping moves it to the new identity bucket
    /// (and parent).
    pub fn add_child(
        &mut self,
        identity: Identity,
        parent: DataElementId,
        child: DataElementId,
        group: GroupId,
    ) {
        self.groups.entry(group).or_insert(GroupRegistration {
            source_indexer: 0,
            identification: IdentificationId(0),
        });

        // Displace a previous mapping of this (child, group).
        if let Some(prev) = self
            .children
            .get(&child)
            .and_then(|by_group| by_group.get(&group))
            .cloned()
        {
            if prev.identity == identity && prev.parent == parent {
                return;
            }
            self.detach(child, group, &prev);
        }

        self.identities
            .entry(identity.clone())
            .or_default()
            .entry(group)
            .or_default()
            .insert(child);
        let was_new_child = !self.children.contains_key(&child);
        self.children
            .entry(child)
            .or_default()
            .insert(group, ChildEntry { identity, parent });
        if was_new_child {
            self.num_children += 1;
        }
        let parent_entry = self.parents.entry(parent).or_default();
        if child == parent {
            parent_entry.same_id += 1;
        } else {
            *parent_entry.children.entry(child).or_insert(0) += 1;
        }
    }

    /// Remove one `(child, group)` mapping under `parent`.
    pub fn remove_child(&mut self, parent: DataElementId, child: DataElementId, group: GroupId) {
        let Some(entry) = self
            .children
            .get(&child)
            .and_then(|by_group| by_group.get(&group))
            .cloned()
        else {
            return;
        };
        debug_assert_eq!(entry.parent, parent, "remove_child with wrong parent");
        self.detach(child, group, &entry);
    }

    fn detach(&mut self, child: DataElementId, group: GroupId, entry: &ChildEntry) {
        if let Some(by_group) = self.identities.get_mut(&entry.identity) {
            if let Some(nodes) = by_group.get_mut(&group) {
                nodes.remove(&child);
                if nodes.is_empty() {
                    by_group.remove(&group);
                }
            }
            if by_group.is_empty() {
                self.identities.remove(&entry.identity);
            }
        }
        if let Some(by_group) = self.children.get_mut(&child) {
            by_group.remove(&group);
            if by_group.is_empty() {
                self.children.remove(&child);
                self.num_children -= 1;
            }
        }
        if let Some(parent_entry) = self.parents.get_mut(&entry.parent) {
            if child == entry.parent {
                debug_assert!(parent_entry.same_id > 0);
                parent_entry.same_id = parent_entry.same_id.saturating_sub(1);
            } else if let Some(count) = parent_entry.children.get_mut(&child) {
                *count -= 1;
                if *count == 0 {
                    parent_entry.children.remove(&child);
                }
            }
            if parent_entry.is_empty() {
                self.parents.remove(&entry.parent);
            }
        }
    }

    /// Remove every mapping registered by a group. When it is the last
    /// group, this is a wholesale clear.
    pub fn remove_group(&mut self, group: GroupId) {
        if self.groups.len() <= 1 && self.groups.contains_key(&group) {
            self.identities.clear();
            self.children.clear();
            self.parents.clear();
            self.groups.clear();
            self.num_children = 0;
            return;
        }
        let members: Vec<(DataElementId, ChildEntry)> = self
            .children
            .iter()
            .filter_map(|(&child, by_group)| {
                by_group.get(&group).map(|e| (child, e.clone()))
            })
            .collect();
        for (child, entry) in members {
            self.detach(child, group, &entry);
        }
        self.groups.remove(&group);
    }

    /// A parent's identity changed: rewrite the identity bucket of every
    /// `(child, group)` under it whose group draws from the given source
    /// indexer and identification. Returns the applied updates.
    pub fn update_identity(
        &mut self,
        parent: DataElementId,
        new_identity: &Identity,
        source_indexer: u32,
        identification: IdentificationId,
    ) -> Vec<IdentityUpdate> {
        let Some(parent_entry) = self.parents.get(&parent) else {
            return Vec::new();
        };
        let mut member_children: Vec<DataElementId> =
            parent_entry.children.keys().copied().collect();
        if parent_entry.same_id > 0 {
            member_children.push(parent);
        }

        let mut updates = Vec::new();
        for child in member_children {
            let Some(by_group) = self.children.get(&child) else {
                continue;
            };
            let moves: Vec<(GroupId, ChildEntry)> = by_group
                .iter()
                .filter(|(g, e)| {
                    e.parent == parent
                        && e.identity != *new_identity
                        && self.groups.get(g).is_some_and(|r| {
                            r.source_indexer == source_indexer
                                && r.identification == identification
                        })
                })
                .map(|(&g, e)| (g, e.clone()))
                .collect();
            for (group, entry) in moves {
                self.detach(child, group, &entry);
                self.add_child(new_identity.clone(), parent, child, group);
                updates.push(IdentityUpdate {
                    child,
                    group,
                    old_identity: entry.identity,
                });
            }
        }
        updates
    }

    /// Reverse-map consistency check used by tests: every `(child, group)`
    /// entry is present in its identity bucket and vice versa, and the
    /// cached child count matches.
    pub fn check_consistency(&self) -> bool {
        if self.num_children != self.children.len() {
            return false;
        }
        for (child, by_group) in &self.children {
            for (group, entry) in by_group {
                let in_bucket = self
                    .identities
                    .get(&entry.identity)
                    .and_then(|g| g.get(group))
                    .is_some_and(|nodes| nodes.contains(child));
                if !in_bucket {
                    return false;
                }
            }
        }
        for (identity, by_group) in &self.identities {
            for (group, nodes) in by_group {
                for child in nodes {
                    let in_reverse = self
                        .children
                        .get(child)
                        .and_then(|g| g.get(group))
                        .is_some_and(|e| e.identity == *identity);
                    if !in_reverse {
                        return false;
                    }
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(n: u64) -> Identity {
        Identity::Compressed(n)
    }

    #[test]
    fn add_then_remove_restores_empty() {
        let mut t = ChildrenByIdentity::new();
        let g = GroupId(1);
        t.add_child(ident(7), DataElementId(1), DataElementId(2), g);
        t.add_child(ident(7), DataElementId(1), DataElementId(3), g);
        assert_eq!(t.num_children(), 2);
        assert!(t.check_consistency());
        t.remove_child(DataElementId(1), DataElementId(2), g);
        t.remove_child(DataElementId(1), DataElementId(3), g);
        assert!(t.is_empty() || t.num_children() == 0);
        assert!(t.check_consistency());
    }

    #[test]
    fn update_identity_rewrites_buckets() {
        let mut t = ChildrenByIdentity::new();
        let g = GroupId(4);
        t.register_group(g, 0, IdentificationId(0));
        t.add_child(ident(7), DataElementId(1), DataElementId(2), g);

        let updates = t.update_identity(DataElementId(1), &ident(9), 0, IdentificationId(0));
        assert_eq!(
            updates,
            vec![IdentityUpdate {
                child: DataElementId(2),
                group: g,
                old_identity: ident(7),
            }]
        );
        assert!(t.children_of_identity(&ident(7), g).is_none());
        assert!(t
            .children_of_identity(&ident(9), g)
            .is_some_and(|nodes| nodes.contains(&DataElementId(2))));
        assert_eq!(t.identity_of(DataElementId(2), g), Some(&ident(9)));
        assert!(t.check_consistency());
    }

    #[test]
    fn update_identity_skips_other_identifications() {
        let mut t = ChildrenByIdentity::new();
        let g = GroupId(1);
        t.register_group(g, 0, IdentificationId(5));
        t.add_child(ident(7), DataElementId(1), DataElementId(2), g);
        let updates = t.update_identity(DataElementId(1), &ident(9), 0, IdentificationId(6));
        assert!(updates.is_empty());
        assert_eq!(t.identity_of(DataElementId(2), g), Some(&ident(7)));
    }

    #[test]
    fn same_id_children_are_counted() {
        let mut t = ChildrenByIdentity::new();
        let g = GroupId(1);
        t.add_child(ident(1), DataElementId(5), DataElementId(5), g);
        assert!(t.check_consistency());
        let updates = t.update_identity(DataElementId(5), &ident(2), 0, IdentificationId(0));
        assert_eq!(updates.len(), 1);
        t.remove_child(DataElementId(5), DataElementId(5), g);
        assert!(t.is_empty());
    }

    #[test]
    fn remove_group_clears_only_its_mappings() {
        let mut t = ChildrenByIdentity::new();
        let g1 = GroupId(1);
        let g2 = GroupId(2);
        t.add_child(ident(1), DataElementId(1), DataElementId(2), g1);
        t.add_child(ident(1), DataElementId(1), DataElementId(2), g2);
        t.remove_group(g1);
        assert_eq!(t.identity_of(DataElementId(2), g1), None);
        assert_eq!(t.identity_of(DataElementId(2), g2), Some(&ident(1)));
        assert!(t.check_consistency());
        // Last group falls back to a wholesale clear.
        t.remove_group(g2);
        assert!(t.is_empty());
    }
}
