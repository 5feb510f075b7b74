//! Identity Result & Monitor
//!
//! An identity result attaches identities to data elements at a target
//! path. Its `identified` source supplies the elements to identify; its
//! `identification` source supplies the match set whose values compute the
//! identity. A fixed identity assigns one constant to every match; a
//! compressed identity codes each match's key value through the indexer's
//! value compressor (compressed codes live in their own [`Identity`]
//! variant, so they cannot collide with element-id identities).
//!
//! Matches below the identified path raise to it; `raised_identified`
//! counts multi-raising so an identity is only retracted when the last
//! contributing match goes away. The monitor subscribes to key updates on
//! the identification path and re-issues the affected identities when keys
//! change.

use super::ResultId;
use crate::indexer::{
    DataElementId, IdentificationId, Identity, Indexer, MonitorId,
};
use crate::path::PathId;
use crate::value::Value;
use std::collections::HashMap;

/// State of one identity result.
#[derive(Debug)]
pub struct IdentityResultState {
    pub identification_id: IdentificationId,
    /// Source defining which elements are identified.
    pub identified: Option<ResultId>,
    /// Source whose matches compute the identities.
    pub identification_source: Option<ResultId>,
    /// Path the identities attach at.
    pub identified_path: PathId,
    /// Path the identification values are read from.
    pub identification_path: PathId,
    /// Compile-time constant identity; `None` means compressed values.
    pub fixed: Option<Value>,
    /// A raise that does not land exactly at the identified path yields no
    /// identification.
    pub identify_at_identified_path_only: bool,
    /// Raised element -> number of raw matches currently identifying it.
    pub raised_identified: HashMap<DataElementId, u32>,
    pub monitor: MonitorId,
}

impl IdentityResultState {
    pub fn new(
        identification_id: IdentificationId,
        identified_path: PathId,
        identification_path: PathId,
        fixed: Option<Value>,
        monitor: MonitorId,
    ) -> Self {
        IdentityResultState {
            identification_id,
            identified: None,
            identification_source: None,
            identified_path,
            identification_path,
            fixed,
            identify_at_identified_path_only: false,
            raised_identified: HashMap::new(),
            monitor,
        }
    }

    /// Raise a raw identification match to the identified path, honouring
    /// the exact-landing flag.
    fn raise(&self, raw: DataElementId, indexer: &Indexer) -> Option<DataElementId> {
        if self.identify_at_identified_path_only {
            indexer.raise_exactly_to_path(raw, self.identified_path)
        } else {
            indexer.raise_to_path(raw, self.identified_path).ok()
        }
    }

    /// The identity of one raw match: the fixed constant, or the negated
    /// compressed form of its key value.
    fn identity_of(&self, raw: DataElementId, indexer: &mut Indexer) -> Identity {
        match &self.fixed {
            Some(v) => Identity::Constant(v.clone()),
            None => {
                let key = indexer
                    .get_key(self.identification_path, raw)
                    .cloned()
                    .unwrap_or(Value::Undefined);
                Identity::Compressed(indexer.compress_value(&key))
            }
        }
    }

    /// Identification matches arrived: attach identities to the raised
    /// elements (first raise attaches, later raises only count).
    pub fn identification_added(
        &mut self,
        raw_matches: &[DataElementId],
        indexer: &mut Indexer,
    ) {
        let mut attach: Vec<(DataElementId, Identity)> = Vec::new();
        for &raw in raw_matches {
            let Some(target) = self.raise(raw, indexer) else {
                continue;
            };
            let count = self.raised_identified.entry(target).or_insert(0);
            *count += 1;
            if *count == 1 {
                let identity = self.identity_of(raw, indexer);
                attach.push((target, identity));
            }
        }
        if !attach.is_empty() {
            let (ids, identities): (Vec<_>, Vec<_>) = attach.into_iter().unzip();
            indexer.add_identities(&ids, &identities, self.identification_id);
        }
    }

    /// Identification matches left: the identity is retracted only when the
    /// last raise of the target goes away.
    pub fn identification_removed(
        &mut self,
        raw_matches: &[DataElementId],
        indexer: &mut Indexer,
    ) {
        let mut retract = Vec::new();
        for &raw in raw_matches {
            let Some(target) = self.raise(raw, indexer) else {
                continue;
            };
            if let Some(count) = self.raised_identified.get_mut(&target) {
                *count -= 1;
                if *count == 0 {
                    self.raised_identified.remove(&target);
                    retract.push(target);
                }
            }
        }
        if !retract.is_empty() {
            indexer.remove_identities(&retract, self.identification_id);
        }
    }

    /// Key change under the identification path: recompute the compressed
    /// identity of the affected element and issue a replacing add.
    pub fn update_compressed_values(
        &mut self,
        element: DataElementId,
        indexer: &mut Indexer,
    ) {
        if self.fixed.is_some() {
            return;
        }
        let Some(target) = self.raise(element, indexer) else {
            return;
        };
        if !self.raised_identified.contains_key(&target) {
            return;
        }
        let identity = self.identity_of(element, indexer);
        indexer.add_identities(&[target], &[identity], self.identification_id);
    }

    /// Tear down: retract identities, unregister the identification and
    /// drop the key subscription.
    pub fn destroy(&mut self, indexer: &mut Indexer) {
        let targets: Vec<DataElementId> = self.raised_identified.keys().copied().collect();
        if !targets.is_empty() {
            indexer.remove_identities(&targets, self.identification_id);
        }
        self.raised_identified.clear();
        indexer.remove_key_listener(self.identification_path, self.monitor);
        indexer.unregister_identification(self.identification_id);
    }
}
