//! Value-Type Lattice
//!
//! Describes the possible shapes, cardinalities and dominions of any value
//! that can flow through a compiled function node. Capabilities are not
//! exclusive: one type may simultaneously admit numbers, strings and an
//! attribute-value shape. `sizes` bounds the cardinality of the value when
//! viewed as an ordered set.
//!
//! The lattice operations (`merge`, `subsumes`, `apply_query`) are what type
//! inference in the compiler is built from; `merge` is a join, `subsumes` the
//! partial order, and `apply_query` evaluates the effect of applying one type
//! as a query against another.

use crate::template::TemplateId;
use std::collections::BTreeMap;

/// An inclusive cardinality range; `max == u32::MAX` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SizeRange {
    pub min: u32,
    pub max: u32,
}

impl SizeRange {
    pub const UNBOUNDED: u32 = u32::MAX;

    pub fn exact(n: u32) -> Self {
        SizeRange { min: n, max: n }
    }

    pub fn at_least(n: u32) -> Self {
        SizeRange {
            min: n,
            max: Self::UNBOUNDED,
        }
    }

    pub fn span(min: u32, max: u32) -> Self {
        debug_assert!(min <= max);
        SizeRange { min, max }
    }
}

/// A normalised set of cardinality ranges: sorted, disjoint, and with
/// adjacent ranges fused.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SizeRanges(Vec<SizeRange>);

impl SizeRanges {
    pub fn new(mut ranges: Vec<SizeRange>) -> Self {
        ranges.sort();
        let mut out: Vec<SizeRange> = Vec::with_capacity(ranges.len());
        for r in ranges {
            match out.last_mut() {
                Some(last) if r.min <= last.max.saturating_add(1) => {
                    last.max = last.max.max(r.max);
                }
                _ => out.push(r),
            }
        }
        SizeRanges(out)
    }

    pub fn exact(n: u32) -> Self {
        SizeRanges(vec![SizeRange::exact(n)])
    }

    pub fn any() -> Self {
        SizeRanges(vec![SizeRange::at_least(0)])
    }

    pub fn zero_or_one() -> Self {
        SizeRanges(vec![SizeRange::span(0, 1)])
    }

    pub fn ranges(&self) -> &[SizeRange] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn max(&self) -> u32 {
        self.0.last().map_or(0, |r| r.max)
    }

    pub fn min(&self) -> u32 {
        self.0.first().map_or(0, |r| r.min)
    }

    /// Join.
    pub fn union(&self, other: &SizeRanges) -> SizeRanges {
        let mut all = self.0.clone();
        all.extend_from_slice(&other.0);
        SizeRanges::new(all)
    }

    /// Pairwise intersection; may be empty.
    pub fn intersect(&self, other: &SizeRanges) -> SizeRanges {
        let mut out = Vec::new();
        for a in &self.0 {
            for b in &other.0 {
                let min = a.min.max(b.min);
                let max = a.max.min(b.max);
                if min <= max {
                    out.push(SizeRange { min, max });
                }
            }
        }
        SizeRanges::new(out)
    }

    /// Whether every range of `other` is covered by this set.
    pub fn contains(&self, other: &SizeRanges) -> bool {
        other
            .0
            .iter()
            .all(|b| self.0.iter().any(|a| a.min <= b.min && b.max <= a.max))
    }

    /// The sum range of two sets (used when concatenating ordered sets).
    pub fn sum(&self, other: &SizeRanges) -> SizeRanges {
        let mut out = Vec::new();
        for a in &self.0 {
            for b in &other.0 {
                out.push(SizeRange {
                    min: a.min.saturating_add(b.min),
                    max: if a.max == SizeRange::UNBOUNDED || b.max == SizeRange::UNBOUNDED {
                        SizeRange::UNBOUNDED
                    } else {
                        a.max.saturating_add(b.max)
                    },
                });
            }
        }
        SizeRanges::new(out)
    }
}

impl Default for SizeRanges {
    fn default() -> Self {
        SizeRanges::any()
    }
}

/// The value type of a function node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValueType {
    pub unknown: bool,
    pub undef: bool,
    pub boolean: bool,
    pub number: bool,
    pub string: bool,
    pub projector: bool,
    /// Any data shape at all; absorbs the specific data capabilities.
    pub any_data: bool,
    pub remote: bool,
    pub data_source: bool,
    /// Attribute-value shape.
    pub object: Option<BTreeMap<String, ValueType>>,
    /// Area sets per originating template, with their cardinalities.
    pub areas: Option<BTreeMap<TemplateId, SizeRanges>>,
    /// Defun body type.
    pub defun: Option<Box<ValueType>>,
    pub sizes: SizeRanges,
}

impl ValueType {
    pub fn unknown() -> Self {
        ValueType {
            unknown: true,
            sizes: SizeRanges::any(),
            ..Default::default()
        }
    }

    pub fn undefined() -> Self {
        ValueType {
            undef: true,
            sizes: SizeRanges::exact(0),
            ..Default::default()
        }
    }

    pub fn boolean() -> Self {
        ValueType {
            boolean: true,
            sizes: SizeRanges::exact(1),
            ..Default::default()
        }
    }

    pub fn number() -> Self {
        ValueType {
            number: true,
            sizes: SizeRanges::exact(1),
            ..Default::default()
        }
    }

    pub fn string() -> Self {
        ValueType {
            string: true,
            sizes: SizeRanges::exact(1),
            ..Default::default()
        }
    }

    pub fn projector() -> Self {
        ValueType {
            projector: true,
            sizes: SizeRanges::exact(1),
            ..Default::default()
        }
    }

    pub fn any_data() -> Self {
        ValueType {
            any_data: true,
            sizes: SizeRanges::any(),
            ..Default::default()
        }
    }

    pub fn object(attrs: BTreeMap<String, ValueType>) -> Self {
        ValueType {
            object: Some(attrs),
            sizes: SizeRanges::exact(1),
            ..Default::default()
        }
    }

    pub fn areas(template: TemplateId, sizes: SizeRanges) -> Self {
        let mut map = BTreeMap::new();
        map.insert(template, sizes);
        ValueType {
            areas: Some(map),
            sizes: SizeRanges::any(),
            ..Default::default()
        }
    }

    pub fn defun(body: ValueType) -> Self {
        ValueType {
            defun: Some(Box::new(body)),
            sizes: SizeRanges::exact(1),
            ..Default::default()
        }
    }

    pub fn with_sizes(mut self, sizes: SizeRanges) -> Self {
        self.sizes = sizes;
        self
    }

    /// Join of two types: union of capabilities and sizes. `any_data`
    /// absorbs the specific data capabilities.
    pub fn merge(&self, other: &ValueType) -> ValueType {
        let mut out = ValueType {
            unknown: self.unknown || other.unknown,
            undef: self.undef || other.undef,
            boolean: self.boolean || other.boolean,
            number: self.number || other.number,
            string: self.string || other.string,
            projector: self.projector || other.projector,
            any_data: self.any_data || other.any_data,
            remote: self.remote || other.remote,
            data_source: self.data_source || other.data_source,
            object: merge_objects(self.object.as_ref(), other.object.as_ref()),
            areas: merge_areas(self.areas.as_ref(), other.areas.as_ref()),
            defun: match (&self.defun, &other.defun) {
                (Some(a), Some(b)) => Some(Box::new(a.merge(b))),
                (Some(a), None) => Some(a.clone()),
                (None, Some(b)) => Some(b.clone()),
                (None, None) => None,
            },
            sizes: self.sizes.union(&other.sizes),
        };
        if out.any_data {
            out.boolean = false;
            out.number = false;
            out.string = false;
            out.object = None;
        }
        out
    }

    /// Partial order: every capability of `other` is present here and its
    /// sizes are contained.
    pub fn subsumes(&self, other: &ValueType) -> bool {
        let data_absorbed = self.any_data;
        if other.unknown && !self.unknown && !data_absorbed {
            return false;
        }
        if (other.undef && !self.undef && !data_absorbed)
            || (other.boolean && !self.boolean && !data_absorbed)
            || (other.number && !self.number && !data_absorbed)
            || (other.string && !self.string && !data_absorbed)
            || (other.projector && !self.projector)
            || (other.any_data && !self.any_data)
            || (other.remote && !self.remote)
            || (other.data_source && !self.data_source)
        {
            return false;
        }
        if let Some(b_obj) = &other.object {
            if !data_absorbed {
                match &self.object {
                    None => return false,
                    Some(a_obj) => {
                        for (attr, bt) in b_obj {
                            match a_obj.get(attr) {
                                Some(at) if at.subsumes(bt) => {}
                                _ => return false,
                            }
                        }
                    }
                }
            }
        }
        if let Some(b_areas) = &other.areas {
            match &self.areas {
                None => return false,
                Some(a_areas) => {
                    for (tid, b_sizes) in b_areas {
                        match a_areas.get(tid) {
                            Some(a_sizes) if a_sizes.contains(b_sizes) => {}
                            _ => return false,
                        }
                    }
                }
            }
        }
        if let Some(b_defun) = &other.defun {
            match &self.defun {
                Some(a_defun) if a_defun.subsumes(b_defun) => {}
                _ => return false,
            }
        }
        self.sizes.contains(&other.sizes)
    }

    pub fn intersect_sizes(&mut self, other: &SizeRanges) {
        let intersected = self.sizes.intersect(other);
        if !intersected.is_empty() {
            self.sizes = intersected;
        }
    }

    /// No data capability at all (only areas / projector / defun / remote).
    pub fn is_not_data(&self) -> bool {
        !(self.unknown
            || self.undef
            || self.boolean
            || self.number
            || self.string
            || self.any_data
            || self.object.is_some())
    }

    pub fn is_strictly_areas(&self) -> bool {
        self.areas.is_some() && self.is_not_data() && self.defun.is_none() && !self.projector
    }

    pub fn is_data_and_areas(&self) -> bool {
        self.areas.is_some() && !self.is_not_data()
    }

    /// Add (merge in) an attribute type under the object capability.
    pub fn add_attribute(&mut self, attr: &str, t: ValueType) {
        let obj = self.object.get_or_insert_with(BTreeMap::new);
        match obj.get(attr) {
            Some(prev) => {
                let merged = prev.merge(&t);
                obj.insert(attr.to_string(), merged);
            }
            None => {
                obj.insert(attr.to_string(), t);
            }
        }
    }

    /// All terminal leaves of this type's object shape are projectors and
    /// there is no other data capability.
    pub fn is_pure_projection(&self) -> bool {
        if self.projector && self.object.is_none() {
            return true;
        }
        if self.boolean || self.number || self.string || self.any_data || self.unknown {
            return false;
        }
        match &self.object {
            Some(obj) => !obj.is_empty() && obj.values().all(ValueType::is_pure_projection),
            None => false,
        }
    }

    /// The value type that results from applying `self` as a query against
    /// data of type `data`.
    ///
    /// A pure projection descends `data.object` along its projector paths; a
    /// selection keeps `data` but can only shrink cardinality; anything
    /// indeterminate falls back to `any_data`.
    pub fn apply_query(&self, data: &ValueType) -> ValueType {
        if data.any_data || data.unknown {
            return ValueType::any_data();
        }
        if self.projector && self.object.is_none() {
            return data.clone();
        }
        if self.is_pure_projection() {
            return match self.project_into(data) {
                Some(t) => t,
                None => ValueType::any_data(),
            };
        }
        if self.defun.is_some() || self.unknown || self.any_data {
            return ValueType::any_data();
        }
        // Selection: same shape, possibly fewer elements.
        let mut out = data.clone();
        out.sizes = SizeRanges::new(vec![SizeRange::span(0, data.sizes.max())]);
        out
    }

    fn project_into(&self, data: &ValueType) -> Option<ValueType> {
        if self.projector && self.object.is_none() {
            return Some(data.clone());
        }
        let q_obj = self.object.as_ref()?;
        let d_obj = data.object.as_ref()?;
        let mut result: Option<ValueType> = None;
        for (attr, sub_q) in q_obj {
            let sub_d = d_obj.get(attr)?;
            let projected = sub_q.project_into(sub_d)?;
            result = Some(match result {
                Some(prev) => prev.merge(&projected),
                None => projected,
            });
        }
        result
    }
}

fn merge_objects(
    a: Option<&BTreeMap<String, ValueType>>,
    b: Option<&BTreeMap<String, ValueType>>,
) -> Option<BTreeMap<String, ValueType>> {
    match (a, b) {
        (Some(a), Some(b)) => {
            let mut out = a.clone();
            for (attr, bt) in b {
                let merged = match a.get(attr) {
                    Some(at) => at.merge(bt),
                    None => bt.clone(),
                };
                out.insert(attr.clone(), merged);
            }
            Some(out)
        }
        (Some(a), None) => Some(a.clone()),
        (None, Some(b)) => Some(b.clone()),
        (None, None) => None,
    }
}

fn merge_areas(
    a: Option<&BTreeMap<TemplateId, SizeRanges>>,
    b: Option<&BTreeMap<TemplateId, SizeRanges>>,
) -> Option<BTreeMap<TemplateId, SizeRanges>> {
    match (a, b) {
        (Some(a), Some(b)) => {
            let mut out = a.clone();
            for (tid, bs) in b {
                let merged = match a.get(tid) {
                    Some(as_) => as_.union(bs),
                    None => bs.clone(),
                };
                out.insert(*tid, merged);
            }
            Some(out)
        }
        (Some(a), None) => Some(a.clone()),
        (None, Some(b)) => Some(b.clone()),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_ranges_normalise() {
        let s = SizeRanges::new(vec![
            SizeRange::span(3, 5),
            SizeRange::exact(1),
            SizeRange::span(2, 4),
        ]);
        assert_eq!(s.ranges(), &[SizeRange::span(1, 5)]);
    }

    #[test]
    fn size_ranges_set_algebra() {
        let a = SizeRanges::new(vec![SizeRange::span(0, 3)]);
        let b = SizeRanges::new(vec![SizeRange::span(2, 9)]);
        assert_eq!(a.intersect(&b).ranges(), &[SizeRange::span(2, 3)]);
        assert!(a.union(&b).contains(&a));
        assert!(!a.contains(&b));
        assert_eq!(
            SizeRanges::exact(2).sum(&SizeRanges::exact(3)).ranges(),
            &[SizeRange::exact(5)]
        );
    }

    #[test]
    fn merge_is_join() {
        let n = ValueType::number();
        let s = ValueType::string();
        let joined = n.merge(&s);
        assert!(joined.subsumes(&n));
        assert!(joined.subsumes(&s));
        assert!(!n.subsumes(&joined));
    }

    #[test]
    fn any_data_absorbs() {
        let joined = ValueType::number().merge(&ValueType::any_data());
        assert!(joined.any_data);
        assert!(!joined.number);
        assert!(joined.subsumes(&ValueType::number()));
    }

    #[test]
    fn apply_query_projects() {
        let mut obj = BTreeMap::new();
        obj.insert("a".to_string(), ValueType::number());
        obj.insert("b".to_string(), ValueType::string());
        let data = ValueType::object(obj);

        let mut q_obj = BTreeMap::new();
        q_obj.insert("a".to_string(), ValueType::projector());
        let q = ValueType::object(q_obj);

        let projected = q.apply_query(&data);
        assert!(projected.number);
        assert!(!projected.string);
    }

    #[test]
    fn apply_query_selection_shrinks() {
        let data = ValueType::number().with_sizes(SizeRanges::exact(4));
        let q = ValueType::number();
        let selected = q.apply_query(&data);
        assert!(selected.number);
        assert_eq!(selected.sizes.min(), 0);
        assert_eq!(selected.sizes.max(), 4);
    }
}
