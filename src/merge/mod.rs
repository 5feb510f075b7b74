//! Merge-Indexer Side Tables
//!
//! Support tables used by a merge indexer: routing child nodes under
//! dominating parents selected by identity ([`ChildrenByIdentity`]), and
//! translating source data-element ids to target ids per path and
//! dominating node ([`MappedDataElements`]).

pub mod children_by_identity;
pub mod mapped_elements;

pub use children_by_identity::{ChildrenByIdentity, GroupId, IdentityUpdate};
pub use mapped_elements::MappedDataElements;
