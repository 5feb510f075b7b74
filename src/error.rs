//! Error Types
//!
//! Per-subsystem error enums plus the warn-once registry. User-level
//! problems (bad queries, qualifier cycles) are reported once and compiled
//! around; only broken graph invariants surface as hard errors.

use crate::indexer::DataElementId;
use crate::path::PathId;
use std::collections::HashMap;
use thiserror::Error;

/// Recoverable compilation problems. Routines that hit one report it through
/// [`WarnOnce`] and continue with an empty-value node; only `Internal`
/// reaches the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// Malformed query or expression
    #[error("syntax error: {0}")]
    Syntax(String),

    /// Value-type conflict
    #[error("type error: {0}")]
    Type(String),

    /// Circular qualifier or export
    #[error("cycle detected: {0}")]
    Cycle(String),

    /// Qualifier can never hold together with its context
    #[error("conflicting qualifier: {0}")]
    ConflictingQualifier(String),

    /// Reference to a node that does not exist
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// Intersection area without a partner
    #[error("missing partner: {0}")]
    MissingPartner(String),

    /// Write targeting a constant
    #[error("writable to constant: {0}")]
    WritableToConstant(String),

    /// Broken graph invariant; terminates the compilation cycle
    #[error("internal compiler error: {0}")]
    Internal(String),
}

/// Result type for compilation routines
pub type CompileResult<T> = Result<T, CompileError>;

/// Indexer-level errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexerError {
    /// A child data element at a required path could not be resolved
    #[error("unknown layout: element {element:?} has no child at path {path:?}")]
    UnknownLayout {
        element: DataElementId,
        path: PathId,
    },

    /// Path id is not allocated
    #[error("no such path: {0:?}")]
    NoSuchPath(PathId),

    /// Data element id is not allocated
    #[error("no such data element: {0:?}")]
    NoSuchElement(DataElementId),
}

/// Result type for indexer operations
pub type IndexerResult<T> = Result<T, IndexerError>;

/// Engine-level errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Indexer(#[from] IndexerError),

    /// The scheduler tripped the runaway-cycle guard
    #[error("task loop blocked after {cycles} content cycles; possible loop")]
    TaskLoopBlocked { cycles: u32 },

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Deduplicating warning sink: the first occurrence of a message is emitted
/// through `tracing::warn!`, repeats only bump a counter.
#[derive(Debug, Default)]
pub struct WarnOnce {
    seen: HashMap<String, u32>,
}

impl WarnOnce {
    pub fn new() -> Self {
        WarnOnce::default()
    }

    /// Report a warning; returns true when this was the first occurrence.
    pub fn warn(&mut self, message: &str) -> bool {
        let count = self.seen.entry(message.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            tracing::warn!(target: "weft", "{message}");
            true
        } else {
            false
        }
    }

    /// How often a message has been reported.
    pub fn count(&self, message: &str) -> u32 {
        self.seen.get(message).copied().unwrap_or(0)
    }

    pub fn messages(&self) -> impl Iterator<Item = &str> {
        self.seen.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warn_once_deduplicates() {
        let mut w = WarnOnce::new();
        assert!(w.warn("possible cycle at a.b"));
        assert!(!w.warn("possible cycle at a.b"));
        assert!(!w.warn("possible cycle at a.b"));
        assert_eq!(w.count("possible cycle at a.b"), 3);
        assert!(w.warn("another"));
    }
}
