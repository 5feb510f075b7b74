//! # Weft Reactive Query Engine
//!
//! A reactive, incremental query engine over a hierarchical, data-element
//! indexed store. Declarative queries compile into a DAG of typed function
//! nodes and a runtime tree of query-calculation nodes attached to an
//! indexer; as the underlying data changes, match sets and projection
//! results are maintained continually.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! Expression trees (hash-consed)
//!     |
//! [Compiler]            -> function-node DAG (typed, optimised, cached)
//!     |                     constant folding / redundant-argument removal
//!     |                     qualifier simplification / area-query rewrites
//! [Query decomposition] -> QueryDesc (selects, projections, negations)
//!     |
//! [Query-calc tree]     -> terminal + composite nodes on indexer paths
//!     |
//! [Root query-calc]     -> match raising / projection lowering
//!     |
//! [Result chains]       -> dominated match sets, identities, merge tables
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use weft::config::Config;
//! use weft::engine::QueryEngine;
//! use weft::querycalc::QueryDesc;
//! use weft::value::Value;
//!
//! let mut engine = QueryEngine::new(Config::default());
//!
//! // A path and some data.
//! let root = engine.indexer.get_root_path_id();
//! let items = engine.indexer.allocate_path_id(root, "items");
//! engine
//!     .add_data_element(items, None, Some(Value::number(5.0)))
//!     .expect("add element");
//!
//! // A query selecting 5 at that path.
//! let desc = QueryDesc::Simple {
//!     path: items,
//!     selection: Value::number(5.0),
//! };
//! let (_root_id, result) = engine.attach_query(&desc, items);
//! engine.run_until_quiescent().expect("quiescence");
//! assert_eq!(engine.results.get_dominated_matches(result).len(), 1);
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `value` | Runtime values and the value-type lattice |
//! | `path` | Hash-consed, refcounted path ids |
//! | `expression` | Expression store and query decomposition |
//! | `template` | Area-template tree with per-defun compile caches |
//! | `fnode` | Function-node arena and builtin vocabulary |
//! | `compiler` | Expression -> function-node compilation and optimisation |
//! | `indexer` | Data-element store, path nodes, identities, notifications |
//! | `querycalc` | Query-calculation tree and root nodes |
//! | `result` | Result chains, identity results |
//! | `merge` | Merge-indexer side tables |
//! | `scheduler` | Cooperative priority task queue |
//! | `engine` | The facade driving everything to quiescence |

pub mod config;
pub mod engine;
pub mod error;
pub mod expression;
pub mod fnode;
pub mod indexer;
pub mod merge;
pub mod path;
pub mod querycalc;
pub mod result;
pub mod scheduler;
pub mod template;
pub mod value;

pub mod compiler;

// Re-export the types most callers touch.
pub use crate::compiler::Compiler;
pub use crate::config::{init_tracing, Config};
pub use crate::engine::QueryEngine;
pub use crate::error::{CompileError, EngineError, IndexerError, WarnOnce};
pub use crate::expression::{ExprId, ExprKind, ExpressionStore, QueryComponent};
pub use crate::fnode::{
    BuiltinFunction, DefunId, FnId, FunctionNodeKind, FunctionNodePool, OutputSignal,
    SingleQualifier,
};
pub use crate::indexer::{DataElementId, IdentificationId, Identity, Indexer};
pub use crate::merge::{ChildrenByIdentity, GroupId, MappedDataElements};
pub use crate::path::{PathId, PathStore};
pub use crate::querycalc::{QueryCalcId, QueryCalcPool, QueryDesc};
pub use crate::result::{ResultId, ResultPool};
pub use crate::template::{AreaTemplate, TemplateId, TemplateTree};
pub use crate::value::{SizeRange, SizeRanges, Value, ValueType};
