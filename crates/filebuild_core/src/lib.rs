//! Core data model for the filebuild engine: the error taxonomy, file
//! comparison methods, operation records, and the cache that persists them
//! between builds.

pub mod cache;
pub mod comparison;
pub mod error;
pub mod operation;

pub use cache::Cache;
pub use comparison::FileComparison;
pub use error::BuildError;
pub use operation::{
    BuildFileOp, Operation, SimpleOp, SimpleOpKind, SubbuildOp, subbuild_key,
};
pub use serde_json::Value;
