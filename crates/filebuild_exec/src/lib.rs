//! The filebuild engine
//!
//! Provides `FileBuilder`, an incremental build engine for file-producing
//! workflows. A caller wraps a build as a function that consumes input
//! files, computes intermediate values, and writes output files; the engine
//! caches the work so that a subsequent run reuses prior results whenever
//! the declared inputs are unchanged, and commits a consistent set of
//! outputs atomically - or rolls back to the previous state on failure.

mod backups;
mod build_dirs;
mod builder;
mod created_files;
mod executor;

pub use builder::FileBuilder;
pub use filebuild_core::{BuildError, FileComparison, Value};
pub use filebuild_utils::{FoldedCase, NativeCase, PathCase};
