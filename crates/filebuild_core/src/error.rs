//! The build error taxonomy.

use std::error::Error;
use std::io;
use thiserror::Error;

/** Errors that can occur during a build operation */
#[derive(Error, Debug)]
pub enum BuildError {
    /** An argument has an inadmissible shape or is not JSON-representable */
    #[error("bad argument: {0}")]
    BadArg(String),

    #[error("building the same file twice is not allowed: {0}")]
    DuplicateBuild(String),

    #[error(
        "calling the same subbuild function twice with the same arguments \
         is not allowed: {0}"
    )]
    DuplicateSubbuild(String),

    /** An attempt to build the cache file or use it as a directory */
    #[error("build_file may not write to the cache file: {0}")]
    CacheFileConflict(String),

    #[error("{0} is a directory")]
    IsADirectory(String),

    #[error("{0} is not a directory")]
    NotADirectory(String),

    #[error("file does not exist: {0}")]
    FileNotFound(String),

    /** A build file function returned without producing its output file */
    #[error("the build_file call for {0} didn't create that file")]
    DidNotCreate(String),

    /** The cache file is unreadable, corrupted, or version-mismatched */
    #[error("{0}")]
    CacheFormat(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    /** An error raised inside a user-supplied build function */
    #[error("build function failed: {0}")]
    User(#[source] Box<dyn Error + Send + Sync>),
}

impl BuildError {
    /** Wrap an error raised by a user-supplied build function */
    pub fn user<E>(error: E) -> BuildError
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        BuildError::User(error.into())
    }

    /**
     * The name recorded for this error when it is raised by a simple
     * operation, or `None` if the error is not a file system level failure.
     * Cached simple operations store this name so that a later build can
     * check whether re-executing the operation fails the same way.
     */
    pub fn simple_op_kind(&self) -> Option<&'static str> {
        match self {
            BuildError::FileNotFound(_) => Some("FileNotFound"),
            BuildError::IsADirectory(_) => Some("IsADirectory"),
            BuildError::NotADirectory(_) => Some("NotADirectory"),
            BuildError::Io(_) => Some("OsError"),
            _ => None,
        }
    }
}
