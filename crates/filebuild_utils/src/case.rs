//! Path case normalization.
//!
//! The build engine keys its internal maps by "norm-cased" filenames so that
//! names differing only in case collide on case-insensitive file systems. The
//! rule is isolated behind the `PathCase` trait so tests can exercise
//! case-insensitive behavior on case-sensitive hosts.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/** A platform rule for comparing filenames that may differ only in case */
pub trait PathCase: fmt::Debug + Send + Sync {
    /**
     * Return the normalized form of the specified path, used as a map key.
     * On case-insensitive systems this folds the case; elsewhere it is the
     * identity.
     */
    fn norm_case(&self, path: &str) -> String;

    /**
     * Return the path of an on-disk sibling whose name matches the base name
     * of `path` under this rule but differs from it in case, if there is one.
     * The return value is unspecified if the parent directory cannot be read.
     */
    fn miscased_sibling(&self, path: &Path) -> io::Result<Option<PathBuf>>;
}

/** The case rule of the host platform */
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeCase;

impl PathCase for NativeCase {
    fn norm_case(&self, path: &str) -> String {
        if cfg!(windows) {
            path.to_lowercase().replace('/', "\\")
        } else {
            path.to_string()
        }
    }

    fn miscased_sibling(&self, path: &Path) -> io::Result<Option<PathBuf>> {
        if cfg!(windows) {
            find_miscased_sibling(path)
        } else {
            Ok(None)
        }
    }
}

/**
 * A case rule that folds every path to lowercase, regardless of platform.
 *
 * This emulates a case-insensitive file system on case-sensitive hosts and
 * exists for the test suite.
 */
#[derive(Clone, Copy, Debug, Default)]
pub struct FoldedCase;

impl PathCase for FoldedCase {
    fn norm_case(&self, path: &str) -> String {
        path.to_lowercase()
    }

    fn miscased_sibling(&self, path: &Path) -> io::Result<Option<PathBuf>> {
        find_miscased_sibling(path)
    }
}

/**
 * Scan the parent of `path` for an entry that matches its base name
 * case-insensitively. An exactly matching entry wins over a miscased one.
 * Scan failures are treated as "no sibling".
 */
fn find_miscased_sibling(path: &Path) -> io::Result<Option<PathBuf>> {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return Ok(None);
    };
    let Some(name) = name.to_str() else {
        return Ok(None);
    };

    let Ok(entries) = fs::read_dir(parent) else {
        return Ok(None);
    };
    let folded_name = name.to_lowercase();
    let mut miscased = None;
    for entry in entries.flatten() {
        let entry_name = entry.file_name();
        let Some(entry_name) = entry_name.to_str() else {
            continue;
        };
        if entry_name == name {
            return Ok(None);
        }
        if entry_name.to_lowercase() == folded_name {
            miscased = Some(parent.join(entry_name));
        }
    }
    Ok(miscased)
}
