//! Overlay of files provisionally created while checking a cache entry.

use crate::build_dirs::parent_of;
use filebuild_utils::PathCase;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/**
 * Represents the files created during a portion of a build process, along
 * with all of their parent directories.
 *
 * We use this when checking whether we can reuse a cached result. The simple
 * operation executor acts as though the files indicated by a `CreatedFiles`
 * passed to it exist in the virtual state of the file system. So
 * `CreatedFiles` indicates what files would have been created from the
 * beginning of the cache entry we are checking to the current point in that
 * entry.
 *
 * `CreatedFiles` is not thread-safe. There's no need, because a given
 * instance is only ever used by a single thread.
 */
pub struct CreatedFiles {
    case: Arc<dyn PathCase>,

    /** The norm-cased filenames of the regular files we have created */
    norm_cased_files: HashSet<String>,

    /**
     * The norm-cased filenames of the "created" directories: all of the
     * parents of all of the files we started creating which haven't resulted
     * in an error
     */
    norm_cased_dirs: HashSet<String>,

    /**
     * A map from the norm-cased filename of each created directory to the
     * non-norm-cased base names of its created subfiles, keyed by their
     * norm-cased base names. Does not contain empty maps.
     */
    norm_cased_dir_to_subfiles: HashMap<String, HashMap<String, String>>,

    /**
     * A map from the immediate parent directory of each file we have started
     * building and have not finished with an error to the number of such
     * files. Does not contain mappings to 0.
     */
    norm_cased_dir_to_started_count: HashMap<String, u64>,
}

impl CreatedFiles {
    pub fn new(case: Arc<dyn PathCase>) -> CreatedFiles {
        CreatedFiles {
            case,
            norm_cased_files: HashSet::new(),
            norm_cased_dirs: HashSet::new(),
            norm_cased_dir_to_subfiles: HashMap::new(),
            norm_cased_dir_to_started_count: HashMap::new(),
        }
    }

    /** Update this for starting a build file operation on `filename` */
    pub fn started_building_file(&mut self, filename: &str) {
        let Some(mut parent) = parent_of(filename) else {
            return;
        };
        let mut norm_cased_parent = self.case.norm_case(&parent);
        *self
            .norm_cased_dir_to_started_count
            .entry(norm_cased_parent.clone())
            .or_insert(0) += 1;
        while !self.norm_cased_dirs.contains(&norm_cased_parent) {
            self.norm_cased_dirs.insert(norm_cased_parent);
            self.add_to_subfiles(&parent);
            match parent_of(&parent) {
                Some(next) => parent = next,
                None => break,
            }
            norm_cased_parent = self.case.norm_case(&parent);
        }
    }

    /**
     * Update this for successfully finishing a build file operation. This
     * does not include cases where building the file failed.
     */
    pub fn finished_building_file(&mut self, filename: &str) {
        self.norm_cased_files.insert(self.case.norm_case(filename));
        self.add_to_subfiles(filename);
    }

    /** Update this for an error raised from a build file operation */
    pub fn error_building_file(&mut self, filename: &str) {
        let Some(parent) = parent_of(filename) else {
            return;
        };
        let mut norm_cased_parent = self.case.norm_case(&parent);
        let Some(count) = self
            .norm_cased_dir_to_started_count
            .get(&norm_cased_parent)
            .copied()
        else {
            return;
        };
        if count > 1 {
            self.norm_cased_dir_to_started_count
                .insert(norm_cased_parent, count - 1);
            return;
        }

        self.norm_cased_dir_to_started_count.remove(&norm_cased_parent);
        self.norm_cased_dirs.remove(&norm_cased_parent);
        while self.remove_from_subfiles(&norm_cased_parent) {
            match parent_of(&norm_cased_parent) {
                Some(next) => norm_cased_parent = next,
                None => return,
            }
            self.norm_cased_dirs.remove(&norm_cased_parent);
        }
    }

    /** Return whether we created a regular file with the given filename */
    pub fn has_norm_cased_file(&self, norm_cased_filename: &str) -> bool {
        self.norm_cased_files.contains(norm_cased_filename)
    }

    /**
     * Return whether we created a directory with the specified filename. We
     * say that when we build a file, we create all of its parent
     * directories, even if they already existed in the real or virtual file
     * system.
     */
    pub fn has_norm_cased_dir(&self, norm_cased_dir: &str) -> bool {
        self.norm_cased_dirs.contains(norm_cased_dir)
    }

    /**
     * Return the non-norm-cased names of the immediate children of the
     * specified directory that we have created. If we have not created
     * `dir`, or we created it as a regular file, this returns an empty list.
     * The names only contain the final component of each path.
     */
    pub fn list_dir(&self, dir: &str) -> Vec<String> {
        match self
            .norm_cased_dir_to_subfiles
            .get(&self.case.norm_case(dir))
        {
            Some(subfiles) => subfiles.values().cloned().collect(),
            None => Vec::new(),
        }
    }

    /**
     * Add an entry for the base name of `filename` to the subfile map of its
     * parent directory. This has no effect if the entry is already present
     * or `filename` is a root directory.
     */
    fn add_to_subfiles(&mut self, filename: &str) {
        let path = Path::new(filename);
        let (Some(dir_name), Some(base_name)) = (
            path.parent().and_then(Path::to_str),
            path.file_name().and_then(|name| name.to_str()),
        ) else {
            return;
        };
        let subfiles = self
            .norm_cased_dir_to_subfiles
            .entry(self.case.norm_case(dir_name))
            .or_default();
        let norm_cased_base_name = self.case.norm_case(base_name);
        subfiles
            .entry(norm_cased_base_name)
            .or_insert_with(|| base_name.to_string());
    }

    /**
     * Remove the entry for the base name of `norm_cased_filename` from the
     * subfile map of its parent directory. Returns whether this emptied the
     * parent's map (which removes the map), meaning the parent itself is no
     * longer a created directory. Returns false for root directories.
     */
    fn remove_from_subfiles(&mut self, norm_cased_filename: &str) -> bool {
        let path = Path::new(norm_cased_filename);
        let (Some(dir_name), Some(base_name)) = (
            path.parent().and_then(Path::to_str),
            path.file_name().and_then(|name| name.to_str()),
        ) else {
            return false;
        };
        if dir_name.is_empty() {
            return false;
        }
        let Some(subfiles) = self.norm_cased_dir_to_subfiles.get_mut(dir_name) else {
            return false;
        };
        subfiles.remove(base_name);
        if subfiles.is_empty() {
            self.norm_cased_dir_to_subfiles.remove(dir_name);
            true
        } else {
            false
        }
    }
}
