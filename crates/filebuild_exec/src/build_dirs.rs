//! Tracking of the directories for a build.

use filebuild_utils::PathCase;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

/**
 * Keeps track of the directories for a particular build.
 *
 * Specifically, this keeps track of which directories were created or
 * removed in the virtual state of the file system. We must keep `BuildDirs`
 * updated by calling `started_building_file`, `error_building_file`, and
 * `handle_norm_cased_dir_exists` as appropriate. `BuildDirs` is thread-safe
 * and cheap to clone (clones share the same state).
 */
#[derive(Clone)]
pub struct BuildDirs {
    state: Arc<Mutex<BuildDirsState>>,
    case: Arc<dyn PathCase>,
}

struct BuildDirsState {
    /**
     * A map from the norm-cased filename of each directory reserved for at
     * least one descendant build file in the current build to the number of
     * distinct direct children that are reserved for this purpose. For
     * example, if we are currently building '/foo/bar/a.txt', we finished
     * building '/foo/b.txt' and '/foo/bar/c.txt', and there was an error
     * building '/foo/d.txt', then this maps '/foo' to 2: one reservation for
     * '/foo/bar' and one for '/foo/b.txt'. There is no reservation for
     * '/foo/d.txt', because building it failed.
     */
    build_dir_counts: HashMap<String, u64>,

    /**
     * A map from the norm-cased filename of each directory that the current
     * build virtually created and didn't subsequently virtually remove to
     * the corresponding non-norm-cased filename
     */
    created_dirs_map: HashMap<String, String>,

    /**
     * The norm-cased filenames of the directories that the current build
     * virtually created, subsequently virtually removed due to an error
     * while building a file, and didn't subsequently virtually recreate
     */
    error_created_dirs: HashSet<String>,

    /**
     * The norm-cased filenames of directories known to exist in the virtual
     * state of the file system, assuming no external changes. If X is in
     * this set, then so is the parent of X. No member is also present in
     * `removed_dirs`. This bounds how far `handle_dir_exists` has to walk.
     */
    exists_dirs: HashSet<String>,

    /**
     * The norm-cased filenames of directories that might be removed in the
     * virtual state of the file system. To be sure, we need to check whether
     * the directory is a key in `build_dir_counts`, and we need to scan its
     * contents for files or directories not in `maybe_removed_dirs`,
     * `removed_dirs`, or `removed_files` - such entries would have been
     * created externally. The scan is deferred until it becomes necessary. A
     * maybe-removed directory must stay in this set as long as it is a key
     * in `build_dir_counts`, in case later errors while building a file
     * remove it from `build_dir_counts`.
     */
    maybe_removed_dirs: HashSet<String>,

    /**
     * The norm-cased filenames of directories that are removed in the
     * virtual state of the file system, provided they are not keys in
     * `build_dir_counts`. An item in `maybe_removed_dirs` graduates to
     * `removed_dirs` once we confirm it has been removed.
     */
    removed_dirs: HashSet<String>,

    /**
     * The norm-cased filenames of the files from the previous build that are
     * removed in the virtual state of the file system, but might still be
     * present on disk
     */
    removed_files: HashSet<String>,
}

impl BuildDirs {
    /**
     * Initialize a new `BuildDirs` from the directories and files created
     * during the previous build (the latter including the cache file).
     */
    pub fn new(
        old_cache_dirs: &[String],
        old_cache_files: &[String],
        case: Arc<dyn PathCase>,
    ) -> BuildDirs {
        let maybe_removed_dirs = old_cache_dirs
            .iter()
            .map(|dir| case.norm_case(dir))
            .collect();
        let removed_files = old_cache_files
            .iter()
            .map(|filename| case.norm_case(filename))
            .collect();
        BuildDirs {
            state: Arc::new(Mutex::new(BuildDirsState {
                build_dir_counts: HashMap::new(),
                created_dirs_map: HashMap::new(),
                error_created_dirs: HashSet::new(),
                exists_dirs: HashSet::new(),
                maybe_removed_dirs,
                removed_dirs: HashSet::new(),
                removed_files,
            })),
            case,
        }
    }

    /**
     * Return whether the specified norm-cased filename refers to a directory
     * that was created during the previous build or the current build and is
     * not present in the virtual state of the file system.
     */
    pub fn is_removed_norm_case(&self, norm_cased_dir: &str) -> io::Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.build_dir_counts.contains_key(norm_cased_dir) {
            Ok(false)
        } else if state.removed_dirs.contains(norm_cased_dir) {
            Ok(true)
        } else if !state.maybe_removed_dirs.contains(norm_cased_dir) {
            Ok(false)
        } else {
            state.check_maybe_removed_dir(norm_cased_dir, &*self.case)
        }
    }

    /**
     * Respond to the existence of the specified norm-cased directory in the
     * virtual state of the file system, excluding files created in the
     * relevant `CreatedFiles`. The simple operation executor calls this
     * whenever it becomes aware of such a directory.
     */
    pub fn handle_norm_cased_dir_exists(&self, norm_cased_dir: &str) {
        self.state.lock().unwrap().handle_dir_exists(norm_cased_dir);
    }

    /**
     * Handle starting to build a file, including the case where we simply
     * reuse a cached result.
     *
     * `created_dirs` holds the non-norm-cased parent directories of
     * `filename` that we virtually created. Returns the elements of
     * `created_dirs` that this thread "owns": multiple threads might all
     * think they created a given directory, in which case the first thread
     * to reserve it is selected as its creator.
     */
    pub fn started_building_file(
        &self,
        filename: &str,
        created_dirs: &[String],
    ) -> Vec<String> {
        let created_dirs_set = created_dirs.iter().cloned().collect::<HashSet<_>>();
        let mut locked_created_dirs = Vec::new();

        let mut state = self.state.lock().unwrap();
        let norm_cased_filename = self.case.norm_case(filename);
        state.removed_files.remove(&norm_cased_filename);

        let mut parent = parent_of(filename);
        while let Some(dir) = parent {
            let norm_cased_dir = self.case.norm_case(&dir);
            let count = state
                .build_dir_counts
                .get(&norm_cased_dir)
                .copied()
                .unwrap_or(0);
            state.build_dir_counts.insert(norm_cased_dir.clone(), count + 1);
            if count > 0 {
                break;
            }
            if created_dirs_set.contains(&dir) {
                state
                    .created_dirs_map
                    .insert(norm_cased_dir.clone(), dir.clone());
                state.error_created_dirs.remove(&norm_cased_dir);
                state.removed_files.remove(&norm_cased_dir);
                locked_created_dirs.push(dir.clone());
            }

            parent = parent_of(&dir);
        }
        locked_created_dirs
    }

    /** Handle an error building the specified file */
    pub fn error_building_file(&self, filename: &str) {
        let mut state = self.state.lock().unwrap();
        let norm_cased_filename = self.case.norm_case(filename);
        let mut parent = parent_of(&norm_cased_filename);
        while let Some(dir) = parent {
            let Some(count) = state.build_dir_counts.get(&dir).copied() else {
                break;
            };
            if count > 1 {
                state.build_dir_counts.insert(dir.clone(), count - 1);
                break;
            }
            state.build_dir_counts.remove(&dir);
            if state.created_dirs_map.remove(&dir).is_some() {
                state.error_created_dirs.insert(dir.clone());
                state.maybe_removed_dirs.insert(dir.clone());

                // We can't simply remove "dir" from exists_dirs, because
                // that could break the invariant that the parent of every
                // member is also a member
                state.exists_dirs.clear();
            }

            parent = parent_of(&dir);
        }
    }

    /**
     * Return the non-norm-cased filenames of the directories that were
     * virtually created during the current build.
     */
    pub fn created_dirs(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .created_dirs_map
            .values()
            .cloned()
            .collect()
    }

    /**
     * Return the norm-cased filenames of the directories that the current
     * build virtually created, subsequently virtually removed due to an
     * error while building a file, and didn't subsequently recreate.
     */
    pub fn norm_cased_error_created_dirs(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .error_created_dirs
            .iter()
            .cloned()
            .collect()
    }
}

impl BuildDirsState {
    /** Implementation of `handle_norm_cased_dir_exists`, under the lock */
    fn handle_dir_exists(&mut self, norm_cased_dir: &str) {
        let mut parent = norm_cased_dir.to_string();
        loop {
            if self.exists_dirs.contains(&parent) {
                return;
            }
            if self.build_dir_counts.contains_key(&parent) {
                break;
            }
            self.removed_dirs.remove(&parent);
            self.maybe_removed_dirs.remove(&parent);
            self.removed_files.remove(&parent);
            self.exists_dirs.insert(parent.clone());
            match parent_of(&parent) {
                Some(next) => parent = next,
                None => return,
            }
        }

        // The walk reached a reserved directory; keep adding ancestors so
        // that exists_dirs stays closed under taking the parent
        loop {
            if !self.exists_dirs.insert(parent.clone()) {
                return;
            }
            match parent_of(&parent) {
                Some(next) => parent = next,
                None => return,
            }
        }
    }

    /**
     * Scan the contents of the specified norm-cased directory in
     * `maybe_removed_dirs` to determine whether it is present in the virtual
     * file system. Return true if it is not present. Assume it is not a key
     * in `build_dir_counts`.
     */
    fn check_maybe_removed_dir(
        &mut self,
        norm_cased_dir: &str,
        case: &dyn PathCase,
    ) -> io::Result<bool> {
        self.maybe_removed_dirs.remove(norm_cased_dir);

        let entries = match fs::read_dir(norm_cased_dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                // The directory doesn't exist in the real file system, so it
                // doesn't exist in the virtual file system either
                self.removed_dirs.insert(norm_cased_dir.to_string());
                return Ok(true);
            }
            Err(error) if error.kind() == io::ErrorKind::NotADirectory => {
                // The directory was externally removed and a file created in
                // its place
                if let Some(parent) = parent_of(norm_cased_dir) {
                    self.handle_dir_exists(&parent);
                }
                return Ok(false);
            }
            Err(error) => return Err(error),
        };

        let mut subfiles = Vec::new();
        for entry in entries {
            subfiles.push(entry?.file_name());
        }

        for subfile in subfiles {
            let Some(subfile) = subfile.to_str() else {
                // Externally created content we can't have recorded
                self.handle_dir_exists(norm_cased_dir);
                return Ok(false);
            };
            let absolute_subfile = join_path(norm_cased_dir, &case.norm_case(subfile));
            if self.removed_dirs.contains(&absolute_subfile) {
                if Path::new(&absolute_subfile).is_file() {
                    // The directory was externally removed and a file
                    // created in its place
                    self.handle_dir_exists(norm_cased_dir);
                    return Ok(false);
                }
            } else if self.removed_files.contains(&absolute_subfile) {
                if Path::new(&absolute_subfile).is_dir() {
                    // The file was externally removed and a directory
                    // created in its place
                    self.handle_dir_exists(&absolute_subfile);
                    return Ok(false);
                }
            } else if self.maybe_removed_dirs.contains(&absolute_subfile) {
                if !self.check_maybe_removed_dir(&absolute_subfile, case)? {
                    return Ok(false);
                }
            } else {
                if Path::new(&absolute_subfile).is_dir() {
                    self.handle_dir_exists(&absolute_subfile);
                } else {
                    self.handle_dir_exists(norm_cased_dir);
                }
                return Ok(false);
            }
        }

        self.removed_dirs.insert(norm_cased_dir.to_string());
        Ok(true)
    }
}

/** The parent directory of the specified path, or `None` at a root */
pub(crate) fn parent_of(path: &str) -> Option<String> {
    let parent = Path::new(path).parent()?;
    let parent = parent.to_str()?;
    if parent.is_empty() {
        None
    } else {
        Some(parent.to_string())
    }
}

pub(crate) fn join_path(dir: &str, name: &str) -> String {
    Path::new(dir).join(name).to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use filebuild_utils::NativeCase;
    use std::path::PathBuf;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("filebuild_dirs_test_{}", name));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn path_str(path: &Path) -> String {
        path.to_str().unwrap().to_string()
    }

    fn build_dirs(old_dirs: &[String], old_files: &[String]) -> BuildDirs {
        BuildDirs::new(old_dirs, old_files, Arc::new(NativeCase))
    }

    #[test]
    fn test_reservation_arbitration() {
        let dir = temp_dir("arbitration");
        let subdir = path_str(&dir.join("Subdir"));
        let file1 = path_str(&dir.join("Subdir").join("A.txt"));
        let file2 = path_str(&dir.join("Subdir").join("B.txt"));

        let dirs = build_dirs(&[], &[]);
        let owned1 = dirs.started_building_file(&file1, std::slice::from_ref(&subdir));
        assert_eq!(vec![subdir.clone()], owned1);

        // The directory is already reserved, so the second builder does not
        // own it even though it passed it as created
        let owned2 = dirs.started_building_file(&file2, std::slice::from_ref(&subdir));
        assert!(owned2.is_empty());

        assert_eq!(vec![subdir.clone()], dirs.created_dirs());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_error_evicts_created_dirs() {
        let dir = temp_dir("evict");
        let subdir = path_str(&dir.join("Subdir"));
        let file1 = path_str(&dir.join("Subdir").join("A.txt"));
        let file2 = path_str(&dir.join("Subdir").join("B.txt"));

        let dirs = build_dirs(&[], &[]);
        dirs.started_building_file(&file1, std::slice::from_ref(&subdir));
        dirs.started_building_file(&file2, &[]);

        // One of the two reservations failing keeps the directory alive
        dirs.error_building_file(&file2);
        assert_eq!(vec![subdir.clone()], dirs.created_dirs());
        assert!(dirs.norm_cased_error_created_dirs().is_empty());

        // The last reservation failing evicts it
        dirs.error_building_file(&file1);
        assert!(dirs.created_dirs().is_empty());
        assert_eq!(vec![subdir.clone()], dirs.norm_cased_error_created_dirs());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_recreation_clears_error_dirs() {
        let dir = temp_dir("recreate");
        let subdir = path_str(&dir.join("Subdir"));
        let file = path_str(&dir.join("Subdir").join("A.txt"));

        let dirs = build_dirs(&[], &[]);
        dirs.started_building_file(&file, std::slice::from_ref(&subdir));
        dirs.error_building_file(&file);
        assert_eq!(vec![subdir.clone()], dirs.norm_cased_error_created_dirs());

        dirs.started_building_file(&file, std::slice::from_ref(&subdir));
        assert!(dirs.norm_cased_error_created_dirs().is_empty());
        assert_eq!(vec![subdir.clone()], dirs.created_dirs());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_removed_dirs_from_previous_build() {
        let dir = temp_dir("removed");
        let subdir = dir.join("Subdir");
        let subdir_str = path_str(&subdir);

        // The directory from the previous build is gone on disk
        let dirs = build_dirs(std::slice::from_ref(&subdir_str), &[]);
        assert!(dirs.is_removed_norm_case(&subdir_str).unwrap());

        // A prior-build directory that still exists and is empty is regarded
        // as removed in the virtual view
        fs::create_dir_all(&subdir).unwrap();
        let dirs = build_dirs(std::slice::from_ref(&subdir_str), &[]);
        assert!(dirs.is_removed_norm_case(&subdir_str).unwrap());

        // Externally created content resurrects the directory
        fs::write(subdir.join("external.txt"), "x").unwrap();
        let dirs = build_dirs(std::slice::from_ref(&subdir_str), &[]);
        assert!(!dirs.is_removed_norm_case(&subdir_str).unwrap());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_prior_build_outputs_do_not_resurrect_dirs() {
        let dir = temp_dir("outputs");
        let subdir = dir.join("Subdir");
        let subdir_str = path_str(&subdir);
        let output = subdir.join("Output.txt");
        fs::create_dir_all(&subdir).unwrap();
        fs::write(&output, "x").unwrap();

        // The only content is a file created by the previous build, which is
        // removed in the virtual view
        let dirs = build_dirs(
            std::slice::from_ref(&subdir_str),
            std::slice::from_ref(&path_str(&output)),
        );
        assert!(dirs.is_removed_norm_case(&subdir_str).unwrap());
        assert!(dirs.is_removed_norm_case(&subdir_str).unwrap());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_reserved_dirs_are_not_removed() {
        let dir = temp_dir("reserved");
        let subdir = path_str(&dir.join("Subdir"));
        let file = path_str(&dir.join("Subdir").join("A.txt"));

        let dirs = build_dirs(std::slice::from_ref(&subdir), &[]);
        dirs.started_building_file(&file, std::slice::from_ref(&subdir));
        assert!(!dirs.is_removed_norm_case(&subdir).unwrap());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_handle_dir_exists_closure() {
        let dir = temp_dir("closure");
        let subdir = path_str(&dir.join("Sub1").join("Sub2"));

        let dirs = build_dirs(std::slice::from_ref(&subdir), &[]);
        dirs.handle_norm_cased_dir_exists(&subdir);

        // The directory and its ancestors were dropped from the removed sets
        assert!(!dirs.is_removed_norm_case(&subdir).unwrap());

        fs::remove_dir_all(&dir).ok();
    }
}
