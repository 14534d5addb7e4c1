//! Execution of simple operations.

use crate::build_dirs::{BuildDirs, join_path, parent_of};
use crate::created_files::CreatedFiles;
use filebuild_core::{BuildError, Cache, FileComparison, SimpleOpKind};
use filebuild_utils::{PathCase, hash_file};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;

/**
 * Executes simple operations.
 *
 * All simple operations are performed according to the virtual state of the
 * file system. The return values are deterministic in the sense of
 * `json::is_equal`; for example, the order of the files returned by
 * `list_dir` is consistent. `SimpleOpExecutor` is thread-safe.
 */
pub struct SimpleOpExecutor {
    norm_cased_cache_filename: String,

    /** The cache storing the results from the previous build */
    old_cache: Cache,

    /**
     * The cache storing the results for the current build. Created
     * directories aren't added to it until the root build function has
     * finished.
     */
    new_cache: Cache,

    build_dirs: BuildDirs,
    case: Arc<dyn PathCase>,

    /**
     * A map from norm-cased filenames to their hashes. Each value pairs the
     * SHA-256 hex string with whether we had started (or finished) building
     * the file when it was hashed.
     */
    hash_cache: Mutex<HashMap<String, (String, bool)>>,
}

impl SimpleOpExecutor {
    pub fn new(
        cache_filename: &str,
        old_cache: Cache,
        new_cache: Cache,
        build_dirs: BuildDirs,
        case: Arc<dyn PathCase>,
    ) -> SimpleOpExecutor {
        SimpleOpExecutor {
            norm_cased_cache_filename: case.norm_case(cache_filename),
            old_cache,
            new_cache,
            build_dirs,
            case,
            hash_cache: Mutex::new(HashMap::new()),
        }
    }

    /**
     * Execute the specified simple operation with the specified recorded
     * arguments, regarding the files in `created_files` (if any) as created.
     * Fails with `BadArg` if the arguments don't match the operation.
     */
    pub fn exec(
        &self,
        kind: SimpleOpKind,
        args: &[Value],
        created_files: Option<&CreatedFiles>,
    ) -> Result<Value, BuildError> {
        match kind {
            SimpleOpKind::Read => {
                check_arg_count(args, 2)?;
                let comparison = FileComparison::parse(arg_str(args, 1)?)
                    .ok_or_else(invalid_args)?;
                self.read(arg_str(args, 0)?, comparison, created_files)
            }
            SimpleOpKind::ListDir => {
                check_arg_count(args, 1)?;
                let subfiles = self.list_dir(arg_str(args, 0)?, created_files)?;
                Ok(Value::Array(
                    subfiles.into_iter().map(Value::String).collect(),
                ))
            }
            SimpleOpKind::Walk => {
                check_arg_count(args, 2)?;
                let top_down = args[1].as_bool().ok_or_else(invalid_args)?;
                self.walk(arg_str(args, 0)?, top_down, created_files)
            }
            SimpleOpKind::IsFile => {
                check_arg_count(args, 1)?;
                Ok(Value::Bool(self.is_file(arg_str(args, 0)?, created_files)?))
            }
            SimpleOpKind::IsDir => {
                check_arg_count(args, 1)?;
                Ok(Value::Bool(self.is_dir(arg_str(args, 0)?, created_files)?))
            }
            SimpleOpKind::Exists => {
                check_arg_count(args, 1)?;
                Ok(Value::Bool(self.exists(arg_str(args, 0)?, created_files)?))
            }
            SimpleOpKind::GetSize => {
                check_arg_count(args, 1)?;
                Ok(Value::from(self.get_size(arg_str(args, 0)?, created_files)?))
            }
        }
    }

    /** Return whether the specified file is the cache file */
    pub fn is_cache_file(&self, filename: &str) -> bool {
        self.case.norm_case(filename) == self.norm_cased_cache_filename
    }

    /**
     * Return a non-null JSON value describing the result of performing the
     * specified comparison on the specified file. If the same call produces
     * an equal value later on, we conclude that the file hasn't changed.
     * Unlike most other methods, this is based on the real file system, not
     * the virtual state of the file system.
     */
    pub fn file_comparison_result(
        &self,
        filename: &str,
        file_comparison: FileComparison,
    ) -> Result<Value, BuildError> {
        match file_comparison {
            FileComparison::Metadata => self.file_metadata(filename),
            FileComparison::Hash => self.file_hash(filename),
        }
    }

    /**
     * Return the result of the specified read operation: a file comparison
     * result for the file, which is how we determine whether the read
     * operation is cached.
     */
    pub fn read(
        &self,
        filename: &str,
        file_comparison: FileComparison,
        created_files: Option<&CreatedFiles>,
    ) -> Result<Value, BuildError> {
        let norm_cased_filename = self.case.norm_case(filename);
        if self.is_file_no_read(&norm_cased_filename, created_files) == Some(false) {
            if self.is_dir(filename, created_files)? {
                return Err(BuildError::IsADirectory(filename.to_string()));
            }
            return Err(BuildError::FileNotFound(filename.to_string()));
        }

        let result = self.file_comparison_result(filename, file_comparison)?;

        // The file must exist, since the comparison didn't fail
        if !created_files
            .is_some_and(|created_files| created_files.has_norm_cased_file(&norm_cased_filename))
        {
            if let Some(parent) = parent_of(&norm_cased_filename) {
                self.build_dirs.handle_norm_cased_dir_exists(&parent);
            }
        }
        Ok(result)
    }

    /**
     * Return the non-norm-cased names of the subfiles of the specified
     * directory in the virtual state of the file system, sorted.
     */
    pub fn list_dir(
        &self,
        dir: &str,
        created_files: Option<&CreatedFiles>,
    ) -> Result<Vec<String>, BuildError> {
        self.assert_is_dir(dir, created_files)?;
        let mut subfiles = Vec::new();
        for subfile in self.list_dir_superset(dir, created_files)? {
            let absolute_subfile = join_path(dir, &subfile);
            if self.exists(&absolute_subfile, created_files)? {
                subfiles.push(subfile);
            }
        }
        Ok(subfiles)
    }

    /**
     * Return the files in the specified directory, recursively, as a list of
     * `[dir, subdirs, subfiles]` entries. If `top_down` is true, the entry
     * for a directory appears before the entries for the directories it
     * contains; otherwise it appears after. This returns an empty list if
     * `dir` is not a directory in the virtual state of the file system, and
     * it does not descend into symbolic links.
     */
    pub fn walk(
        &self,
        dir: &str,
        top_down: bool,
        created_files: Option<&CreatedFiles>,
    ) -> Result<Value, BuildError> {
        let mut results = Vec::new();
        if self.is_dir(dir, created_files)? {
            self.append_walk(dir, top_down, created_files, &mut results)?;
        }
        Ok(Value::Array(results))
    }

    /**
     * Return whether the specified filename refers to a regular file in the
     * virtual state of the file system.
     */
    pub fn is_file(
        &self,
        filename: &str,
        created_files: Option<&CreatedFiles>,
    ) -> Result<bool, BuildError> {
        let norm_cased_filename = self.case.norm_case(filename);
        if let Some(is_file) = self.is_file_no_read(&norm_cased_filename, created_files) {
            Ok(is_file)
        } else if Path::new(&norm_cased_filename).is_file() {
            if let Some(parent) = parent_of(&norm_cased_filename) {
                self.build_dirs.handle_norm_cased_dir_exists(&parent);
            }
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /**
     * Return whether the specified filename refers to a directory in the
     * virtual state of the file system.
     */
    pub fn is_dir(
        &self,
        filename: &str,
        created_files: Option<&CreatedFiles>,
    ) -> Result<bool, BuildError> {
        let norm_cased_dir = self.case.norm_case(filename);
        if let Some(created_files) = created_files {
            if created_files.has_norm_cased_dir(&norm_cased_dir) {
                return Ok(true);
            }
            if created_files.has_norm_cased_file(&norm_cased_dir) {
                return Ok(false);
            }
        }

        if self.build_dirs.is_removed_norm_case(&norm_cased_dir)? {
            Ok(false)
        } else if Path::new(&norm_cased_dir).is_dir() {
            self.build_dirs.handle_norm_cased_dir_exists(&norm_cased_dir);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /** Return whether the specified file exists in the virtual view */
    pub fn exists(
        &self,
        filename: &str,
        created_files: Option<&CreatedFiles>,
    ) -> Result<bool, BuildError> {
        Ok(self.is_file(filename, created_files)?
            || self.is_dir(filename, created_files)?)
    }

    /** Return the size of the specified file in bytes */
    pub fn get_size(
        &self,
        filename: &str,
        created_files: Option<&CreatedFiles>,
    ) -> Result<u64, BuildError> {
        self.assert_exists(filename, created_files)?;
        Ok(fs::metadata(filename)?.len())
    }

    /** Implementation of `file_comparison_result` for `Metadata` */
    fn file_metadata(&self, filename: &str) -> Result<Value, BuildError> {
        let metadata = match fs::metadata(filename) {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Err(BuildError::FileNotFound(filename.to_string()));
            }
            Err(error) => return Err(BuildError::Io(error)),
        };
        if metadata.is_dir() {
            return Err(BuildError::IsADirectory(filename.to_string()));
        }

        let time_ns = match metadata.modified()?.duration_since(UNIX_EPOCH) {
            Ok(duration) => duration.as_nanos() as i64,
            Err(error) => -(error.duration().as_nanos() as i64),
        };
        let mut result = Map::new();
        result.insert("size".to_string(), Value::from(metadata.len()));
        result.insert("timeNs".to_string(), Value::from(time_ns));
        Ok(Value::Object(result))
    }

    /** Implementation of `file_comparison_result` for `Hash` */
    fn file_hash(&self, filename: &str) -> Result<Value, BuildError> {
        let norm_cased_filename = self.case.norm_case(filename);
        let is_built = self.new_cache.has_norm_cased_file(&norm_cased_filename);

        let cache_entry = self
            .hash_cache
            .lock()
            .unwrap()
            .get(&norm_cased_filename)
            .cloned();
        if let Some((hash, was_built)) = cache_entry {
            if was_built == is_built {
                // Manually check whether the file still exists, since we
                // won't be reading it
                let path = Path::new(&norm_cased_filename);
                if !path.is_file() {
                    if path.is_dir() {
                        return Err(BuildError::IsADirectory(filename.to_string()));
                    }
                    return Err(BuildError::FileNotFound(filename.to_string()));
                }
                return Ok(Value::String(hash));
            }
        }

        match fs::metadata(&norm_cased_filename) {
            Ok(metadata) if metadata.is_dir() => {
                return Err(BuildError::IsADirectory(filename.to_string()));
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Err(BuildError::FileNotFound(filename.to_string()));
            }
            _ => {}
        }
        let hash = hash_file(&norm_cased_filename)?;

        self.hash_cache
            .lock()
            .unwrap()
            .insert(norm_cased_filename, (hash.clone(), is_built));
        Ok(Value::String(hash))
    }

    /**
     * The implementation of `is_file` before checking the real file system.
     * Returns `Some(true)` or `Some(false)` if the answer can be determined
     * without a stat, and `None` if the virtual answer equals the real one.
     */
    fn is_file_no_read(
        &self,
        norm_cased_filename: &str,
        created_files: Option<&CreatedFiles>,
    ) -> Option<bool> {
        if let Some(created_files) = created_files {
            if created_files.has_norm_cased_file(norm_cased_filename) {
                return Some(true);
            }
            if created_files.has_norm_cased_dir(norm_cased_filename) {
                return Some(false);
            }
        }

        if norm_cased_filename == self.norm_cased_cache_filename {
            Some(false)
        } else if self.new_cache.has_norm_cased_file(norm_cased_filename) {
            if self.new_cache.get_norm_cased_file(norm_cased_filename).is_none() {
                // We are currently building the file
                Some(false)
            } else {
                None
            }
        } else if self.old_cache.created_norm_cased_file(norm_cased_filename) {
            Some(false)
        } else {
            None
        }
    }

    /**
     * Fail if the specified filename does not refer to a directory in the
     * virtual state of the file system.
     */
    fn assert_is_dir(
        &self,
        filename: &str,
        created_files: Option<&CreatedFiles>,
    ) -> Result<(), BuildError> {
        if !self.is_dir(filename, created_files)? {
            if self.is_file(filename, created_files)? {
                return Err(BuildError::NotADirectory(filename.to_string()));
            }
            return Err(BuildError::FileNotFound(filename.to_string()));
        }
        Ok(())
    }

    /** Fail if the specified file does not exist in the virtual view */
    fn assert_exists(
        &self,
        filename: &str,
        created_files: Option<&CreatedFiles>,
    ) -> Result<(), BuildError> {
        if !self.exists(filename, created_files)? {
            return Err(BuildError::FileNotFound(filename.to_string()));
        }
        Ok(())
    }

    /**
     * Return a sorted superset of `list_dir(dir, created_files)`. To compute
     * the true result, the caller must check whether each file in the
     * superset exists in the virtual state of the file system.
     */
    fn list_dir_superset(
        &self,
        dir: &str,
        created_files: Option<&CreatedFiles>,
    ) -> Result<Vec<String>, BuildError> {
        let mut subfiles = Vec::new();
        for entry in fs::read_dir(dir)? {
            let file_name = entry?.file_name();
            match file_name.into_string() {
                Ok(file_name) => subfiles.push(file_name),
                // A name we can't represent must surface rather than
                // silently vanish from the virtual view
                Err(file_name) => return Err(non_utf8_entry_error(&file_name)),
            }
        }

        if let Some(created_files) = created_files {
            let norm_cased_subfiles = subfiles
                .iter()
                .map(|subfile| self.case.norm_case(subfile))
                .collect::<std::collections::HashSet<_>>();
            for subfile in created_files.list_dir(dir) {
                if !norm_cased_subfiles.contains(&self.case.norm_case(&subfile)) {
                    subfiles.push(subfile);
                }
            }
        }

        subfiles.sort_unstable();
        Ok(subfiles)
    }

    /**
     * Append the result of walking `dir` to `results`. This assumes that
     * `dir` is a directory.
     */
    fn append_walk(
        &self,
        dir: &str,
        top_down: bool,
        created_files: Option<&CreatedFiles>,
        results: &mut Vec<Value>,
    ) -> Result<(), BuildError> {
        // Unreadable directories are treated as empty, but a non-UTF-8
        // entry is an error here too, as in list_dir
        let list_dir_superset = match self.list_dir_superset(dir, created_files) {
            Ok(subfiles) => subfiles,
            Err(BuildError::Io(error)) if error.kind() == io::ErrorKind::InvalidData => {
                return Err(BuildError::Io(error));
            }
            Err(_) => Vec::new(),
        };

        let mut subdirs = Vec::new();
        let mut subfiles = Vec::new();
        for subfile in list_dir_superset {
            let absolute_subfile = join_path(dir, &subfile);
            if self.is_file(&absolute_subfile, created_files)? {
                subfiles.push(subfile);
            } else if self.is_dir(&absolute_subfile, created_files)? {
                subdirs.push(subfile);
            }
        }

        if top_down {
            results.push(walk_entry(dir, &subdirs, &subfiles));
        }
        for subdir in &subdirs {
            let absolute_subdir = join_path(dir, subdir);
            if !Path::new(&absolute_subdir).is_symlink() {
                self.append_walk(&absolute_subdir, top_down, created_files, results)?;
            }
        }
        if !top_down {
            results.push(walk_entry(dir, &subdirs, &subfiles));
        }
        Ok(())
    }
}

fn walk_entry(dir: &str, subdirs: &[String], subfiles: &[String]) -> Value {
    let to_array = |names: &[String]| {
        Value::Array(names.iter().cloned().map(Value::String).collect())
    };
    Value::Array(vec![
        Value::String(dir.to_string()),
        to_array(subdirs),
        to_array(subfiles),
    ])
}

fn check_arg_count(args: &[Value], count: usize) -> Result<(), BuildError> {
    if args.len() == count {
        Ok(())
    } else {
        Err(invalid_args())
    }
}

fn arg_str(args: &[Value], index: usize) -> Result<&str, BuildError> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(invalid_args)
}

fn invalid_args() -> BuildError {
    BuildError::BadArg("invalid simple operation arguments".to_string())
}

fn non_utf8_entry_error(file_name: &std::ffi::OsStr) -> BuildError {
    BuildError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        format!(
            "directory entry is not valid UTF-8: {}",
            file_name.to_string_lossy(),
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use filebuild_utils::NativeCase;
    use serde_json::json;
    use std::path::PathBuf;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("filebuild_executor_test_{}", name));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn path_str(path: &Path) -> String {
        path.to_str().unwrap().to_string()
    }

    fn executor(dir: &Path) -> SimpleOpExecutor {
        let case: Arc<dyn PathCase> = Arc::new(NativeCase);
        let cache_filename = path_str(&dir.join("cache.gz"));
        let old_cache = Cache::create_empty_immutable("test", Map::new(), Arc::clone(&case));
        let new_cache = Cache::create_empty_mutable("test", Map::new(), Arc::clone(&case));
        let build_dirs = BuildDirs::new(&[], &[], Arc::clone(&case));
        SimpleOpExecutor::new(&cache_filename, old_cache, new_cache, build_dirs, case)
    }

    #[test]
    fn test_is_file_and_is_dir() {
        let dir = temp_dir("is_file");
        let file = dir.join("File.txt");
        fs::write(&file, "text").unwrap();
        let executor = executor(&dir);

        assert!(executor.is_file(&path_str(&file), None).unwrap());
        assert!(!executor.is_dir(&path_str(&file), None).unwrap());
        assert!(executor.is_dir(&path_str(&dir), None).unwrap());
        assert!(!executor.is_file(&path_str(&dir), None).unwrap());
        assert!(executor.exists(&path_str(&file), None).unwrap());
        assert!(
            !executor
                .exists(&path_str(&dir.join("Missing.txt")), None)
                .unwrap()
        );

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_cache_file_is_masked() {
        let dir = temp_dir("cache_file");
        let cache_file = dir.join("cache.gz");
        fs::write(&cache_file, "data").unwrap();
        let executor = executor(&dir);

        assert!(executor.is_cache_file(&path_str(&cache_file)));
        assert!(!executor.is_file(&path_str(&cache_file), None).unwrap());
        assert!(!executor.exists(&path_str(&cache_file), None).unwrap());
        assert_eq!(
            Vec::<String>::new(),
            executor.list_dir(&path_str(&dir), None).unwrap()
        );

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_in_progress_files_are_masked() {
        let dir = temp_dir("in_progress");
        let file = dir.join("Output.txt");
        fs::write(&file, "partial").unwrap();
        let executor = executor(&dir);

        executor.new_cache.start_building_file(&path_str(&file)).unwrap();
        assert!(!executor.is_file(&path_str(&file), None).unwrap());
        assert!(!executor.exists(&path_str(&file), None).unwrap());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_list_dir_is_sorted_and_virtual() {
        let dir = temp_dir("list_dir");
        fs::write(dir.join("b.txt"), "b").unwrap();
        fs::write(dir.join("a.txt"), "a").unwrap();
        fs::create_dir(dir.join("Sub")).unwrap();
        let executor = executor(&dir);

        assert_eq!(
            vec!["Sub".to_string(), "a.txt".to_string(), "b.txt".to_string()],
            executor.list_dir(&path_str(&dir), None).unwrap()
        );

        let missing = executor.list_dir(&path_str(&dir.join("None")), None);
        assert!(matches!(missing, Err(BuildError::FileNotFound(_))));
        let not_dir = executor.list_dir(&path_str(&dir.join("a.txt")), None);
        assert!(matches!(not_dir, Err(BuildError::NotADirectory(_))));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_list_dir_includes_overlay_files() {
        let dir = temp_dir("overlay");
        let executor = executor(&dir);
        let case: Arc<dyn PathCase> = Arc::new(NativeCase);
        let mut created_files = CreatedFiles::new(case);
        created_files.started_building_file(&path_str(&dir.join("New.txt")));
        created_files.finished_building_file(&path_str(&dir.join("New.txt")));

        assert_eq!(
            vec!["New.txt".to_string()],
            executor.list_dir(&path_str(&dir), Some(&created_files)).unwrap()
        );

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_walk() {
        let dir = temp_dir("walk");
        fs::create_dir_all(dir.join("Sub")).unwrap();
        fs::write(dir.join("a.txt"), "a").unwrap();
        fs::write(dir.join("Sub").join("b.txt"), "b").unwrap();
        let executor = executor(&dir);

        let top_down = executor.walk(&path_str(&dir), true, None).unwrap();
        assert_eq!(
            json!([
                [path_str(&dir), ["Sub"], ["a.txt"]],
                [path_str(&dir.join("Sub")), [], ["b.txt"]],
            ]),
            top_down,
        );

        let bottom_up = executor.walk(&path_str(&dir), false, None).unwrap();
        assert_eq!(
            json!([
                [path_str(&dir.join("Sub")), [], ["b.txt"]],
                [path_str(&dir), ["Sub"], ["a.txt"]],
            ]),
            bottom_up,
        );

        // Walking a non-directory returns an empty list
        assert_eq!(
            json!([]),
            executor.walk(&path_str(&dir.join("a.txt")), true, None).unwrap()
        );

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_get_size() {
        let dir = temp_dir("get_size");
        fs::write(dir.join("a.txt"), "12345").unwrap();
        let executor = executor(&dir);

        assert_eq!(5, executor.get_size(&path_str(&dir.join("a.txt")), None).unwrap());
        let missing = executor.get_size(&path_str(&dir.join("b.txt")), None);
        assert!(matches!(missing, Err(BuildError::FileNotFound(_))));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_read_returns_comparison_results() {
        let dir = temp_dir("read");
        let file = dir.join("a.txt");
        fs::write(&file, "contents").unwrap();
        let executor = executor(&dir);

        let metadata = executor
            .read(&path_str(&file), FileComparison::Metadata, None)
            .unwrap();
        assert_eq!(json!(8), metadata["size"]);
        assert!(metadata["timeNs"].is_number());

        let hash = executor
            .read(&path_str(&file), FileComparison::Hash, None)
            .unwrap();
        assert_eq!(
            json!(filebuild_utils::hash_file(&file).unwrap()),
            hash,
        );

        let missing = executor.read(
            &path_str(&dir.join("b.txt")),
            FileComparison::Metadata,
            None,
        );
        assert!(matches!(missing, Err(BuildError::FileNotFound(_))));
        let is_dir = executor.read(&path_str(&dir), FileComparison::Metadata, None);
        assert!(matches!(is_dir, Err(BuildError::IsADirectory(_))));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_hash_results_are_cached() {
        let dir = temp_dir("hash_cache");
        let file = dir.join("a.txt");
        fs::write(&file, "v1").unwrap();
        let executor = executor(&dir);

        let hash1 = executor
            .file_comparison_result(&path_str(&file), FileComparison::Hash)
            .unwrap();

        // The cached hash is reused even though the contents changed,
        // because the build state of the file didn't change
        fs::write(&file, "v2").unwrap();
        let hash2 = executor
            .file_comparison_result(&path_str(&file), FileComparison::Hash)
            .unwrap();
        assert_eq!(hash1, hash2);

        // Starting to build the file invalidates the cached hash
        executor.new_cache.start_building_file(&path_str(&file)).unwrap();
        let hash3 = executor
            .file_comparison_result(&path_str(&file), FileComparison::Hash)
            .unwrap();
        assert_ne!(hash1, hash3);

        fs::remove_dir_all(&dir).ok();
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_entries_are_surfaced() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = temp_dir("non_utf8");
        fs::write(dir.join("ok.txt"), "x").unwrap();
        fs::write(dir.join(OsStr::from_bytes(b"bad\xff.txt")), "x").unwrap();
        let executor = executor(&dir);

        let listed = executor.list_dir(&path_str(&dir), None);
        assert!(matches!(listed, Err(BuildError::Io(_))));
        let walked = executor.walk(&path_str(&dir), true, None);
        assert!(matches!(walked, Err(BuildError::Io(_))));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_exec_dispatch() {
        let dir = temp_dir("exec");
        fs::write(dir.join("a.txt"), "abc").unwrap();
        let executor = executor(&dir);

        let result = executor
            .exec(
                SimpleOpKind::IsFile,
                &[json!(path_str(&dir.join("a.txt")))],
                None,
            )
            .unwrap();
        assert_eq!(json!(true), result);

        let result = executor
            .exec(SimpleOpKind::ListDir, &[json!(path_str(&dir))], None)
            .unwrap();
        assert_eq!(json!(["a.txt"]), result);

        let bad_args = executor.exec(SimpleOpKind::Walk, &[json!("x")], None);
        assert!(matches!(bad_args, Err(BuildError::BadArg(_))));

        fs::remove_dir_all(&dir).ok();
    }
}
