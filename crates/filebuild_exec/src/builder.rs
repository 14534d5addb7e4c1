//! The build engine.

use crate::backups::FileBackups;
use crate::build_dirs::{BuildDirs, join_path, parent_of};
use crate::created_files::CreatedFiles;
use crate::executor::SimpleOpExecutor;
use filebuild_core::operation::subbuild_key;
use filebuild_core::{
    BuildError, BuildFileOp, Cache, FileComparison, Operation, SimpleOp, SimpleOpKind,
    SubbuildOp, Value,
};
use filebuild_utils::{HashableValue, NativeCase, PathCase, is_equal, sanitize};
use log::{error, info, warn};
use serde::Serialize;
use serde_json::Map;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

/** The shared state for one root build */
struct BuildContext {
    cache_filename: String,

    /** The cached results from the previous build */
    old_cache: Cache,

    /**
     * The cached results for the current build. Created directories aren't
     * added to it until the root build function has finished; it's easier to
     * figure out which directories were created at the end of the build,
     * considering how directories can be virtually created and removed
     * concurrently.
     */
    new_cache: Cache,

    executor: SimpleOpExecutor,
    backups: FileBackups,
    build_dirs: BuildDirs,
    case: Arc<dyn PathCase>,
}

/**
 * Performs caching for operations that depend on files and file contents.
 *
 * `FileBuilder` is useful for "build" operations that are performed
 * repeatedly on a group of files that mostly stay the same between builds.
 * By caching arbitrary information about those files, it can significantly
 * speed up build operations. An example use case would be linting all of the
 * source files in a given directory: by caching the lint results for each
 * file, `FileBuilder` ensures we don't re-lint files that haven't changed
 * since the last build.
 *
 * Calling `FileBuilder::build` or `FileBuilder::build_versioned` runs a
 * build operation. There are two types of cacheable operations that may
 * occur during a build: "build file" operations, triggered by calling
 * `build_file` or `build_file_with_comparison`, and "subbuild" operations,
 * triggered by calling `subbuild`. Whenever one of these is called, we check
 * whether the result is cached. If so, we use the cached result; if not, we
 * obtain the result by calling the supplied function.
 *
 * For this to work properly, the supplied functions must obey certain rules:
 *
 * * They must be functional: they may depend only on their arguments and on
 *   the contents of the file system, and they may not have side effects
 *   (irrelevant side effects like logging are permitted).
 * * They must be deterministic.
 * * All file system operations on the relevant files must be performed by
 *   calling a method on the `FileBuilder` passed to them. In particular,
 *   relevant files may only be read through `read_text`, `read_binary`, or
 *   after `declare_read`, and a relevant file may only be written during a
 *   `build_file` call for that file.
 *
 * If these restrictions are followed, then `build` behaves as though every
 * build starts from scratch: it appears to remove all files created during
 * the previous build, call the supplied function, and on failure roll the
 * file system back to its prior state. In reality, cached results from the
 * previous build are reused whenever possible, and files from the previous
 * build are not deleted unless they have to be. The results of the file
 * system methods such as `is_file` and `list_dir` reflect this virtual state
 * of the file system, not simply the real state.
 *
 * `FileBuilder` does its best to deal with concurrent external changes to
 * files and directories, but it makes no guarantees.
 *
 * `FileBuilder` is thread-safe: a build process may be parallelized by
 * driving `build_file` and `subbuild` calls from multiple threads.
 */
pub struct FileBuilder {
    context: Arc<BuildContext>,

    /** Whether this is the scope for the root build function */
    is_root: bool,

    /** The operations this scope has performed so far, in order */
    suboperations: Mutex<Vec<Operation>>,
}

impl FileBuilder {
    /**
     * Execute a build operation. This is equivalent to `build_versioned`
     * with an empty version map.
     */
    pub fn build<F, R>(
        cache_filename: impl AsRef<Path>,
        build_name: &str,
        func: F,
    ) -> Result<R, BuildError>
    where
        F: FnOnce(&FileBuilder) -> Result<R, BuildError>,
    {
        FileBuilder::build_versioned(cache_filename, build_name, &Map::new(), func)
    }

    /**
     * Execute a build operation.
     *
     * The behavior is equivalent to the following: delete all of the files
     * written during the previous build (even if some of them have changed),
     * including `cache_filename`, along with the previous build's empty
     * directories; call `func(builder)`; if `func` succeeds, commit, storing
     * all of the results in `cache_filename`; if `func` fails, roll back,
     * deleting the files and directories created during the current build
     * and restoring the files from the previous build. In reality, cached
     * results from the previous build are reused whenever possible.
     *
     * The result of `func` is not cached; only `build_file` and `subbuild`
     * results are. `func` must perform all file system operations through
     * the `FileBuilder` passed to it, but unlike build file and subbuild
     * functions it need not be functional or deterministic.
     *
     * `versions` is a map from function names to arbitrary JSON values
     * describing their behavior. Changing a function's version invalidates
     * all of its cache entries, along with the cache entries of the
     * functions that called it, directly or indirectly. (A function absent
     * from the map has a version of JSON null.) A simple convention is to
     * set a function's version to the current timestamp whenever its
     * behavior changes.
     */
    pub fn build_versioned<V, F, R>(
        cache_filename: impl AsRef<Path>,
        build_name: &str,
        versions: &V,
        func: F,
    ) -> Result<R, BuildError>
    where
        V: Serialize + ?Sized,
        F: FnOnce(&FileBuilder) -> Result<R, BuildError>,
    {
        FileBuilder::build_versioned_with_case(
            cache_filename,
            build_name,
            versions,
            Arc::new(NativeCase),
            func,
        )
    }

    /**
     * Like `build_versioned`, but with an explicit file name case rule. This
     * exists so that case-insensitive behavior can be exercised on
     * case-sensitive file systems.
     */
    pub fn build_versioned_with_case<V, F, R>(
        cache_filename: impl AsRef<Path>,
        build_name: &str,
        versions: &V,
        case: Arc<dyn PathCase>,
        func: F,
    ) -> Result<R, BuildError>
    where
        V: Serialize + ?Sized,
        F: FnOnce(&FileBuilder) -> Result<R, BuildError>,
    {
        let cache_filename = sanitize_filename(cache_filename.as_ref())?;
        let sanitized_versions = sanitize_versions(versions)?;

        let cache_path = Path::new(&cache_filename);
        let old_cache = if cache_path.is_file() {
            let old_cache = Cache::read_immutable(&cache_filename, Arc::clone(&case))?;
            if old_cache.build_name() != build_name {
                return Err(BuildError::CacheFormat(format!(
                    "the cache file was created for the build named {}, which is \
                     different from the specified build name {}",
                    old_cache.build_name(),
                    build_name,
                )));
            }
            old_cache
        } else if cache_path.is_dir() {
            return Err(BuildError::IsADirectory(cache_filename));
        } else {
            info!(
                "The cache file {} does not exist, so building everything from scratch",
                cache_filename,
            );
            Cache::create_empty_immutable(
                build_name,
                sanitized_versions.clone(),
                Arc::clone(&case),
            )
        };

        let new_cache =
            Cache::create_empty_mutable(build_name, sanitized_versions, Arc::clone(&case));
        let mut old_cache_files = old_cache.created_files();
        old_cache_files.push(cache_filename.clone());
        let build_dirs = BuildDirs::new(
            &old_cache.created_dirs(),
            &old_cache_files,
            Arc::clone(&case),
        );
        let executor = SimpleOpExecutor::new(
            &cache_filename,
            old_cache.clone(),
            new_cache.clone(),
            build_dirs.clone(),
            Arc::clone(&case),
        );
        let backups = FileBackups::new()?;

        let builder = FileBuilder {
            context: Arc::new(BuildContext {
                cache_filename,
                old_cache,
                new_cache,
                executor,
                backups,
                build_dirs,
                case,
            }),
            is_root: true,
            suboperations: Mutex::new(Vec::new()),
        };
        builder.run_root_build(func)
    }

    /**
     * Remove the files created during the previous build (even if some of
     * them have changed), including `cache_filename`, and remove all of the
     * directories created during the previous build that are empty. If the
     * cache file doesn't exist, we assume there were no previous builds and
     * do nothing.
     *
     * `build_name` identifies the build type, as in `build`; pass `None` if
     * the build name is unknown.
     */
    pub fn clean(
        cache_filename: impl AsRef<Path>,
        build_name: Option<&str>,
    ) -> Result<(), BuildError> {
        FileBuilder::clean_with_case(cache_filename, build_name, Arc::new(NativeCase))
    }

    /** Like `clean`, but with an explicit file name case rule */
    pub fn clean_with_case(
        cache_filename: impl AsRef<Path>,
        build_name: Option<&str>,
        case: Arc<dyn PathCase>,
    ) -> Result<(), BuildError> {
        let cache_filename = sanitize_filename(cache_filename.as_ref())?;
        if !Path::new(&cache_filename).exists() {
            info!(
                "The cache file {} does not exist, so there's nothing to clean",
                cache_filename,
            );
            return Ok(());
        }

        let cache = Cache::read_immutable(&cache_filename, case)?;
        if let Some(build_name) = build_name {
            if cache.build_name() != build_name {
                return Err(BuildError::CacheFormat(format!(
                    "the cache file was created for the build named {}, which is \
                     different from the specified build name {}",
                    cache.build_name(),
                    build_name,
                )));
            }
        }

        for filename in cache.created_files() {
            try_to_remove_file(&filename);
        }
        try_to_remove_file(&cache_filename);
        remove_empty_dirs(cache.created_dirs());
        Ok(())
    }

    /**
     * Write the specified output file. This is equivalent to
     * `build_file_with_comparison` with the `Metadata` comparison and no
     * keyword arguments.
     */
    pub fn build_file<A, F>(
        &self,
        filename: impl AsRef<Path>,
        func_name: &str,
        args: &A,
        func: F,
    ) -> Result<Value, BuildError>
    where
        A: Serialize + ?Sized,
        F: FnOnce(&FileBuilder, &str, &Value, &Value) -> Result<Value, BuildError>,
    {
        self.build_file_with_comparison(
            filename,
            FileComparison::Metadata,
            func_name,
            args,
            &Map::new(),
            func,
        )
    }

    /**
     * Write the specified output file.
     *
     * This is equivalent to calling `func(builder, absolute_filename, args,
     * kwargs)`, where `builder` is a fresh `FileBuilder` scope. `func` must
     * write to the given file. If possible, we use the cached results from
     * the previous build instead of calling `func`, retaining the current
     * contents of the file.
     *
     * Before calling `func`, this automatically creates all of the parent
     * directories of `filename`, and it deletes the file if it is present.
     * If `func` fails, the file is deleted along with any parent directories
     * this call created, if they are empty, and the error is returned.
     *
     * Building a file is atomic: from the perspective of functions passed to
     * `FileBuilder`, the file isn't created until `func` returns, at which
     * point it receives its final contents. Until then, methods such as
     * `is_file` and `read_text` act as though the file doesn't exist, even
     * if it does.
     *
     * `build_file*` may not be called twice on the same file in a single
     * build. Calls to `build_file*` and `subbuild` may be nested within
     * calls to `build_file*`. `func` must use the `FileBuilder` passed to
     * it, not `self`, for all file system operations.
     *
     * `args` and `kwargs` are sanitized and deep-copied; `func` receives the
     * copies, so it cannot observe or mutate the caller's originals.
     * `file_comparison` is the method used during the next build to check
     * whether the output file has changed, in which case the file must be
     * rebuilt.
     */
    pub fn build_file_with_comparison<A, K, F>(
        &self,
        filename: impl AsRef<Path>,
        file_comparison: FileComparison,
        func_name: &str,
        args: &A,
        kwargs: &K,
        func: F,
    ) -> Result<Value, BuildError>
    where
        A: Serialize + ?Sized,
        K: Serialize + ?Sized,
        F: FnOnce(&FileBuilder, &str, &Value, &Value) -> Result<Value, BuildError>,
    {
        let filename = sanitize_filename(filename.as_ref())?;
        let description = format!("the build_file call for {}", filename);
        let args = sanitize_args(args, &description)?;
        let kwargs = sanitize_kwargs(kwargs, &description)?;

        let (operation, result) =
            self.run_build_file(filename, file_comparison, func_name, args, kwargs, func);
        self.append_suboperation(Operation::BuildFile(operation));
        result
    }

    /**
     * Execute a cacheable operation. This is equivalent to
     * `subbuild_with_kwargs` with no keyword arguments.
     */
    pub fn subbuild<A, F>(
        &self,
        func_name: &str,
        args: &A,
        func: F,
    ) -> Result<Value, BuildError>
    where
        A: Serialize + ?Sized,
        F: FnOnce(&FileBuilder, &Value, &Value) -> Result<Value, BuildError>,
    {
        self.subbuild_with_kwargs(func_name, args, &Map::new(), func)
    }

    /**
     * Execute a cacheable operation.
     *
     * This is equivalent to calling `func(builder, args, kwargs)`, except we
     * don't call `func` if the result is cached. A typical use case is to
     * read a file, compute some information about its contents, and return
     * the result. Calls to `build_file*` and `subbuild` may be nested within
     * calls to `subbuild`. `subbuild` may not be called twice with the same
     * function name and arguments in a single build.
     *
     * How a build is divided into subbuilds has a significant effect on
     * performance. A rule of thumb is that file reads should be divided into
     * as many separate subbuilds and `build_file*` calls as is practical.
     * It's generally not a good idea for a subbuild to return a file's full
     * contents, as the contents would then be stored in the cache.
     *
     * `args` and `kwargs` are sanitized and deep-copied, and together with
     * `func_name` they form the cache key for this operation. The return
     * value of `func` must be a JSON value.
     */
    pub fn subbuild_with_kwargs<A, K, F>(
        &self,
        func_name: &str,
        args: &A,
        kwargs: &K,
        func: F,
    ) -> Result<Value, BuildError>
    where
        A: Serialize + ?Sized,
        K: Serialize + ?Sized,
        F: FnOnce(&FileBuilder, &Value, &Value) -> Result<Value, BuildError>,
    {
        let description = format!("the subbuild function {}", func_name);
        let args = sanitize_args(args, &description)?;
        let kwargs = sanitize_kwargs(kwargs, &description)?;

        let (operation, result) = self.run_subbuild(func_name, args, kwargs, func);
        self.append_suboperation(Operation::Subbuild(operation));
        result
    }

    /**
     * Read the specified file as text, recording the read with the
     * `Metadata` comparison.
     */
    pub fn read_text(&self, filename: impl AsRef<Path>) -> Result<String, BuildError> {
        self.read_text_with_comparison(filename, FileComparison::Metadata)
    }

    /**
     * Read the specified file as text. During the next build,
     * `file_comparison` is used to check whether the file has changed, in
     * which case the cache entries containing this read are invalid.
     */
    pub fn read_text_with_comparison(
        &self,
        filename: impl AsRef<Path>,
        file_comparison: FileComparison,
    ) -> Result<String, BuildError> {
        let filename = self.declare_read(filename, file_comparison)?;
        Ok(fs::read_to_string(&filename)?)
    }

    /** Read the specified file as bytes, as in `read_text` */
    pub fn read_binary(&self, filename: impl AsRef<Path>) -> Result<Vec<u8>, BuildError> {
        self.read_binary_with_comparison(filename, FileComparison::Metadata)
    }

    /** Read the specified file as bytes, as in `read_text_with_comparison` */
    pub fn read_binary_with_comparison(
        &self,
        filename: impl AsRef<Path>,
        file_comparison: FileComparison,
    ) -> Result<Vec<u8>, BuildError> {
        let filename = self.declare_read(filename, file_comparison)?;
        Ok(fs::read(&filename)?)
    }

    /**
     * Declare that we are reading the specified file, and return its
     * sanitized absolute filename.
     *
     * Each function passed to `build`, `build_file*`, or `subbuild` must
     * declare all of the relevant files it reads, excluding those read via
     * `read_text` or `read_binary`. It is recommended to call `declare_read`
     * before reading the file, not after, so that the file is declared even
     * if reading it fails.
     */
    pub fn declare_read(
        &self,
        filename: impl AsRef<Path>,
        file_comparison: FileComparison,
    ) -> Result<String, BuildError> {
        let filename = sanitize_filename(filename.as_ref())?;
        self.exec_simple_operation(
            SimpleOpKind::Read,
            vec![
                Value::String(filename.clone()),
                Value::String(file_comparison.as_str().to_string()),
            ],
        )?;
        Ok(filename)
    }

    /**
     * Return the names of the files and directories that are direct
     * children of the specified directory, according to the virtual state of
     * the file system, sorted. The names only contain the final component of
     * each path and do not include special entries like `.` and `..`.
     */
    pub fn list_dir(&self, dir: impl AsRef<Path>) -> Result<Vec<String>, BuildError> {
        let dir = sanitize_filename(dir.as_ref())?;
        let result =
            self.exec_simple_operation(SimpleOpKind::ListDir, vec![Value::String(dir)])?;
        Ok(value_to_strings(&result))
    }

    /**
     * Return the files in the specified directory, recursively, according to
     * the virtual state of the file system.
     *
     * The return value is a list of `(dir, subdirs, subfiles)` entries, one
     * for each descendant directory of `dir` including `dir` itself. The
     * first element is the directory's absolute filename; the second and
     * third are the names of its immediate subdirectories and its immediate
     * regular files. Directories that are symbolic links are not descended
     * into. If `top_down` is true, the entry for a directory appears before
     * the entries for the directories it contains; otherwise it appears
     * after. This returns an empty list if `dir` is not a directory in the
     * virtual state of the file system.
     */
    pub fn walk(
        &self,
        dir: impl AsRef<Path>,
        top_down: bool,
    ) -> Result<Vec<(String, Vec<String>, Vec<String>)>, BuildError> {
        let dir = sanitize_filename(dir.as_ref())?;
        let result = self.exec_simple_operation(
            SimpleOpKind::Walk,
            vec![Value::String(dir), Value::Bool(top_down)],
        )?;

        let mut entries = Vec::new();
        if let Value::Array(values) = result {
            for value in values {
                if let Value::Array(entry) = value {
                    if let [Value::String(dir), subdirs, subfiles] = entry.as_slice() {
                        entries.push((
                            dir.clone(),
                            value_to_strings(subdirs),
                            value_to_strings(subfiles),
                        ));
                    }
                }
            }
        }
        Ok(entries)
    }

    /**
     * Return whether the specified filename refers to an existing regular
     * file, according to the virtual state of the file system. This follows
     * symbolic links.
     */
    pub fn is_file(&self, filename: impl AsRef<Path>) -> Result<bool, BuildError> {
        let filename = sanitize_filename(filename.as_ref())?;
        let result =
            self.exec_simple_operation(SimpleOpKind::IsFile, vec![Value::String(filename)])?;
        Ok(result.as_bool().unwrap_or(false))
    }

    /**
     * Return whether the specified filename refers to an existing directory,
     * according to the virtual state of the file system. This follows
     * symbolic links.
     */
    pub fn is_dir(&self, filename: impl AsRef<Path>) -> Result<bool, BuildError> {
        let filename = sanitize_filename(filename.as_ref())?;
        let result =
            self.exec_simple_operation(SimpleOpKind::IsDir, vec![Value::String(filename)])?;
        Ok(result.as_bool().unwrap_or(false))
    }

    /**
     * Return whether the specified filename refers to an existing file or
     * directory, according to the virtual state of the file system. This
     * returns false for broken symbolic links.
     */
    pub fn exists(&self, filename: impl AsRef<Path>) -> Result<bool, BuildError> {
        let filename = sanitize_filename(filename.as_ref())?;
        let result =
            self.exec_simple_operation(SimpleOpKind::Exists, vec![Value::String(filename)])?;
        Ok(result.as_bool().unwrap_or(false))
    }

    /**
     * Return the size of the specified file in bytes, according to the
     * virtual state of the file system. This follows symbolic links.
     */
    pub fn get_size(&self, filename: impl AsRef<Path>) -> Result<u64, BuildError> {
        let filename = sanitize_filename(filename.as_ref())?;
        let result =
            self.exec_simple_operation(SimpleOpKind::GetSize, vec![Value::String(filename)])?;
        Ok(result.as_u64().unwrap_or(0))
    }

    /**
     * Perform a simple operation, record it in this scope's suboperations,
     * and return the result.
     */
    fn exec_simple_operation(
        &self,
        kind: SimpleOpKind,
        args: Vec<Value>,
    ) -> Result<Value, BuildError> {
        let result = self.context.executor.exec(kind, &args, None);
        let (return_value, error_kind) = match &result {
            Ok(value) => (value.clone(), None),
            Err(err) => (Value::Null, err.simple_op_kind().map(str::to_string)),
        };
        self.append_suboperation(Operation::Simple(SimpleOp {
            kind,
            args,
            return_value,
            error_kind,
        }));
        result
    }

    /**
     * Append the specified operation to this scope's record. Operations
     * performed directly by the root build function are not recorded; only
     * `build_file*` and subbuild results are cached.
     */
    fn append_suboperation(&self, operation: Operation) {
        if !self.is_root {
            self.suboperations.lock().unwrap().push(operation);
        }
    }

    /**
     * Perform a root build operation, including writing the cache file and
     * committing or rolling back.
     */
    fn run_root_build<F, R>(&self, func: F) -> Result<R, BuildError>
    where
        F: FnOnce(&FileBuilder) -> Result<R, BuildError>,
    {
        let context = &self.context;
        let mut cache_file_created_dirs = Vec::new();
        let outcome: Result<(R, Vec<String>), BuildError> = (|| {
            // It might be impossible to create the directory for the cache
            // file. Doing this first raises right away in that case, and
            // prevents build file operations from making the directory
            // creation impossible.
            if let Some(parent) = parent_of(&context.cache_filename) {
                cache_file_created_dirs = self.make_dirs(&parent)?;
            }

            let return_value = func(self)?;
            let norm_cased_error_created_dirs =
                self.set_created_dirs(&cache_file_created_dirs)?;

            if Path::new(&context.cache_filename).is_file()
                && context.backups.back_up_and_remove(&context.cache_filename)?
            {
                info!(
                    "Moved cache file {} to a temporary directory",
                    context.cache_filename,
                );
            }
            context.new_cache.write(&context.cache_filename)?;
            info!("Wrote cache file {}", context.cache_filename);
            Ok((return_value, norm_cased_error_created_dirs))
        })();

        match outcome {
            Ok((return_value, norm_cased_error_created_dirs)) => {
                self.commit(&norm_cased_error_created_dirs)?;
                Ok(return_value)
            }
            Err(err) => {
                self.roll_back(&cache_file_created_dirs);
                Err(err)
            }
        }
    }

    /**
     * Record the directories created by this build in the new cache. Returns
     * the norm-cased directories that were created in the real file system
     * to store build files, but are deleted in the virtual view.
     */
    fn set_created_dirs(
        &self,
        cache_file_created_dirs: &[String],
    ) -> Result<Vec<String>, BuildError> {
        let context = &self.context;
        let mut created_dirs = context.build_dirs.created_dirs();
        let norm_cased_created_dirs = created_dirs
            .iter()
            .map(|dir| context.case.norm_case(dir))
            .collect::<HashSet<_>>();
        let mut norm_cased_error_created_dirs = context
            .build_dirs
            .norm_cased_error_created_dirs()
            .into_iter()
            .collect::<HashSet<_>>();
        for dir in cache_file_created_dirs {
            let norm_cased_dir = context.case.norm_case(dir);
            if !norm_cased_created_dirs.contains(&norm_cased_dir) {
                created_dirs.push(dir.clone());
                norm_cased_error_created_dirs.remove(&norm_cased_dir);
                self.ensure_dir_case(dir)?;
            }
        }

        context.new_cache.add_created_dirs(created_dirs);
        Ok(norm_cased_error_created_dirs.into_iter().collect())
    }

    /**
     * Commit a build operation: remove the previous build's files that no
     * longer exist in the virtual view, along with directories that are
     * empty and no longer held. Writing the cache file is the
     * responsibility of `run_root_build`.
     */
    fn commit(&self, norm_cased_error_created_dirs: &[String]) -> Result<(), BuildError> {
        info!("Committing build operation");
        let context = &self.context;
        for filename in context.old_cache.created_files() {
            if !context.executor.is_file(&filename, None)?
                && !context.executor.is_cache_file(&filename)
            {
                try_to_remove_file(&filename);
            }
        }

        let mut dirs_to_remove = norm_cased_error_created_dirs
            .iter()
            .cloned()
            .collect::<HashSet<_>>();
        for dir in context.old_cache.created_dirs() {
            if !context.executor.is_dir(&dir, None)? {
                dirs_to_remove.insert(context.case.norm_case(&dir));
            }
        }
        remove_empty_dirs(dirs_to_remove);
        info!("Committed build operation");
        Ok(())
    }

    /** Roll back (or undo) a build operation */
    fn roll_back(&self, cache_file_created_dirs: &[String]) {
        warn!("Rolling back build operation, due to an error");
        let context = &self.context;
        let mut dirs_to_remove = context
            .build_dirs
            .created_dirs()
            .iter()
            .chain(cache_file_created_dirs)
            .map(|dir| context.case.norm_case(dir))
            .collect::<HashSet<_>>();
        dirs_to_remove.extend(context.build_dirs.norm_cased_error_created_dirs());
        for dir in context.old_cache.created_dirs() {
            dirs_to_remove.remove(&context.case.norm_case(&dir));
        }

        for filename in context.new_cache.created_files() {
            if !context.old_cache.created_file(&filename) {
                try_to_remove_file(&filename);
            }
        }
        remove_empty_dirs(dirs_to_remove);

        create_dirs(context.old_cache.created_dirs());
        context.backups.restore_all();
        info!("Rolled back build operation");
    }

    /** Perform a build file operation, returning its record and result */
    fn run_build_file<F>(
        &self,
        filename: String,
        file_comparison: FileComparison,
        func_name: &str,
        args: Value,
        kwargs: Value,
        func: F,
    ) -> (Arc<BuildFileOp>, Result<Value, BuildError>)
    where
        F: FnOnce(&FileBuilder, &str, &Value, &Value) -> Result<Value, BuildError>,
    {
        let context = &self.context;

        // Setup: validations and preparing the parent directories
        let setup: Result<Vec<String>, BuildError> = (|| {
            context.new_cache.assert_doesnt_have_norm_cased_file(
                &context.case.norm_case(&filename),
                &filename,
            )?;
            if context.executor.is_cache_file(&filename) {
                return Err(BuildError::CacheFileConflict(filename.clone()));
            }
            self.prepare_file_creation(&filename)
        })();
        let created_dirs = match setup {
            Ok(created_dirs) => created_dirs,
            Err(err) => {
                let record = setup_failed_build_file(
                    &filename,
                    file_comparison,
                    func_name,
                    &args,
                    &kwargs,
                );
                return (record, Err(err));
            }
        };

        let locked_created_dirs = context
            .build_dirs
            .started_building_file(&filename, &created_dirs);

        // From here on, a setup failure must release the reservations
        let reserved: Result<Option<Arc<BuildFileOp>>, BuildError> = (|| {
            self.ensure_dirs_case(&locked_created_dirs)?;
            if let Some(record) = self.try_to_reuse_cached_file(
                &filename,
                file_comparison,
                func_name,
                &args,
                &kwargs,
            )? {
                return Ok(Some(record));
            }

            if Path::new(&filename).is_file()
                && context.backups.back_up_and_remove(&filename)?
            {
                info!(
                    "Moved {} to a temporary directory, in preparation for rebuilding \
                     the file",
                    filename,
                );
            }
            context.new_cache.start_building_file(&filename)?;
            Ok(None)
        })();
        match reserved {
            Ok(Some(record)) => {
                let return_value = record.return_value.clone();
                return (record, Ok(return_value));
            }
            Ok(None) => {}
            Err(err) => {
                context.build_dirs.error_building_file(&filename);
                let record = setup_failed_build_file(
                    &filename,
                    file_comparison,
                    func_name,
                    &args,
                    &kwargs,
                );
                return (record, Err(err));
            }
        }

        // Execute the user function in a fresh scope
        let child = FileBuilder {
            context: Arc::clone(context),
            is_root: false,
            suboperations: Mutex::new(Vec::new()),
        };
        let call_result = func(&child, &filename, &args, &kwargs);
        let suboperations = child.suboperations.into_inner().unwrap();

        let outcome = call_result.and_then(|return_value| {
            match self.noneable_file_comparison_result(&filename, file_comparison)? {
                Some(file_comparison_result) => Ok((return_value, file_comparison_result)),
                None => Err(BuildError::DidNotCreate(filename.clone())),
            }
        });
        match outcome {
            Ok((return_value, file_comparison_result)) => {
                let record = Arc::new(BuildFileOp {
                    filename: filename.clone(),
                    file_comparison,
                    func_name: func_name.to_string(),
                    args,
                    kwargs,
                    suboperations,
                    return_value: return_value.clone(),
                    file_comparison_result,
                    raised: false,
                    setup_failed: false,
                });
                context.new_cache.finish_building_file(Arc::clone(&record));
                if context.old_cache.created_file(&filename) {
                    info!("Rebuilt file {}", filename);
                } else {
                    info!("Built file {}", filename);
                }
                (record, Ok(return_value))
            }
            Err(err) => {
                context.build_dirs.error_building_file(&filename);
                try_to_remove_file(&filename);
                warn!("Failed to rebuild {}, due to an error", filename);
                let record = Arc::new(BuildFileOp {
                    filename,
                    file_comparison,
                    func_name: func_name.to_string(),
                    args,
                    kwargs,
                    suboperations,
                    return_value: Value::Null,
                    file_comparison_result: Value::Null,
                    raised: true,
                    setup_failed: false,
                });
                context.new_cache.finish_building_file(Arc::clone(&record));
                (record, Err(err))
            }
        }
    }

    /** Perform a subbuild operation, returning its record and result */
    fn run_subbuild<F>(
        &self,
        func_name: &str,
        args: Value,
        kwargs: Value,
        func: F,
    ) -> (Arc<SubbuildOp>, Result<Value, BuildError>)
    where
        F: FnOnce(&FileBuilder, &Value, &Value) -> Result<Value, BuildError>,
    {
        let context = &self.context;
        let key = subbuild_key(func_name, &args, &kwargs);

        let setup: Result<Option<Arc<SubbuildOp>>, BuildError> = (|| {
            context
                .new_cache
                .assert_doesnt_have_subbuild(&key, func_name, &args, &kwargs)?;
            let Some(cached) = self.subbuild_cache_lookup(&key, func_name)? else {
                return Ok(None);
            };

            self.apply_cached_suboperations(&cached.suboperations)?;
            let record = Arc::new(SubbuildOp {
                func_name: func_name.to_string(),
                args: args.clone(),
                kwargs: kwargs.clone(),
                suboperations: cached.suboperations.clone(),
                return_value: cached.return_value.clone(),
                raised: false,
                setup_failed: false,
            });
            context
                .new_cache
                .use_cached_operation(&Operation::Subbuild(Arc::clone(&record)))?;
            Ok(Some(record))
        })();
        match setup {
            Ok(Some(record)) => {
                let return_value = record.return_value.clone();
                return (record, Ok(return_value));
            }
            Ok(None) => {}
            Err(err) => {
                let record = setup_failed_subbuild(func_name, &args, &kwargs);
                return (record, Err(err));
            }
        }

        if let Err(err) = context
            .new_cache
            .start_subbuild(key.clone(), func_name, &args, &kwargs)
        {
            let record = setup_failed_subbuild(func_name, &args, &kwargs);
            return (record, Err(err));
        }

        let child = FileBuilder {
            context: Arc::clone(context),
            is_root: false,
            suboperations: Mutex::new(Vec::new()),
        };
        let call_result = func(&child, &args, &kwargs);
        let suboperations = child.suboperations.into_inner().unwrap();

        match call_result {
            Ok(return_value) => {
                let record = Arc::new(SubbuildOp {
                    func_name: func_name.to_string(),
                    args,
                    kwargs,
                    suboperations,
                    return_value: return_value.clone(),
                    raised: false,
                    setup_failed: false,
                });
                context.new_cache.finish_subbuild(key, Arc::clone(&record));
                (record, Ok(return_value))
            }
            Err(err) => {
                let record = Arc::new(SubbuildOp {
                    func_name: func_name.to_string(),
                    args,
                    kwargs,
                    suboperations,
                    return_value: Value::Null,
                    raised: true,
                    setup_failed: false,
                });
                context.new_cache.finish_subbuild(key, Arc::clone(&record));
                (record, Err(err))
            }
        }
    }

    /**
     * Ensure the presence of the parent directory of `filename` and that
     * `filename` isn't a directory, in preparation for building it. Returns
     * the parent directories that were virtually created.
     */
    fn prepare_file_creation(&self, filename: &str) -> Result<Vec<String>, BuildError> {
        let context = &self.context;
        if Path::new(filename).is_dir() {
            if context.executor.is_dir(filename, None)? {
                return Err(BuildError::IsADirectory(filename.to_string()));
            }
            info!(
                "Building {}, but that file is a directory created during a build \
                 operation, so moving its contents to a temporary directory and then \
                 removing it",
                filename,
            );
            self.make_room(filename, filename)?;
        }

        match parent_of(filename) {
            Some(parent) => self.make_dirs(&parent),
            None => Ok(Vec::new()),
        }
    }

    /**
     * Back up and remove any output files and directories in the specified
     * directory that were created by the previous build, then remove the
     * directory. Assume `dir` doesn't exist in the virtual view. This
     * addresses the edge case where a filename that was a directory in the
     * previous build is a regular file in the current build.
     */
    fn make_room(&self, dir: &str, make_room_filename: &str) -> Result<(), BuildError> {
        let context = &self.context;
        for entry in fs::read_dir(dir)? {
            let subfile = entry?.file_name();
            let absolute_subfile = join_path(dir, &subfile.to_string_lossy());
            let in_the_way = if Path::new(&absolute_subfile).is_dir() {
                if context.executor.is_dir(&absolute_subfile, None)? {
                    true
                } else {
                    self.make_room(&absolute_subfile, make_room_filename)?;
                    false
                }
            } else if context.executor.is_file(&absolute_subfile, None)? {
                true
            } else {
                if context.backups.back_up_and_remove(&absolute_subfile)? {
                    info!("Moved {} to a temporary directory", absolute_subfile);
                }
                false
            };

            if in_the_way {
                // The file was created externally or in another thread
                return Err(BuildError::IsADirectory(make_room_filename.to_string()));
            }
        }

        if fs::remove_dir(dir).is_err() {
            // e.g. a subfile was created externally or in another thread
            return Err(BuildError::IsADirectory(make_room_filename.to_string()));
        }
        info!("Removed empty directory {}", dir);
        Ok(())
    }

    /**
     * Return the parents of `dir` that we would need to create to ensure
     * that the directory exists in the virtual state of the file system,
     * possibly including `dir` itself. Each directory appears after its
     * parent.
     */
    fn dirs_to_make(
        &self,
        dir: &str,
        created_files: Option<&CreatedFiles>,
    ) -> Result<Vec<String>, BuildError> {
        let context = &self.context;
        let mut parents = Vec::new();
        let mut parent = dir.to_string();
        let mut is_dir = context.executor.is_dir(&parent, created_files)?;
        let mut is_file = !is_dir && context.executor.is_file(&parent, created_files)?;
        while !is_file && !is_dir {
            if context.executor.is_cache_file(&parent) {
                return Err(BuildError::NotADirectory(parent));
            }
            parents.push(parent.clone());

            match parent_of(&parent) {
                Some(next) => parent = next,
                // The root directory does not exist
                None => return Err(BuildError::FileNotFound(parent)),
            }
            is_dir = context.executor.is_dir(&parent, created_files)?;
            is_file = !is_dir && context.executor.is_file(&parent, created_files)?;
        }

        if is_file {
            return Err(BuildError::NotADirectory(parent));
        }
        parents.reverse();
        Ok(parents)
    }

    /**
     * Create the specified directory in the real file system if it does not
     * already exist, including any missing parents. Returns the directories
     * that were created in the virtual view. This isn't atomic, so
     * `make_dirs` can return a given directory multiple times in a single
     * build; `BuildDirs::started_building_file` arbitrates that case.
     */
    fn make_dirs(&self, dir: &str) -> Result<Vec<String>, BuildError> {
        let context = &self.context;
        let dirs_to_make = self.dirs_to_make(dir, None)?;
        for parent in &dirs_to_make {
            if Path::new(parent).is_file()
                && context
                    .old_cache
                    .created_norm_cased_file(&context.case.norm_case(parent))
                && context.backups.back_up_and_remove(parent)?
            {
                info!(
                    "Moved {} to a temporary directory, in order to create a directory \
                     with that filename",
                    parent,
                );
            }

            match fs::create_dir(parent) {
                Ok(()) => info!("Created directory {}", parent),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(dirs_to_make)
    }

    /**
     * Return whether the case of the specified file's base name matches the
     * file or directory on the file system. The return value is unspecified
     * if the file does not exist.
     */
    fn has_case(&self, filename: &str) -> Result<bool, BuildError> {
        Ok(self
            .context
            .case
            .miscased_sibling(Path::new(filename))?
            .is_none())
    }

    /**
     * Ensure that the case of the specified directory's base name matches
     * the requested one, renaming the on-disk entry if needed.
     */
    fn ensure_dir_case(&self, dir: &str) -> Result<(), BuildError> {
        if let Some(miscased) = self.context.case.miscased_sibling(Path::new(dir))? {
            fs::rename(&miscased, dir)?;
        }
        Ok(())
    }

    fn ensure_dirs_case(&self, dirs: &[String]) -> Result<(), BuildError> {
        for dir in dirs {
            self.ensure_dir_case(dir)?;
        }
        Ok(())
    }

    /**
     * Return the result of performing the specified file comparison, or
     * `None` if the filename does not refer to an existing regular file.
     * This is strictly an operation on the real file system.
     */
    fn noneable_file_comparison_result(
        &self,
        filename: &str,
        file_comparison: FileComparison,
    ) -> Result<Option<Value>, BuildError> {
        match self
            .context
            .executor
            .file_comparison_result(filename, file_comparison)
        {
            Ok(result) => Ok(Some(result)),
            Err(BuildError::FileNotFound(_)) | Err(BuildError::IsADirectory(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /**
     * Return whether the specified output file is unchanged on disk, based
     * on the operation's recorded comparison result. This only checks the
     * file's contents, not the suboperations or function version.
     */
    fn is_build_file_cached(&self, operation: &BuildFileOp) -> Result<bool, BuildError> {
        if !self.has_case(&operation.filename)? {
            return Ok(false);
        }
        let result = self
            .noneable_file_comparison_result(&operation.filename, operation.file_comparison)?
            .unwrap_or(Value::Null);
        Ok(is_equal(&operation.file_comparison_result, &result))
    }

    /**
     * Return whether the specified cached build file entry is valid, so we
     * can use the cached results. This includes checking the operations in
     * its suboperation tree. `created_files` is updated with the files that
     * would be created if we executed the operation.
     */
    fn is_build_file_operation_cached(
        &self,
        operation: &Arc<BuildFileOp>,
        created_files: &mut CreatedFiles,
    ) -> Result<bool, BuildError> {
        let context = &self.context;
        if !is_equal(
            context.old_cache.get_func_version(&operation.func_name),
            context.new_cache.get_func_version(&operation.func_name),
        ) {
            return Ok(false);
        }
        if !operation.raised && !self.is_build_file_cached(operation)? {
            return Ok(false);
        }
        // If setup failed, the conditions that gave rise to the failure
        // might no longer hold
        if operation.setup_failed {
            return Ok(false);
        }

        // Return false in cases where executing the operation would fail
        let filename = &operation.filename;
        if context
            .new_cache
            .has_norm_cased_file(&context.case.norm_case(filename))
            || context.executor.is_cache_file(filename)
        {
            return Ok(false);
        }
        if let Some(parent) = parent_of(filename) {
            if self.dirs_to_make(&parent, Some(created_files)).is_err() {
                return Ok(false);
            }
        }

        created_files.started_building_file(filename);

        if !self.are_suboperations_cached(&operation.suboperations, created_files)? {
            return Ok(false);
        }

        if operation.raised {
            created_files.error_building_file(filename);
        } else {
            created_files.finished_building_file(filename);
        }
        Ok(true)
    }

    /** Return whether the specified cached subbuild entry is valid */
    fn is_subbuild_operation_cached(
        &self,
        operation: &Arc<SubbuildOp>,
        created_files: &mut CreatedFiles,
    ) -> Result<bool, BuildError> {
        let context = &self.context;
        if !is_equal(
            context.old_cache.get_func_version(&operation.func_name),
            context.new_cache.get_func_version(&operation.func_name),
        ) {
            return Ok(false);
        }
        if operation.setup_failed {
            return Ok(false);
        }
        if context.new_cache.has_subbuild(&operation.key()) {
            return Ok(false);
        }

        self.are_suboperations_cached(&operation.suboperations, created_files)
    }

    /**
     * Return whether the specified cached simple operation is still valid:
     * re-executing it against the current virtual view produces the same
     * return value and the same error kind.
     */
    fn is_simple_operation_cached(
        &self,
        operation: &SimpleOp,
        created_files: &CreatedFiles,
    ) -> Result<bool, BuildError> {
        let context = &self.context;
        let name = operation.kind.as_str();
        if !is_equal(
            context.old_cache.get_operation_version(name),
            context.new_cache.get_operation_version(name),
        ) {
            return Ok(false);
        }

        let (return_value, error_kind) =
            match context
                .executor
                .exec(operation.kind, &operation.args, Some(created_files))
            {
                Ok(value) => (value, None),
                Err(err) => match err.simple_op_kind() {
                    Some(kind) => (Value::Null, Some(kind.to_string())),
                    None => return Ok(false),
                },
            };
        Ok(is_equal(&return_value, &operation.return_value)
            && error_kind == operation.error_kind)
    }

    /** Return whether all of the specified suboperation entries are valid */
    fn are_suboperations_cached(
        &self,
        suboperations: &[Operation],
        created_files: &mut CreatedFiles,
    ) -> Result<bool, BuildError> {
        for suboperation in suboperations {
            let cached = match suboperation {
                Operation::BuildFile(operation) => {
                    self.is_build_file_operation_cached(operation, created_files)?
                }
                Operation::Subbuild(operation) => {
                    self.is_subbuild_operation_cached(operation, created_files)?
                }
                Operation::Simple(operation) => {
                    self.is_simple_operation_cached(operation, created_files)?
                }
            };
            if !cached {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /**
     * Return the cached build file entry whose results we may use for the
     * specified call, if any.
     */
    fn build_file_cache_lookup(
        &self,
        filename: &str,
        func_name: &str,
        args: &Value,
        kwargs: &Value,
    ) -> Result<Option<Arc<BuildFileOp>>, BuildError> {
        let context = &self.context;
        let Some(cached) = context.old_cache.get_file(filename) else {
            return Ok(None);
        };
        if cached.raised
            || cached.func_name != func_name
            || !is_equal(
                context.old_cache.get_func_version(func_name),
                context.new_cache.get_func_version(func_name),
            )
            || !is_equal(&cached.args, args)
            || !is_equal(&cached.kwargs, kwargs)
            || !self.is_build_file_cached(&cached)?
        {
            return Ok(None);
        }

        let mut created_files = CreatedFiles::new(Arc::clone(&context.case));
        if !self.are_suboperations_cached(&cached.suboperations, &mut created_files)? {
            return Ok(None);
        }
        Ok(Some(cached))
    }

    /**
     * Return the cached subbuild entry whose results we may use for the
     * specified call, if any.
     */
    fn subbuild_cache_lookup(
        &self,
        key: &HashableValue,
        func_name: &str,
    ) -> Result<Option<Arc<SubbuildOp>>, BuildError> {
        let context = &self.context;
        let Some(cached) = context.old_cache.get_subbuild(key) else {
            return Ok(None);
        };
        if cached.raised
            || !is_equal(
                context.old_cache.get_func_version(func_name),
                context.new_cache.get_func_version(func_name),
            )
        {
            return Ok(None);
        }

        let mut created_files = CreatedFiles::new(Arc::clone(&context.case));
        if !self.are_suboperations_cached(&cached.suboperations, &mut created_files)? {
            return Ok(None);
        }
        Ok(Some(cached))
    }

    /**
     * Reuse a cached build file result for the specified call if possible,
     * returning the finished record installed in the new cache.
     */
    fn try_to_reuse_cached_file(
        &self,
        filename: &str,
        file_comparison: FileComparison,
        func_name: &str,
        args: &Value,
        kwargs: &Value,
    ) -> Result<Option<Arc<BuildFileOp>>, BuildError> {
        let context = &self.context;
        let Some(cached) = self.build_file_cache_lookup(filename, func_name, args, kwargs)?
        else {
            return Ok(None);
        };
        let Some(file_comparison_result) =
            self.noneable_file_comparison_result(filename, file_comparison)?
        else {
            return Ok(None);
        };

        self.apply_cached_suboperations(&cached.suboperations)?;
        let record = Arc::new(BuildFileOp {
            filename: filename.to_string(),
            file_comparison,
            func_name: func_name.to_string(),
            args: args.clone(),
            kwargs: kwargs.clone(),
            suboperations: cached.suboperations.clone(),
            return_value: cached.return_value.clone(),
            file_comparison_result,
            raised: false,
            setup_failed: false,
        });
        context
            .new_cache
            .use_cached_operation(&Operation::BuildFile(Arc::clone(&record)))?;
        Ok(Some(record))
    }

    /**
     * Make the changes to the file system (including to the backups and
     * `BuildDirs`) needed to apply the results of the suboperations of a
     * cached operation tree we are reusing.
     */
    fn apply_cached_suboperations(
        &self,
        suboperations: &[Operation],
    ) -> Result<(), BuildError> {
        let context = &self.context;
        for suboperation in suboperations {
            match suboperation {
                Operation::BuildFile(operation) if !operation.raised => {
                    let created_dirs = match parent_of(&operation.filename) {
                        Some(parent) => self.make_dirs(&parent)?,
                        None => Vec::new(),
                    };
                    let locked_created_dirs = context
                        .build_dirs
                        .started_building_file(&operation.filename, &created_dirs);
                    let applied: Result<(), BuildError> = (|| {
                        self.ensure_dirs_case(&locked_created_dirs)?;
                        self.apply_cached_suboperations(&operation.suboperations)
                    })();
                    if let Err(err) = applied {
                        context.build_dirs.error_building_file(&operation.filename);
                        return Err(err);
                    }
                }
                Operation::BuildFile(operation) => {
                    self.apply_cached_suboperations(&operation.suboperations)?;
                }
                Operation::Subbuild(operation) => {
                    self.apply_cached_suboperations(&operation.suboperations)?;
                }
                Operation::Simple(_) => {}
            }
        }
        Ok(())
    }
}

fn setup_failed_build_file(
    filename: &str,
    file_comparison: FileComparison,
    func_name: &str,
    args: &Value,
    kwargs: &Value,
) -> Arc<BuildFileOp> {
    Arc::new(BuildFileOp {
        filename: filename.to_string(),
        file_comparison,
        func_name: func_name.to_string(),
        args: args.clone(),
        kwargs: kwargs.clone(),
        suboperations: Vec::new(),
        return_value: Value::Null,
        file_comparison_result: Value::Null,
        raised: true,
        setup_failed: true,
    })
}

fn setup_failed_subbuild(func_name: &str, args: &Value, kwargs: &Value) -> Arc<SubbuildOp> {
    Arc::new(SubbuildOp {
        func_name: func_name.to_string(),
        args: args.clone(),
        kwargs: kwargs.clone(),
        suboperations: Vec::new(),
        return_value: Value::Null,
        raised: true,
        setup_failed: true,
    })
}

/**
 * Return the result of sanitizing the specified filename: an absolute,
 * lexically normalized path string.
 */
fn sanitize_filename(path: &Path) -> Result<String, BuildError> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // ".." components above the root are dropped
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
        .to_str()
        .map(str::to_string)
        .ok_or_else(|| BuildError::BadArg("filenames must be valid UTF-8".to_string()))
}

fn sanitize_args<A>(args: &A, description: &str) -> Result<Value, BuildError>
where
    A: Serialize + ?Sized,
{
    match sanitize(args) {
        Ok(value @ Value::Array(_)) => Ok(value),
        Ok(_) => Err(BuildError::BadArg(format!(
            "the arguments to {} must form a JSON array",
            description,
        ))),
        Err(_) => Err(BuildError::BadArg(format!(
            "the arguments to {} must be JSON values",
            description,
        ))),
    }
}

fn sanitize_kwargs<K>(kwargs: &K, description: &str) -> Result<Value, BuildError>
where
    K: Serialize + ?Sized,
{
    match sanitize(kwargs) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err(BuildError::BadArg(format!(
            "the keyword arguments to {} must form a JSON object",
            description,
        ))),
        Err(_) => Err(BuildError::BadArg(format!(
            "the keyword arguments to {} must be JSON values",
            description,
        ))),
    }
}

fn sanitize_versions<V>(versions: &V) -> Result<Map<String, Value>, BuildError>
where
    V: Serialize + ?Sized,
{
    match sanitize(versions) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(BuildError::BadArg(
            "versions must be a map from function names to JSON values".to_string(),
        )),
        Err(_) => Err(BuildError::BadArg(
            "versions must be a JSON value".to_string(),
        )),
    }
}

fn value_to_strings(value: &Value) -> Vec<String> {
    match value {
        Value::Array(values) => values
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/** Remove the specified regular file if it exists, swallowing failures */
fn try_to_remove_file(filename: &str) {
    if Path::new(filename).is_file() {
        match fs::remove_file(filename) {
            Ok(()) => info!("Removed {}", filename),
            Err(err) => error!("Failed to remove {}: {}", filename, err),
        }
    }
}

/**
 * Remove any empty directories in the specified set. Some directories may be
 * parents of others, so more precisely, this removes any directories that
 * only contain other directories in the set. Failures are ignored.
 */
fn remove_empty_dirs<I>(dirs: I)
where
    I: IntoIterator<Item = String>,
{
    let mut sorted_dirs = dirs.into_iter().collect::<Vec<_>>();
    sorted_dirs.sort_by_key(|dir| std::cmp::Reverse(dir.len()));
    for dir in sorted_dirs {
        if fs::remove_dir(&dir).is_ok() {
            info!("Removed empty directory {}", dir);
        }
    }
}

/**
 * Create the specified directories if they don't already exist. Parents are
 * not created automatically, but some directories in the set may be parents
 * of others, so they are created shallowest first. Failures are logged and
 * skipped.
 */
fn create_dirs<I>(dirs: I)
where
    I: IntoIterator<Item = String>,
{
    let mut sorted_dirs = dirs.into_iter().collect::<Vec<_>>();
    sorted_dirs.sort_by_key(String::len);
    for dir in sorted_dirs {
        match fs::create_dir(&dir) {
            Ok(()) => info!("Created directory {}", dir),
            Err(_) if Path::new(&dir).is_dir() => {}
            Err(err) => error!("Failed to create directory {}: {}", dir, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename_normalizes() {
        assert_eq!(
            "/foo/baz.txt",
            sanitize_filename(Path::new("/foo/bar/.././baz.txt")).unwrap()
        );
        assert_eq!("/", sanitize_filename(Path::new("/../..")).unwrap());
        assert_eq!(
            "/foo/bar",
            sanitize_filename(Path::new("/foo//bar/")).unwrap()
        );
    }

    #[test]
    fn test_sanitize_filename_makes_relative_paths_absolute() {
        let sanitized = sanitize_filename(Path::new("some_file.txt")).unwrap();
        assert!(Path::new(&sanitized).is_absolute());
        assert!(sanitized.ends_with("some_file.txt"));
    }

    #[test]
    fn test_sanitize_args_requires_an_array() {
        assert!(sanitize_args(&(1, "x"), "a test").is_ok());
        assert!(sanitize_args::<[u32]>(&[], "a test").is_ok());
        assert!(matches!(
            sanitize_args(&"scalar", "a test"),
            Err(BuildError::BadArg(_))
        ));
    }

    #[test]
    fn test_sanitize_kwargs_requires_an_object() {
        assert!(sanitize_kwargs(&Map::new(), "a test").is_ok());
        assert!(matches!(
            sanitize_kwargs(&[1, 2], "a test"),
            Err(BuildError::BadArg(_))
        ));
    }
}
