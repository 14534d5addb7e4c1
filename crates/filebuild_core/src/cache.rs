//! The store for cached build results.

use crate::error::BuildError;
use crate::operation::{BuildFileOp, Operation, SubbuildOp};
use filebuild_utils::{HashableValue, PathCase, is_equal};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/**
 * A JSON value indicating the current version of the file format used to
 * store `Cache` objects. We should change this every time we change the file
 * format. The version also incorporates the semantics of the builder; if we
 * change the semantics, we may want to change the version in order to
 * invalidate old cache files.
 */
const CACHE_FILE_VERSION: Value = Value::Null;

/** A string identifying this software package */
const SOFTWARE: &str = "file_builder";

static NULL_VERSION: Value = Value::Null;

/**
 * Stores the cached results of a build.
 *
 * This is for both finished builds and builds that are in progress. `Cache`
 * is thread-safe and cheap to clone (clones share the same store).
 *
 * A `Cache` may be designated "immutable", in which case its contents may
 * not be altered. Immutable caches are slightly more performant, because
 * they don't have to use locks.
 */
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    build_name: String,
    func_versions: Map<String, Value>,
    operation_versions: Map<String, Value>,
    case: Arc<dyn PathCase>,
    state: CacheState,
}

/**
 * The maps for the files we have started building. Finished operations,
 * including those that resulted in errors, are stored as `Some`; files we
 * haven't finished building are stored as `None`.
 */
#[derive(Default)]
struct FileMaps {
    files: BTreeMap<String, Option<Arc<BuildFileOp>>>,
    norm_cased_files: HashMap<String, Option<Arc<BuildFileOp>>>,
}

type SubbuildMap = BTreeMap<HashableValue, Option<Arc<SubbuildOp>>>;

// In order to avoid deadlock, when multiple locks are needed they must be
// acquired in the following order: files, subbuilds, created_dirs.
enum CacheState {
    Mutable {
        files: Mutex<FileMaps>,
        subbuilds: Mutex<SubbuildMap>,
        created_dirs: Mutex<BTreeSet<String>>,
    },
    Immutable {
        files: FileMaps,
        subbuilds: SubbuildMap,
        created_dirs: BTreeSet<String>,
    },
}

impl Cache {
    /** Return a new empty mutable `Cache` for the specified build */
    pub fn create_empty_mutable(
        build_name: &str,
        func_versions: Map<String, Value>,
        case: Arc<dyn PathCase>,
    ) -> Cache {
        Cache::create_empty(build_name, func_versions, case, true)
    }

    /** Return a new empty immutable `Cache` for the specified build */
    pub fn create_empty_immutable(
        build_name: &str,
        func_versions: Map<String, Value>,
        case: Arc<dyn PathCase>,
    ) -> Cache {
        Cache::create_empty(build_name, func_versions, case, false)
    }

    fn create_empty(
        build_name: &str,
        func_versions: Map<String, Value>,
        case: Arc<dyn PathCase>,
        is_mutable: bool,
    ) -> Cache {
        Cache::new(
            build_name.to_string(),
            BTreeMap::new(),
            BTreeMap::new(),
            BTreeSet::new(),
            func_versions,
            Map::new(),
            case,
            is_mutable,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        build_name: String,
        files: BTreeMap<String, Option<Arc<BuildFileOp>>>,
        subbuilds: SubbuildMap,
        created_dirs: BTreeSet<String>,
        func_versions: Map<String, Value>,
        operation_versions: Map<String, Value>,
        case: Arc<dyn PathCase>,
        is_mutable: bool,
    ) -> Cache {
        let mut norm_cased_files = HashMap::new();
        for (filename, operation) in &files {
            norm_cased_files.insert(case.norm_case(filename), operation.clone());
        }
        let file_maps = FileMaps {
            files,
            norm_cased_files,
        };

        let state = if is_mutable {
            CacheState::Mutable {
                files: Mutex::new(file_maps),
                subbuilds: Mutex::new(subbuilds),
                created_dirs: Mutex::new(created_dirs),
            }
        } else {
            CacheState::Immutable {
                files: file_maps,
                subbuilds,
                created_dirs,
            }
        };
        Cache {
            inner: Arc::new(CacheInner {
                build_name,
                func_versions,
                operation_versions,
                case,
                state,
            }),
        }
    }

    pub fn build_name(&self) -> &str {
        &self.inner.build_name
    }

    /**
     * Return the finished operation associated with the specified
     * non-norm-cased filename. Return `None` if we haven't started or
     * finished building the file (but not if the build function failed).
     */
    pub fn get_file(&self, filename: &str) -> Option<Arc<BuildFileOp>> {
        self.read_files(|maps| maps.files.get(filename).cloned().flatten())
    }

    /** Like `get_file`, but keyed by the norm-cased filename */
    pub fn get_norm_cased_file(&self, norm_cased_filename: &str) -> Option<Arc<BuildFileOp>> {
        self.read_files(|maps| {
            maps.norm_cased_files
                .get(norm_cased_filename)
                .cloned()
                .flatten()
        })
    }

    /**
     * Return whether we have a cache entry for the specified norm-cased
     * filename. This returns true if we have started building the file but
     * haven't finished.
     */
    pub fn has_norm_cased_file(&self, norm_cased_filename: &str) -> bool {
        self.read_files(|maps| maps.norm_cased_files.contains_key(norm_cased_filename))
    }

    /**
     * Record that we are about to build the specified file. This does not
     * apply if we are simply reusing a previously cached result.
     *
     * Fails with `DuplicateBuild` if we already started building the file
     * (e.g. in another thread).
     */
    pub fn start_building_file(&self, filename: &str) -> Result<(), BuildError> {
        let norm_cased_filename = self.inner.case.norm_case(filename);
        self.write_files(|maps| {
            assert_doesnt_have_file(maps, &norm_cased_filename, filename)?;
            maps.files.insert(filename.to_string(), None);
            maps.norm_cased_files.insert(norm_cased_filename, None);
            Ok(())
        })
    }

    /**
     * Record the result of building a file. This includes the case where the
     * build function failed; it does not include the case where we simply
     * reuse a previously cached result. The record's `setup_failed` field
     * must be false.
     */
    pub fn finish_building_file(&self, operation: Arc<BuildFileOp>) {
        let norm_cased_filename = self.inner.case.norm_case(&operation.filename);
        self.write_files(|maps| {
            maps.files
                .insert(operation.filename.clone(), Some(Arc::clone(&operation)));
            maps.norm_cased_files
                .insert(norm_cased_filename.clone(), Some(Arc::clone(&operation)));
        });
    }

    /**
     * Fail with `DuplicateBuild` if we have a cache entry for the specified
     * filename, including an entry for a file that has a different filename
     * but the same norm-cased filename.
     */
    pub fn assert_doesnt_have_norm_cased_file(
        &self,
        norm_cased_filename: &str,
        filename: &str,
    ) -> Result<(), BuildError> {
        self.read_files(|maps| assert_doesnt_have_file(maps, norm_cased_filename, filename))
    }

    /**
     * Return whether we created the specified non-norm-cased file. This does
     * not include cases where the build function failed.
     */
    pub fn created_file(&self, filename: &str) -> bool {
        self.read_files(|maps| {
            matches!(maps.files.get(filename), Some(Some(operation)) if !operation.raised)
        })
    }

    /** Like `created_file`, but keyed by the norm-cased filename */
    pub fn created_norm_cased_file(&self, norm_cased_filename: &str) -> bool {
        self.read_files(|maps| {
            matches!(
                maps.norm_cased_files.get(norm_cased_filename),
                Some(Some(operation)) if !operation.raised,
            )
        })
    }

    /**
     * Return the non-norm-cased filenames of all of the files that we have
     * finished building and that didn't result in an error.
     */
    pub fn created_files(&self) -> Vec<String> {
        self.read_files(|maps| {
            maps.files
                .iter()
                .filter(|(_, operation)| {
                    matches!(operation, Some(operation) if !operation.raised)
                })
                .map(|(filename, _)| filename.clone())
                .collect()
        })
    }

    /**
     * Return the finished operation associated with the specified subbuild
     * key. Return `None` if we haven't started or finished such a subbuild
     * (but not if the subbuild function failed).
     */
    pub fn get_subbuild(&self, key: &HashableValue) -> Option<Arc<SubbuildOp>> {
        self.read_subbuilds(|subbuilds| subbuilds.get(key).cloned().flatten())
    }

    /**
     * Return whether we have a cache entry for the specified subbuild key.
     * This returns true if we have started such a subbuild but haven't
     * finished.
     */
    pub fn has_subbuild(&self, key: &HashableValue) -> bool {
        self.read_subbuilds(|subbuilds| subbuilds.contains_key(key))
    }

    /**
     * Record that we are about to perform the specified subbuild. This does
     * not apply if we are simply reusing a previously cached result.
     *
     * Fails with `DuplicateSubbuild` if we already started a subbuild with
     * the same function name and arguments (e.g. in another thread).
     */
    pub fn start_subbuild(
        &self,
        key: HashableValue,
        func_name: &str,
        args: &Value,
        kwargs: &Value,
    ) -> Result<(), BuildError> {
        self.write_subbuilds(|subbuilds| {
            assert_doesnt_have_subbuild(subbuilds, &key, func_name, args, kwargs)?;
            subbuilds.insert(key, None);
            Ok(())
        })
    }

    /**
     * Record the result of executing a subbuild. This includes the case
     * where the subbuild function failed; it does not include the case where
     * we simply reuse a cached result. The record's `setup_failed` field
     * must be false.
     */
    pub fn finish_subbuild(&self, key: HashableValue, operation: Arc<SubbuildOp>) {
        self.write_subbuilds(|subbuilds| {
            subbuilds.insert(key, Some(operation));
        });
    }

    /** Fail with `DuplicateSubbuild` if we have an entry for the given key */
    pub fn assert_doesnt_have_subbuild(
        &self,
        key: &HashableValue,
        func_name: &str,
        args: &Value,
        kwargs: &Value,
    ) -> Result<(), BuildError> {
        self.read_subbuilds(|subbuilds| {
            assert_doesnt_have_subbuild(subbuilds, key, func_name, args, kwargs)
        })
    }

    /**
     * Reuse previously cached results for an operation tree.
     *
     * This stores cache entries for both `operation` and the build file and
     * subbuild operations in its suboperation tree, excluding those whose
     * `setup_failed` fields are true. Fails with `DuplicateBuild` or
     * `DuplicateSubbuild` if any of them collides with an existing entry.
     */
    pub fn use_cached_operation(&self, operation: &Operation) -> Result<(), BuildError> {
        match &self.inner.state {
            CacheState::Mutable {
                files, subbuilds, ..
            } => {
                let mut files = files.lock().unwrap();
                let mut subbuilds = subbuilds.lock().unwrap();
                assert_no_repeats(&files, &subbuilds, &*self.inner.case, operation)?;
                plant_operation(&mut files, &mut subbuilds, &*self.inner.case, operation);
                Ok(())
            }
            CacheState::Immutable { .. } => unreachable!("mutating an immutable cache"),
        }
    }

    /** Record the virtual creation of the specified directories */
    pub fn add_created_dirs<I>(&self, dirs: I)
    where
        I: IntoIterator<Item = String>,
    {
        match &self.inner.state {
            CacheState::Mutable { created_dirs, .. } => {
                created_dirs.lock().unwrap().extend(dirs);
            }
            CacheState::Immutable { .. } => unreachable!("mutating an immutable cache"),
        }
    }

    /**
     * Return the non-norm-cased filenames of the directories we virtually
     * created during this build. This information need not be current; the
     * builder doesn't record the created directories until the root build
     * function has finished.
     */
    pub fn created_dirs(&self) -> Vec<String> {
        match &self.inner.state {
            CacheState::Mutable { created_dirs, .. } => {
                created_dirs.lock().unwrap().iter().cloned().collect()
            }
            CacheState::Immutable { created_dirs, .. } => created_dirs.iter().cloned().collect(),
        }
    }

    /**
     * Return the version associated with the specified function name, or
     * JSON null if there is none.
     */
    pub fn get_func_version(&self, func_name: &str) -> &Value {
        self.inner
            .func_versions
            .get(func_name)
            .unwrap_or(&NULL_VERSION)
    }

    /**
     * Return the version associated with the specified simple operation
     * name, or JSON null if there is none. Whenever we change a simple
     * operation's interface or implementation, we change its version.
     */
    pub fn get_operation_version(&self, operation_name: &str) -> &Value {
        self.inner
            .operation_versions
            .get(operation_name)
            .unwrap_or(&NULL_VERSION)
    }

    /**
     * Write the contents of this `Cache` to the specified file, to be read
     * back later with `read_immutable`. This method assumes that no file
     * building or subbuilds are still in progress.
     */
    pub fn write(&self, filename: &str) -> Result<(), BuildError> {
        let (operations, created_dirs) = self.read_all(|files, subbuilds, created_dirs| {
            let operations = files
                .files
                .values()
                .filter_map(|operation| operation.clone())
                .map(Operation::BuildFile)
                .chain(
                    subbuilds
                        .values()
                        .filter_map(|operation| operation.clone())
                        .map(Operation::Subbuild),
                )
                .collect::<Vec<_>>();
            let created_dirs = created_dirs
                .iter()
                .cloned()
                .map(Value::String)
                .collect::<Vec<_>>();
            (operations, created_dirs)
        });

        // Root operations are those that don't appear as a suboperation of
        // another operation.
        let mut non_root_operations = HashSet::new();
        for operation in &operations {
            for suboperation in operation.suboperations() {
                if let Some(address) = complex_address(suboperation) {
                    non_root_operations.insert(address);
                }
            }
        }
        let root_operations_json = operations
            .iter()
            .filter(|operation| {
                complex_address(operation)
                    .is_none_or(|address| !non_root_operations.contains(&address))
            })
            .map(Operation::to_json)
            .collect::<Vec<_>>();

        let mut cache_json = Map::new();
        cache_json.insert(
            "buildName".to_string(),
            Value::String(self.inner.build_name.clone()),
        );
        cache_json.insert("cacheFileVersion".to_string(), CACHE_FILE_VERSION);
        cache_json.insert("createdDirs".to_string(), Value::Array(created_dirs));
        cache_json.insert(
            "funcVersions".to_string(),
            Value::Object(self.inner.func_versions.clone()),
        );
        cache_json.insert(
            "operationVersions".to_string(),
            Value::Object(self.inner.operation_versions.clone()),
        );
        cache_json.insert(
            "rootOperations".to_string(),
            Value::Array(root_operations_json),
        );
        cache_json.insert(
            "software".to_string(),
            Value::String(SOFTWARE.to_string()),
        );

        // Keys are sorted by construction, which also improves compression
        let contents = serde_json::to_string(&Value::Object(cache_json))
            .map_err(|error| BuildError::CacheFormat(error.to_string()))?;
        let mut encoder = GzEncoder::new(File::create(filename)?, Compression::default());
        encoder.write_all(contents.as_bytes())?;
        encoder.finish()?;
        Ok(())
    }

    /**
     * Return the `Cache` stored in the specified file, which should have
     * been written using `write`. The returned `Cache` is immutable.
     *
     * Fails with `FileNotFound` or `IsADirectory` if the file doesn't exist
     * or is a directory, and with `CacheFormat` if there was an error
     * parsing (or reading) the file. Parse errors are emitted on a
     * best-effort basis; it is possible that we will not fail even if the
     * file is invalid.
     */
    pub fn read_immutable(
        filename: &str,
        case: Arc<dyn PathCase>,
    ) -> Result<Cache, BuildError> {
        let path = Path::new(filename);
        if !path.is_file() {
            if path.is_dir() {
                return Err(BuildError::IsADirectory(filename.to_string()));
            }
            return Err(BuildError::FileNotFound(filename.to_string()));
        }

        let mut contents = String::new();
        let mut decoder = GzDecoder::new(File::open(path)?);
        decoder
            .read_to_string(&mut contents)
            .map_err(|_| read_error(filename))?;
        let cache_json: Value =
            serde_json::from_str(&contents).map_err(|_| read_error(filename))?;

        // A primitive check that this software created the file, in lieu of
        // validating the data types of everything in the payload
        let object = cache_json.as_object().ok_or_else(|| parse_error(filename))?;
        if object.get("software").and_then(Value::as_str) != Some(SOFTWARE) {
            return Err(parse_error(filename));
        }

        let version = object
            .get("cacheFileVersion")
            .ok_or_else(|| parse_error(filename))?;
        if !is_equal(version, &CACHE_FILE_VERSION) {
            return Err(BuildError::CacheFormat(format!(
                "error parsing cache file {}. This cache file was created with a newer \
                 version of the filebuild library. Try upgrading.",
                filename,
            )));
        }

        let build_name = object
            .get("buildName")
            .and_then(Value::as_str)
            .ok_or_else(|| parse_error(filename))?;
        let created_dirs = object
            .get("createdDirs")
            .and_then(Value::as_array)
            .ok_or_else(|| parse_error(filename))?
            .iter()
            .map(|dir| {
                dir.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| parse_error(filename))
            })
            .collect::<Result<BTreeSet<_>, _>>()?;
        let func_versions = object
            .get("funcVersions")
            .and_then(Value::as_object)
            .ok_or_else(|| parse_error(filename))?
            .clone();
        let operation_versions = object
            .get("operationVersions")
            .and_then(Value::as_object)
            .ok_or_else(|| parse_error(filename))?
            .clone();

        let mut files = HashMap::new();
        let mut subbuilds = HashMap::new();
        for operation_json in object
            .get("rootOperations")
            .and_then(Value::as_array)
            .ok_or_else(|| parse_error(filename))?
        {
            Operation::from_json(operation_json, &mut files, &mut subbuilds)
                .map_err(|_| parse_error(filename))?;
        }

        Ok(Cache::new(
            build_name.to_string(),
            files
                .into_iter()
                .map(|(filename, operation)| (filename, Some(operation)))
                .collect(),
            subbuilds
                .into_iter()
                .map(|(key, operation)| (key, Some(operation)))
                .collect(),
            created_dirs,
            func_versions,
            operation_versions,
            case,
            false,
        ))
    }

    fn read_files<R>(&self, f: impl FnOnce(&FileMaps) -> R) -> R {
        match &self.inner.state {
            CacheState::Mutable { files, .. } => f(&files.lock().unwrap()),
            CacheState::Immutable { files, .. } => f(files),
        }
    }

    fn write_files<R>(&self, f: impl FnOnce(&mut FileMaps) -> R) -> R {
        match &self.inner.state {
            CacheState::Mutable { files, .. } => f(&mut files.lock().unwrap()),
            CacheState::Immutable { .. } => unreachable!("mutating an immutable cache"),
        }
    }

    fn read_subbuilds<R>(&self, f: impl FnOnce(&SubbuildMap) -> R) -> R {
        match &self.inner.state {
            CacheState::Mutable { subbuilds, .. } => f(&subbuilds.lock().unwrap()),
            CacheState::Immutable { subbuilds, .. } => f(subbuilds),
        }
    }

    fn write_subbuilds<R>(&self, f: impl FnOnce(&mut SubbuildMap) -> R) -> R {
        match &self.inner.state {
            CacheState::Mutable { subbuilds, .. } => f(&mut subbuilds.lock().unwrap()),
            CacheState::Immutable { .. } => unreachable!("mutating an immutable cache"),
        }
    }

    fn read_all<R>(
        &self,
        f: impl FnOnce(&FileMaps, &SubbuildMap, &BTreeSet<String>) -> R,
    ) -> R {
        match &self.inner.state {
            CacheState::Mutable {
                files,
                subbuilds,
                created_dirs,
            } => {
                let files = files.lock().unwrap();
                let subbuilds = subbuilds.lock().unwrap();
                let created_dirs = created_dirs.lock().unwrap();
                f(&files, &subbuilds, &created_dirs)
            }
            CacheState::Immutable {
                files,
                subbuilds,
                created_dirs,
            } => f(files, subbuilds, created_dirs),
        }
    }
}

fn assert_doesnt_have_file(
    maps: &FileMaps,
    norm_cased_filename: &str,
    filename: &str,
) -> Result<(), BuildError> {
    if maps.norm_cased_files.contains_key(norm_cased_filename) {
        Err(BuildError::DuplicateBuild(filename.to_string()))
    } else {
        Ok(())
    }
}

fn assert_doesnt_have_subbuild(
    subbuilds: &SubbuildMap,
    key: &HashableValue,
    func_name: &str,
    args: &Value,
    kwargs: &Value,
) -> Result<(), BuildError> {
    if subbuilds.contains_key(key) {
        Err(BuildError::DuplicateSubbuild(format!(
            "{} was called twice with args = {}, kwargs = {}",
            func_name, args, kwargs,
        )))
    } else {
        Ok(())
    }
}

/**
 * Fail if one of the build file or subbuild operations in the specified
 * operation tree already has a cache entry. Operations whose `setup_failed`
 * fields are true are ignored.
 */
fn assert_no_repeats(
    files: &FileMaps,
    subbuilds: &SubbuildMap,
    case: &dyn PathCase,
    operation: &Operation,
) -> Result<(), BuildError> {
    match operation {
        Operation::BuildFile(operation) if !operation.setup_failed => {
            assert_doesnt_have_file(
                files,
                &case.norm_case(&operation.filename),
                &operation.filename,
            )?;
        }
        Operation::Subbuild(operation) if !operation.setup_failed => {
            assert_doesnt_have_subbuild(
                subbuilds,
                &operation.key(),
                &operation.func_name,
                &operation.args,
                &operation.kwargs,
            )?;
        }
        _ => {}
    }

    for suboperation in operation.suboperations() {
        if !matches!(suboperation, Operation::Simple(_)) {
            assert_no_repeats(files, subbuilds, case, suboperation)?;
        }
    }
    Ok(())
}

fn plant_operation(
    files: &mut FileMaps,
    subbuilds: &mut SubbuildMap,
    case: &dyn PathCase,
    operation: &Operation,
) {
    match operation {
        Operation::BuildFile(operation) if !operation.setup_failed => {
            files
                .files
                .insert(operation.filename.clone(), Some(Arc::clone(operation)));
            files.norm_cased_files.insert(
                case.norm_case(&operation.filename),
                Some(Arc::clone(operation)),
            );
        }
        Operation::Subbuild(operation) if !operation.setup_failed => {
            subbuilds.insert(operation.key(), Some(Arc::clone(operation)));
        }
        _ => {}
    }

    for suboperation in operation.suboperations() {
        if !matches!(suboperation, Operation::Simple(_)) {
            plant_operation(files, subbuilds, case, suboperation);
        }
    }
}

/** A stable address identifying a complex operation record */
fn complex_address(operation: &Operation) -> Option<usize> {
    match operation {
        Operation::Simple(_) => None,
        Operation::BuildFile(operation) => Some(Arc::as_ptr(operation) as usize),
        Operation::Subbuild(operation) => Some(Arc::as_ptr(operation) as usize),
    }
}

fn read_error(filename: &str) -> BuildError {
    BuildError::CacheFormat(format!(
        "error reading or parsing cache file {}",
        filename,
    ))
}

fn parse_error(filename: &str) -> BuildError {
    BuildError::CacheFormat(format!("error parsing cache file {}", filename))
}
