//! Cacheable records of the operations occurring during a build.
//!
//! There are two kinds of operations: simple operations, which are primitive
//! file system observations such as "is file" and "walk", and complex
//! operations - build file operations and subbuilds - which may consist of
//! calls to other operations. A build itself is not an operation, because it
//! isn't cacheable.
//!
//! Records only exist in finished form. While an operation is in progress,
//! its state lives in the engine scope driving it; the record is assembled
//! once the operation completes. Complex records are shared behind `Arc`, as
//! the same record appears both in the cache maps and in its parent's
//! suboperation list.

use crate::comparison::FileComparison;
use crate::error::BuildError;
use filebuild_utils::{HashableValue, to_hashable};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/** The simple file system operations exposed by the builder */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SimpleOpKind {
    Read,
    ListDir,
    Walk,
    IsFile,
    IsDir,
    Exists,
    GetSize,
}

impl SimpleOpKind {
    pub const ALL: [SimpleOpKind; 7] = [
        SimpleOpKind::Read,
        SimpleOpKind::ListDir,
        SimpleOpKind::Walk,
        SimpleOpKind::IsFile,
        SimpleOpKind::IsDir,
        SimpleOpKind::Exists,
        SimpleOpKind::GetSize,
    ];

    /** The name stored in cache files for this operation */
    pub fn as_str(self) -> &'static str {
        match self {
            SimpleOpKind::Read => "read",
            SimpleOpKind::ListDir => "list_dir",
            SimpleOpKind::Walk => "walk",
            SimpleOpKind::IsFile => "is_file",
            SimpleOpKind::IsDir => "is_dir",
            SimpleOpKind::Exists => "exists",
            SimpleOpKind::GetSize => "get_size",
        }
    }

    pub fn parse(name: &str) -> Option<SimpleOpKind> {
        SimpleOpKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
    }
}

/** A record of a simple operation */
#[derive(Clone, Debug)]
pub struct SimpleOp {
    pub kind: SimpleOpKind,

    /** The operation's positional arguments */
    pub args: Vec<Value>,

    /** The return value; `Null` if the operation raised */
    pub return_value: Value,

    /**
     * The name of the error kind the operation raised, as in
     * `BuildError::simple_op_kind`, or `None` if it didn't raise
     */
    pub error_kind: Option<String>,
}

/** A record of a build file operation */
#[derive(Debug)]
pub struct BuildFileOp {
    /** The absolute, normalized filename of the file being built */
    pub filename: String,

    /** The comparison used to check the output file between builds */
    pub file_comparison: FileComparison,

    pub func_name: String,
    pub args: Value,
    pub kwargs: Value,

    /** The operations this operation called, in order. */
    pub suboperations: Vec<Operation>,

    /** The sanitized return value; `Null` if the operation raised */
    pub return_value: Value,

    /** The comparison result for the output file; `Null` if raised */
    pub file_comparison_result: Value,

    /**
     * Whether the operation resulted in an error. If a build function fails
     * we don't cache a result for it, but the record may still be reused if
     * another build function catches the error.
     */
    pub raised: bool,

    /**
     * Whether an error occurred during "setup": after validating the
     * arguments, but before calling the supplied function or reusing a
     * cached result. Setup-failed records are never replayed, because the
     * conditions that gave rise to the failure might no longer hold.
     */
    pub setup_failed: bool,
}

/** A record of a subbuild operation */
#[derive(Debug)]
pub struct SubbuildOp {
    pub func_name: String,
    pub args: Value,
    pub kwargs: Value,
    pub suboperations: Vec<Operation>,
    pub return_value: Value,
    pub raised: bool,
    pub setup_failed: bool,
}

impl SubbuildOp {
    /** The cache key identifying this subbuild's function name and arguments */
    pub fn key(&self) -> HashableValue {
        subbuild_key(&self.func_name, &self.args, &self.kwargs)
    }
}

/** Return the cache key for a subbuild with the specified name and arguments */
pub fn subbuild_key(func_name: &str, args: &Value, kwargs: &Value) -> HashableValue {
    to_hashable(&Value::Array(vec![
        Value::String(func_name.to_string()),
        args.clone(),
        kwargs.clone(),
    ]))
}

/** A finished record of an operation occurring during a build */
#[derive(Clone, Debug)]
pub enum Operation {
    Simple(SimpleOp),
    BuildFile(Arc<BuildFileOp>),
    Subbuild(Arc<SubbuildOp>),
}

impl Operation {
    /** The operations this operation called; empty for simple operations */
    pub fn suboperations(&self) -> &[Operation] {
        match self {
            Operation::Simple(_) => &[],
            Operation::BuildFile(operation) => &operation.suboperations,
            Operation::Subbuild(operation) => &operation.suboperations,
        }
    }

    /**
     * Return the JSON value representation used to store this operation in
     * the cache file. This is the inverse of `from_json`.
     */
    pub fn to_json(&self) -> Value {
        match self {
            Operation::Simple(operation) => {
                let mut json = Map::new();
                json.insert("args".to_string(), Value::Array(operation.args.clone()));
                json.insert("returnValue".to_string(), operation.return_value.clone());
                json.insert(
                    "type".to_string(),
                    Value::String(operation.kind.as_str().to_string()),
                );
                if let Some(error_kind) = &operation.error_kind {
                    json.insert(
                        "exceptionType".to_string(),
                        Value::String(error_kind.clone()),
                    );
                }
                Value::Object(json)
            }
            Operation::BuildFile(operation) => {
                let mut json = complex_to_json(
                    &operation.func_name,
                    &operation.args,
                    &operation.kwargs,
                    &operation.suboperations,
                    &operation.return_value,
                    operation.raised,
                    operation.setup_failed,
                );
                json.insert("type".to_string(), Value::String("build_file".to_string()));
                json.insert(
                    "filename".to_string(),
                    Value::String(operation.filename.clone()),
                );
                json.insert(
                    "fileComparison".to_string(),
                    Value::String(operation.file_comparison.as_str().to_string()),
                );
                json.insert(
                    "fileComparisonResult".to_string(),
                    operation.file_comparison_result.clone(),
                );
                Value::Object(json)
            }
            Operation::Subbuild(operation) => {
                let mut json = complex_to_json(
                    &operation.func_name,
                    &operation.args,
                    &operation.kwargs,
                    &operation.suboperations,
                    &operation.return_value,
                    operation.raised,
                    operation.setup_failed,
                );
                json.insert("type".to_string(), Value::String("subbuild".to_string()));
                Value::Object(json)
            }
        }
    }

    /**
     * Return the operation represented by the specified JSON value, as
     * stored in a cache file.
     *
     * Build file and subbuild records in the operation's suboperation tree
     * whose `setup_failed` fields are false are added to `files` and
     * `subbuilds` respectively, keyed by filename and subbuild key.
     */
    pub fn from_json(
        json: &Value,
        files: &mut HashMap<String, Arc<BuildFileOp>>,
        subbuilds: &mut HashMap<HashableValue, Arc<SubbuildOp>>,
    ) -> Result<Operation, BuildError> {
        let object = json.as_object().ok_or_else(invalid_record)?;
        let type_ = required_str(object, "type")?;
        match type_ {
            "build_file" => {
                let filename = required_str(object, "filename")?.to_string();
                let file_comparison = FileComparison::parse(
                    required_str(object, "fileComparison")?,
                )
                .ok_or_else(invalid_record)?;
                let operation = Arc::new(BuildFileOp {
                    filename: filename.clone(),
                    file_comparison,
                    func_name: required_str(object, "funcName")?.to_string(),
                    args: required(object, "args")?,
                    kwargs: required(object, "kwargs")?,
                    suboperations: suboperations_from_json(object, files, subbuilds)?,
                    return_value: required(object, "returnValue")?,
                    file_comparison_result: required(object, "fileComparisonResult")?,
                    raised: flag(object, "raised"),
                    setup_failed: flag(object, "setupFailed"),
                });
                if !operation.setup_failed {
                    files.insert(filename, Arc::clone(&operation));
                }
                Ok(Operation::BuildFile(operation))
            }
            "subbuild" => {
                let operation = Arc::new(SubbuildOp {
                    func_name: required_str(object, "funcName")?.to_string(),
                    args: required(object, "args")?,
                    kwargs: required(object, "kwargs")?,
                    suboperations: suboperations_from_json(object, files, subbuilds)?,
                    return_value: required(object, "returnValue")?,
                    raised: flag(object, "raised"),
                    setup_failed: flag(object, "setupFailed"),
                });
                if !operation.setup_failed {
                    subbuilds.insert(operation.key(), Arc::clone(&operation));
                }
                Ok(Operation::Subbuild(operation))
            }
            name => {
                let kind = SimpleOpKind::parse(name).ok_or_else(invalid_record)?;
                let args = match required(object, "args")? {
                    Value::Array(args) => args,
                    _ => return Err(invalid_record()),
                };
                let error_kind = match object.get("exceptionType") {
                    None => None,
                    Some(Value::String(error_kind)) => Some(error_kind.clone()),
                    Some(_) => return Err(invalid_record()),
                };
                Ok(Operation::Simple(SimpleOp {
                    kind,
                    args,
                    return_value: required(object, "returnValue")?,
                    error_kind,
                }))
            }
        }
    }
}

fn complex_to_json(
    func_name: &str,
    args: &Value,
    kwargs: &Value,
    suboperations: &[Operation],
    return_value: &Value,
    raised: bool,
    setup_failed: bool,
) -> Map<String, Value> {
    let suboperations_json = suboperations
        .iter()
        .map(Operation::to_json)
        .collect::<Vec<_>>();
    let mut json = Map::new();
    json.insert("args".to_string(), args.clone());
    json.insert("funcName".to_string(), Value::String(func_name.to_string()));
    json.insert("kwargs".to_string(), kwargs.clone());
    json.insert("returnValue".to_string(), return_value.clone());
    json.insert(
        "suboperations".to_string(),
        Value::Array(suboperations_json),
    );
    if raised {
        json.insert("raised".to_string(), Value::Bool(true));
    }
    if setup_failed {
        json.insert("setupFailed".to_string(), Value::Bool(true));
    }
    json
}

fn suboperations_from_json(
    object: &Map<String, Value>,
    files: &mut HashMap<String, Arc<BuildFileOp>>,
    subbuilds: &mut HashMap<HashableValue, Arc<SubbuildOp>>,
) -> Result<Vec<Operation>, BuildError> {
    let suboperations = match object.get("suboperations") {
        Some(Value::Array(suboperations)) => suboperations,
        _ => return Err(invalid_record()),
    };
    suboperations
        .iter()
        .map(|json| Operation::from_json(json, files, subbuilds))
        .collect()
}

fn required(object: &Map<String, Value>, key: &str) -> Result<Value, BuildError> {
    object.get(key).cloned().ok_or_else(invalid_record)
}

fn required_str<'a>(
    object: &'a Map<String, Value>,
    key: &str,
) -> Result<&'a str, BuildError> {
    object
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(invalid_record)
}

fn flag(object: &Map<String, Value>, key: &str) -> bool {
    object.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn invalid_record() -> BuildError {
    BuildError::CacheFormat("the cache file contains an invalid operation record".to_string())
}
