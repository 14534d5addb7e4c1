//! Tests that the builder reuses cached results when it should.

use filebuild_exec::{FileBuilder, Value};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("filebuild_build_test_{}", name));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn path_str(path: &Path) -> String {
    path.to_str().unwrap().to_string()
}

/**
 * Lint-style build: reads each input file in a subbuild and returns the
 * concatenated per-file outputs. `lint_calls` counts subbuild invocations.
 */
fn lint_build(dir: &Path, cache: &Path, lint_calls: &AtomicUsize) -> String {
    FileBuilder::build(cache, "lint", |builder| {
        let mut output = String::new();
        for name in ["A.py", "B.py"] {
            let filename = path_str(&dir.join(name));
            let result = builder.subbuild("lint_file", &[filename], |builder, args, _kwargs| {
                lint_calls.fetch_add(1, Ordering::SeqCst);
                let filename = args[0].as_str().unwrap();
                let contents = builder.read_text(filename)?;
                let stem = Path::new(filename)
                    .file_stem()
                    .unwrap()
                    .to_string_lossy()
                    .to_string();
                Ok(Value::String(format!("out({},{})", stem, contents.len())))
            })?;
            output.push_str(result.as_str().unwrap());
        }
        Ok(output)
    })
    .unwrap()
}

#[test]
fn test_first_build_then_noop() {
    let dir = temp_dir("noop");
    let cache = dir.join("cache.gz");
    fs::write(dir.join("A.py"), "print(1)").unwrap();
    fs::write(dir.join("B.py"), "print(2)").unwrap();
    let lint_calls = AtomicUsize::new(0);

    let result1 = lint_build(&dir, &cache, &lint_calls);
    assert_eq!("out(A,8)out(B,8)", result1);
    assert_eq!(2, lint_calls.load(Ordering::SeqCst));
    assert!(cache.is_file());

    // Unchanged inputs: the subbuild functions are not executed again
    let result2 = lint_build(&dir, &cache, &lint_calls);
    assert_eq!(result1, result2);
    assert_eq!(2, lint_calls.load(Ordering::SeqCst));

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_input_change_invalidates_one_entry() {
    let dir = temp_dir("invalidate");
    let cache = dir.join("cache.gz");
    fs::write(dir.join("A.py"), "print(1)").unwrap();
    fs::write(dir.join("B.py"), "print(2)").unwrap();
    let lint_calls = AtomicUsize::new(0);

    lint_build(&dir, &cache, &lint_calls);
    assert_eq!(2, lint_calls.load(Ordering::SeqCst));

    fs::write(dir.join("A.py"), "print(3333)").unwrap();
    let result = lint_build(&dir, &cache, &lint_calls);

    // Only the subbuild for A.py re-ran
    assert_eq!("out(A,11)out(B,8)", result);
    assert_eq!(3, lint_calls.load(Ordering::SeqCst));

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_unchanged_rebuild_writes_identical_cache() {
    let dir = temp_dir("identical_cache");
    let cache = dir.join("cache.gz");
    fs::write(dir.join("A.py"), "print(1)").unwrap();
    fs::write(dir.join("B.py"), "print(2)").unwrap();
    let lint_calls = AtomicUsize::new(0);

    lint_build(&dir, &cache, &lint_calls);
    let first_bytes = fs::read(&cache).unwrap();
    lint_build(&dir, &cache, &lint_calls);
    let second_bytes = fs::read(&cache).unwrap();
    assert_eq!(first_bytes, second_bytes);

    fs::remove_dir_all(&dir).ok();
}

/**
 * Build a single output file via a subbuild, as in the nested caching
 * scenarios. Returns `[build_number, subbuild_number, file_number]` where
 * each element is the build number at which that level last executed.
 */
fn nested_build(
    dir: &Path,
    cache: &Path,
    build_number: usize,
    subbuild_arg: i64,
    file_arg: i64,
) -> Vec<i64> {
    let output = path_str(&dir.join("Output.txt"));
    FileBuilder::build(cache, "nested", |builder| {
        let result = builder.subbuild("subbuild", &[subbuild_arg], |builder, _args, _kwargs| {
            let file_result = builder.build_file(
                &output,
                "build_file",
                &[file_arg],
                |_builder, filename, _args, _kwargs| {
                    fs::write(filename, format!("Build {}", build_number))?;
                    Ok(Value::from(build_number))
                },
            )?;
            Ok(json!([build_number, file_result]))
        })?;
        let mut numbers = vec![Value::from(build_number)];
        numbers.extend(result.as_array().unwrap().clone());
        Ok(Value::Array(numbers))
    })
    .unwrap()
    .as_array()
    .unwrap()
    .iter()
    .map(|number| number.as_i64().unwrap())
    .collect()
}

#[test]
fn test_nested_caching() {
    let dir = temp_dir("nested");
    let cache = dir.join("cache.gz");
    let output = dir.join("Output.txt");

    assert_eq!(vec![1, 1, 1], nested_build(&dir, &cache, 1, 0, 0));
    assert_eq!("Build 1", fs::read_to_string(&output).unwrap());

    // Nothing changed: both levels are replayed
    assert_eq!(vec![2, 1, 1], nested_build(&dir, &cache, 2, 0, 0));
    assert_eq!("Build 1", fs::read_to_string(&output).unwrap());

    // Changing the subbuild argument re-runs the subbuild, but the inner
    // build file call is still cached
    assert_eq!(vec![3, 3, 1], nested_build(&dir, &cache, 3, 1, 0));
    assert_eq!("Build 1", fs::read_to_string(&output).unwrap());

    // Changing the build file argument re-runs both levels
    assert_eq!(vec![4, 4, 4], nested_build(&dir, &cache, 4, 1, 1));
    assert_eq!("Build 4", fs::read_to_string(&output).unwrap());

    // Modifying the output file on disk re-runs the build file call
    fs::write(&output, "externally changed").unwrap();
    assert_eq!(vec![5, 5, 5], nested_build(&dir, &cache, 5, 1, 1));
    assert_eq!("Build 5", fs::read_to_string(&output).unwrap());

    fs::remove_dir_all(&dir).ok();
}

fn versioned_build(
    dir: &Path,
    cache: &Path,
    version: &str,
    write_calls: &AtomicUsize,
) -> Value {
    let output = path_str(&dir.join("Output.txt"));
    FileBuilder::build_versioned(
        cache,
        "versions",
        &json!({"write": version}),
        |builder| {
            builder.build_file(&output, "write", &[] as &[i64], |_builder, filename, _args, _kwargs| {
                write_calls.fetch_add(1, Ordering::SeqCst);
                fs::write(filename, "text")?;
                Ok(Value::Null)
            })
        },
    )
    .unwrap()
}

#[test]
fn test_function_versions_invalidate_entries() {
    let dir = temp_dir("versions");
    let cache = dir.join("cache.gz");
    let write_calls = AtomicUsize::new(0);

    versioned_build(&dir, &cache, "v1", &write_calls);
    assert_eq!(1, write_calls.load(Ordering::SeqCst));

    versioned_build(&dir, &cache, "v1", &write_calls);
    assert_eq!(1, write_calls.load(Ordering::SeqCst));

    versioned_build(&dir, &cache, "v2", &write_calls);
    assert_eq!(2, write_calls.load(Ordering::SeqCst));

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_parallel_build_files() {
    let dir = temp_dir("parallel");
    let cache = dir.join("cache.gz");
    let build_calls = AtomicUsize::new(0);

    let run = |expected_calls: usize| {
        let count: usize = FileBuilder::build(&cache, "parallel", |builder| {
            let errors = std::sync::Mutex::new(Vec::new());
            rayon::scope(|scope| {
                for index in 0..8 {
                    let errors = &errors;
                    let build_calls = &build_calls;
                    let output = path_str(&dir.join(format!("Out{}.txt", index)));
                    scope.spawn(move |_| {
                        let result = builder.build_file(
                            &output,
                            "write_indexed",
                            &[index],
                            |_builder, filename, args, _kwargs| {
                                build_calls.fetch_add(1, Ordering::SeqCst);
                                fs::write(filename, args[0].to_string())?;
                                Ok(Value::Null)
                            },
                        );
                        if let Err(err) = result {
                            errors.lock().unwrap().push(err);
                        }
                    });
                }
            });
            assert!(errors.into_inner().unwrap().is_empty());
            Ok(8)
        })
        .unwrap();
        assert_eq!(8, count);
        assert_eq!(expected_calls, build_calls.load(Ordering::SeqCst));
    };

    run(8);
    for index in 0..8 {
        let contents = fs::read_to_string(dir.join(format!("Out{}.txt", index))).unwrap();
        assert_eq!(format!("{}", index), contents);
    }

    // A second run replays everything from cache
    run(8);

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_caught_failure_is_replayed() {
    let dir = temp_dir("caught_failure");
    let cache = dir.join("cache.gz");
    let inner_calls = AtomicUsize::new(0);

    let run = || {
        FileBuilder::build(&cache, "caught_failure", |builder| {
            builder.subbuild("outer", &[] as &[i64], |builder, _args, _kwargs| {
                let result =
                    builder.subbuild("inner", &[] as &[i64], |_builder, _args, _kwargs| {
                        inner_calls.fetch_add(1, Ordering::SeqCst);
                        Err(filebuild_exec::BuildError::user("inner failure"))
                    });
                match result {
                    Ok(_) => Ok(Value::String("unexpected".to_string())),
                    Err(_) => Ok(Value::String("caught".to_string())),
                }
            })
        })
        .unwrap()
    };

    assert_eq!(json!("caught"), run());
    assert_eq!(1, inner_calls.load(Ordering::SeqCst));

    // The caught failure is part of the cached record, so neither level
    // executes again
    assert_eq!(json!("caught"), run());
    assert_eq!(1, inner_calls.load(Ordering::SeqCst));

    fs::remove_dir_all(&dir).ok();
}
