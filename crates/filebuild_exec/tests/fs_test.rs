//! Tests the virtual file system view, file/directory swaps, case handling,
//! and cleaning.

use filebuild_exec::{BuildError, FileBuilder, FoldedCase, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("filebuild_fs_test_{}", name));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn path_str(path: &Path) -> String {
    path.to_str().unwrap().to_string()
}

fn write_file(
    _builder: &FileBuilder,
    filename: &str,
    _args: &Value,
    _kwargs: &Value,
) -> Result<Value, BuildError> {
    fs::write(filename, "text")?;
    Ok(Value::Null)
}

#[test]
fn test_output_is_masked_while_building() {
    let dir = temp_dir("masked");
    let cache = dir.join("cache.gz");
    let output = path_str(&dir.join("Out.txt"));

    FileBuilder::build(&cache, "masked", |builder| {
        builder.build_file(
            &output,
            "write",
            &[] as &[i64],
            |builder, filename, _args, _kwargs| {
                // The file being built doesn't exist in the virtual view,
                // even once it has been written
                assert!(!builder.is_file(filename)?);
                fs::write(filename, "text")?;
                assert!(!builder.is_file(filename)?);
                assert!(!builder.exists(filename)?);
                Ok(Value::Null)
            },
        )?;

        // Once the build file call completes, the file exists
        assert!(builder.is_file(&output)?);
        assert_eq!(4, builder.get_size(&output)?);
        assert_eq!("text", builder.read_text(&output)?);
        Ok(())
    })
    .unwrap();

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_previous_outputs_are_masked() {
    let dir = temp_dir("previous");
    let cache = dir.join("cache.gz");
    let output = path_str(&dir.join("Sub").join("Out.txt"));
    let input = dir.join("input.txt");
    fs::write(&input, "input").unwrap();

    FileBuilder::build(&cache, "previous", |builder| {
        builder.build_file(&output, "write", &[1], write_file)
    })
    .unwrap();
    assert!(Path::new(&output).is_file());

    // In the next build, the previous build's output doesn't exist until it
    // is built again, and its directory is virtually absent too
    FileBuilder::build(&cache, "previous", |builder| {
        assert!(!builder.exists(&output)?);
        assert!(!builder.is_dir(dir.join("Sub"))?);
        assert_eq!(
            vec!["input.txt".to_string()],
            builder.list_dir(&dir)?,
        );
        Ok(())
    })
    .unwrap();

    // That build didn't rebuild the output, so committing removed it
    assert!(!Path::new(&output).exists());
    assert!(!dir.join("Sub").exists());

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_walk_sees_the_virtual_tree() {
    let dir = temp_dir("walk");
    let cache = dir.join("cache.gz");
    fs::write(dir.join("input.txt"), "input").unwrap();

    FileBuilder::build(&cache, "walk", |builder| {
        builder.build_file(
            dir.join("Sub").join("Out.txt"),
            "write",
            &[] as &[i64],
            write_file,
        )?;

        let entries = builder.walk(&dir, true)?;
        let dirs: Vec<&str> = entries.iter().map(|(dir, _, _)| dir.as_str()).collect();
        assert_eq!(
            vec![path_str(&dir), path_str(&dir.join("Sub"))],
            dirs,
        );
        // The cache file doesn't exist in the virtual view
        assert_eq!(
            (
                path_str(&dir),
                vec!["Sub".to_string()],
                vec!["input.txt".to_string()],
            ),
            entries[0],
        );
        assert_eq!(
            (
                path_str(&dir.join("Sub")),
                Vec::new(),
                vec!["Out.txt".to_string()],
            ),
            entries[1],
        );
        Ok(())
    })
    .unwrap();

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_swap_files_and_directories() {
    let dir = temp_dir("swap");
    let cache = dir.join("cache.gz");
    let foo1 = dir.join("Foo1");
    let foo2 = dir.join("Foo2");

    // Build 1 creates Foo1 as a file and Foo2/Bar/Baz as a file
    FileBuilder::build(&cache, "swap", |builder| {
        builder.build_file(&foo1, "write", &[1], write_file)?;
        builder.build_file(foo2.join("Bar").join("Baz"), "write", &[1], write_file)?;
        Ok(())
    })
    .unwrap();
    assert!(foo1.is_file());
    assert!(foo2.join("Bar").join("Baz").is_file());

    // Build 2 wants Foo1/Bar/Baz as a file and Foo2 as a file
    FileBuilder::build(&cache, "swap", |builder| {
        builder.build_file(foo1.join("Bar").join("Baz"), "write", &[2], write_file)?;
        builder.build_file(&foo2, "write", &[2], write_file)?;
        Ok(())
    })
    .unwrap();

    assert!(foo1.is_dir());
    assert!(foo1.join("Bar").join("Baz").is_file());
    assert!(foo2.is_file());
    assert_eq!("text", fs::read_to_string(&foo2).unwrap());

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_existing_foreign_directory_is_not_overwritten() {
    let dir = temp_dir("foreign_dir");
    let cache = dir.join("cache.gz");
    let output = dir.join("Data");
    fs::create_dir(&output).unwrap();
    fs::write(output.join("keep.txt"), "keep").unwrap();

    let outcome = FileBuilder::build(&cache, "foreign_dir", |builder| {
        let result = builder.build_file(&output, "write", &[] as &[i64], write_file);
        assert!(matches!(result, Err(BuildError::IsADirectory(_))));
        Ok(())
    });
    outcome.unwrap();

    // The externally created directory and its contents are untouched
    assert_eq!("keep", fs::read_to_string(output.join("keep.txt")).unwrap());

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_case_insensitive_duplicate_detection() {
    let dir = temp_dir("case_duplicate");
    let cache = dir.join("cache.gz");

    let outcome = FileBuilder::build_versioned_with_case(
        &cache,
        "case_duplicate",
        &serde_json::Map::new(),
        Arc::new(FoldedCase),
        |builder| {
            builder.build_file(dir.join("OUTPUT.txt"), "write", &[] as &[i64], write_file)?;
            let second =
                builder.build_file(dir.join("output.TXT"), "write", &[] as &[i64], write_file);
            assert!(matches!(second, Err(BuildError::DuplicateBuild(_))));
            Ok(())
        },
    );
    outcome.unwrap();

    // The file system entry's case matches the surviving call
    let names: Vec<String> = fs::read_dir(&dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert!(names.contains(&"OUTPUT.txt".to_string()), "{:?}", names);
    assert!(!names.contains(&"output.TXT".to_string()), "{:?}", names);

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_case_change_invalidates_cache() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let dir = temp_dir("case_change");
    let cache = dir.join("cache.gz");
    let output = dir.join("out.txt");
    let write_calls = AtomicUsize::new(0);

    let build = || {
        FileBuilder::build_versioned_with_case(
            &cache,
            "case_change",
            &serde_json::Map::new(),
            Arc::new(FoldedCase),
            |builder| {
                builder.build_file(
                    &output,
                    "write",
                    &[] as &[i64],
                    |_builder, filename, _args, _kwargs| {
                        write_calls.fetch_add(1, Ordering::SeqCst);
                        fs::write(filename, "text")?;
                        Ok(Value::Null)
                    },
                )
            },
        )
        .unwrap()
    };

    build();
    assert_eq!(1, write_calls.load(Ordering::SeqCst));

    // Unchanged: the cached result is reused
    build();
    assert_eq!(1, write_calls.load(Ordering::SeqCst));

    // Renaming the output to a different case makes the cached entry
    // invalid, so the file is rebuilt with the requested case
    fs::rename(&output, dir.join("OUT.TXT")).unwrap();
    build();
    assert_eq!(2, write_calls.load(Ordering::SeqCst));
    assert_eq!("text", fs::read_to_string(&output).unwrap());
    assert!(output.is_file());

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_clean() {
    let dir = temp_dir("clean");
    let cache = dir.join("cache.gz");
    let input = dir.join("input.txt");
    fs::write(&input, "input").unwrap();

    FileBuilder::build(&cache, "clean", |builder| {
        builder.build_file(
            dir.join("Out").join("A.txt"),
            "write",
            &[] as &[i64],
            write_file,
        )?;
        builder.build_file(dir.join("B.txt"), "write", &[] as &[i64], write_file)?;
        Ok(())
    })
    .unwrap();
    assert!(dir.join("Out").join("A.txt").is_file());

    FileBuilder::clean(&cache, Some("clean")).unwrap();
    assert!(!dir.join("Out").exists());
    assert!(!dir.join("B.txt").exists());
    assert!(!cache.exists());

    // Inputs are not part of the build's outputs, so they survive
    assert_eq!("input", fs::read_to_string(&input).unwrap());

    // Cleaning again is a no-op
    FileBuilder::clean(&cache, Some("clean")).unwrap();

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_clean_rejects_mismatched_build_name() {
    let dir = temp_dir("clean_name");
    let cache = dir.join("cache.gz");

    FileBuilder::build(&cache, "right_name", |_builder| Ok(())).unwrap();
    let result = FileBuilder::clean(&cache, Some("wrong_name"));
    assert!(matches!(result, Err(BuildError::CacheFormat(_))));

    // With no build name, the clean proceeds
    FileBuilder::clean(&cache, None).unwrap();
    assert!(!cache.exists());

    fs::remove_dir_all(&dir).ok();
}
