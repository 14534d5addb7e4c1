use filebuild_exec::{BuildError, FileBuilder, Value};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::env;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    match command {
        "build" => run_build(&args[2..]),
        "clean" => run_clean(&args[2..]),
        "--help" | "-h" | "help" => show_help(),
        _ => {
            eprintln!("Unknown command: {}", command);
            eprintln!("Run 'gzip-dir help' for usage");
            std::process::exit(1);
        }
    }
}

fn show_help() {
    println!("gzip-dir - incremental gzip compression of a directory tree");
    println!();
    println!("For each file in the input directory, creates a compressed file in the");
    println!("output directory with the same relative path and '.gz' appended. Results");
    println!("are cached, so unchanged inputs are not recompressed on the next run.");
    println!();
    println!("USAGE:");
    println!("    gzip-dir build <input_dir> <output_dir> [OPTIONS]");
    println!("    gzip-dir clean <output_dir> [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --cache <FILE>    Cache file (default: <output_dir>/gzip_cache.gz)");
    println!("    --only <PATTERN>  Only compress files whose names match the glob");
    println!("    -j, --parallel    Compress files in parallel");
    println!("    -h, --help        Show help");
}

struct Options {
    positional: Vec<String>,
    cache: Option<String>,
    only: Option<String>,
    parallel: bool,
}

fn parse_options(args: &[String]) -> Options {
    let mut options = Options {
        positional: Vec::new(),
        cache: None,
        only: None,
        parallel: false,
    };

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-j" | "--parallel" => options.parallel = true,
            "--cache" => options.cache = iter.next().cloned(),
            "--only" => options.only = iter.next().cloned(),
            _ => options.positional.push(arg.clone()),
        }
    }
    options
}

fn cache_filename(options: &Options, output_dir: &str) -> PathBuf {
    match &options.cache {
        Some(cache) => PathBuf::from(cache),
        None => Path::new(output_dir).join("gzip_cache.gz"),
    }
}

fn run_build(args: &[String]) {
    let options = parse_options(args);
    let [input_dir, output_dir] = options.positional.as_slice() else {
        eprintln!("Expected an input directory and an output directory");
        eprintln!("Run 'gzip-dir help' for usage");
        std::process::exit(1);
    };

    let pattern = options.only.as_ref().map(|only| {
        glob::Pattern::new(only).unwrap_or_else(|err| {
            eprintln!("Invalid --only pattern: {}", err);
            std::process::exit(1);
        })
    });

    let start = Instant::now();
    let cache = cache_filename(&options, output_dir);
    let result = FileBuilder::build(&cache, "gzip_dir", |builder| {
        gzip_with_builder(
            builder,
            input_dir,
            output_dir,
            pattern.as_ref(),
            options.parallel,
        )
    });

    match result {
        Ok(count) => {
            println!(
                "Compressed {} file(s) in {:.2}s",
                count,
                start.elapsed().as_secs_f64()
            );
        }
        Err(err) => {
            eprintln!("Build failed: {}", err);
            std::process::exit(1);
        }
    }
}

fn run_clean(args: &[String]) {
    let options = parse_options(args);
    let [output_dir] = options.positional.as_slice() else {
        eprintln!("Expected an output directory");
        eprintln!("Run 'gzip-dir help' for usage");
        std::process::exit(1);
    };

    if let Err(err) = FileBuilder::clean(cache_filename(&options, output_dir), Some("gzip_dir"))
    {
        eprintln!("Clean failed: {}", err);
        std::process::exit(1);
    }
    println!("Removed the files from the previous build");
}

/**
 * Compress the files in `input_dir` and its subdirectories, creating a
 * matching directory structure in `output_dir`. Returns the number of files
 * compressed or reused from cache.
 */
fn gzip_with_builder(
    builder: &FileBuilder,
    input_dir: &str,
    output_dir: &str,
    pattern: Option<&glob::Pattern>,
    parallel: bool,
) -> Result<usize, BuildError> {
    let entries = builder.walk(input_dir, true)?;

    // walk returns absolute, normalized filenames, so the raw input_dir
    // argument can't be stripped from them. Its first entry is the input
    // directory itself in that form, which anchors the relative layout
    // mirrored into output_dir.
    let Some((input_root, _, _)) = entries.first() else {
        return Ok(0);
    };

    let mut targets = Vec::new();
    for (dir, _, subfiles) in &entries {
        for subfile in subfiles {
            if pattern.is_some_and(|pattern| !pattern.matches(subfile)) {
                continue;
            }
            let input_filename = Path::new(dir).join(subfile);
            let relative = input_filename
                .strip_prefix(input_root)
                .unwrap_or(&input_filename);
            let output_filename =
                Path::new(output_dir).join(format!("{}.gz", relative.display()));
            targets.push((input_filename, output_filename));
        }
    }

    let count = targets.len();
    if parallel {
        let errors = Mutex::new(Vec::new());
        rayon::scope(|scope| {
            for (input_filename, output_filename) in &targets {
                scope.spawn(|_| {
                    let result = build_gzip_file(builder, input_filename, output_filename);
                    if let Err(err) = result {
                        errors.lock().unwrap().push(err);
                    }
                });
            }
        });
        if let Some(err) = errors.into_inner().unwrap().into_iter().next() {
            return Err(err);
        }
    } else {
        for (input_filename, output_filename) in &targets {
            build_gzip_file(builder, input_filename, output_filename)?;
        }
    }
    Ok(count)
}

fn build_gzip_file(
    builder: &FileBuilder,
    input_filename: &Path,
    output_filename: &Path,
) -> Result<Value, BuildError> {
    let input = input_filename.to_string_lossy().to_string();
    builder.build_file(output_filename, "gzip_file", &[input], gzip_file)
}

/** Build file function: compress the input file named in `args` with gzip */
fn gzip_file(
    builder: &FileBuilder,
    output_filename: &str,
    args: &Value,
    _kwargs: &Value,
) -> Result<Value, BuildError> {
    let input_filename = args[0]
        .as_str()
        .ok_or_else(|| BuildError::BadArg("expected an input filename".to_string()))?;
    let contents = builder.read_binary(input_filename)?;

    let mut encoder = GzEncoder::new(File::create(output_filename)?, Compression::default());
    encoder.write_all(&contents)?;
    encoder.finish()?;
    Ok(Value::Null)
}
