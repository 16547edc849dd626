//! Main entry point for the zipvfs CLI application.
//!
//! Opens (or, for `put` and `mkdir`, creates) the archive named on the command
//! line, runs one command against it and flushes changes on the way out.

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use zipvfs::cli::Command;
use zipvfs::zip::{Extracted, is_directory_name, parent_name};
use zipvfs::{Cli, DirectoryTree, Extractor};

/// Application entry point.
fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log);

    let config = cli.archive_config();
    let tree = if cli.archive.exists() {
        DirectoryTree::open(&cli.archive, config)
    } else if matches!(cli.command, Command::Put { .. } | Command::Mkdir { .. }) {
        DirectoryTree::create(&cli.archive, config)
    } else {
        bail!("{}: no such archive", cli.archive.display());
    }
    .with_context(|| format!("cannot open {}", cli.archive.display()))?;

    run(&tree, &cli)?;

    if cli.mutates() {
        tree.close()
            .with_context(|| format!("cannot write {}", cli.archive.display()))?;
    }
    Ok(())
}

/// Logs go to stderr; `RUST_LOG` wins over `-L` flags.
fn init_logging(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(tree: &DirectoryTree, cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::List { verbose } => list_files(tree, *verbose),
        Command::Cat { entries } => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            let extractor = Extractor::new(tree);
            let show_filename = entries.len() > 1 && !cli.is_quiet();
            for name in entries {
                if show_filename {
                    writeln!(out, "--- {} ---", name)?;
                }
                extractor
                    .extract_to_writer(name.as_bytes(), &mut out)
                    .with_context(|| format!("cannot read {name}"))?;
            }
            out.flush()?;
            Ok(())
        }
        Command::Extract {
            files,
            extract_dir,
            exclude,
            overwrite,
            junk_paths,
        } => {
            let dest = extract_dir.clone().unwrap_or_else(|| PathBuf::from("."));
            extract_files(tree, cli, files, exclude, &dest, *overwrite, *junk_paths)
        }
        Command::Put {
            source,
            entry,
            append,
        } => put_file(tree, source, entry, *append),
        Command::Mkdir { dir } => {
            tree.create_directories(dir.as_bytes())
                .with_context(|| format!("cannot create {dir}"))?;
            Ok(())
        }
        Command::Rm { entries, recursive } => {
            for name in entries {
                remove_entry(tree, name, *recursive)?;
            }
            Ok(())
        }
        Command::Cp {
            source,
            target,
            force,
        } => {
            tree.copy(source.as_bytes(), target.as_bytes(), *force)
                .with_context(|| format!("cannot copy {source} to {target}"))?;
            Ok(())
        }
        Command::Mv {
            source,
            target,
            force,
        } => {
            tree.rename(source.as_bytes(), target.as_bytes(), *force)
                .with_context(|| format!("cannot move {source} to {target}"))?;
            Ok(())
        }
        Command::Comment { text } => {
            match text {
                Some(text) => tree.set_comment(text.as_bytes())?,
                None => println!("{}", String::from_utf8_lossy(&tree.comment())),
            }
            Ok(())
        }
    }
}

/// List entries in the archive.
///
/// Supports two output formats:
/// - Simple format: just entry names, one per line
/// - Verbose format (`-v`): table with size, compression ratio and timestamp
fn list_files(tree: &DirectoryTree, verbose: bool) -> Result<()> {
    let names = tree.names();

    if verbose {
        println!(
            "{:>10}  {:>10}  {:>5}  {:>10}  {:>5}  {:>8}  Name",
            "Length", "Size", "Cmpr", "Date", "Time", "CRC-32"
        );
        println!("{}", "-".repeat(80));
    }

    // Track totals for summary line
    let mut total_uncompressed = 0u64;
    let mut total_compressed = 0u64;
    let mut file_count = 0usize;

    for name in &names {
        if !verbose {
            println!("{}", String::from_utf8_lossy(name));
            continue;
        }

        let meta = tree.metadata(name)?;
        let (year, month, day) = meta.modified.ymd();
        let (hour, minute, _second) = meta.modified.hms();
        // Entries written in this session have no compressed size yet.
        let compressed = meta.compressed_size.unwrap_or(meta.size);

        println!(
            "{:>10}  {:>10}  {}  {:04}-{:02}-{:02}  {:02}:{:02}  {:>8}  {}",
            meta.size,
            compressed,
            ratio(compressed, meta.size),
            year,
            month,
            day,
            hour,
            minute,
            meta.crc32.map(|c| format!("{c:08x}")).unwrap_or_default(),
            String::from_utf8_lossy(name)
        );

        // Accumulate totals (excluding directories)
        if !meta.is_directory {
            total_uncompressed += meta.size;
            total_compressed += compressed;
            file_count += 1;
        }
    }

    if verbose {
        println!("{}", "-".repeat(80));
        println!(
            "{:>10}  {:>10}  {}  {:>31}  {} files, {}",
            total_uncompressed,
            total_compressed,
            ratio(total_compressed, total_uncompressed),
            "",
            file_count,
            format_size(total_uncompressed)
        );
    }

    Ok(())
}

/// Compression ratio as percentage saved.
fn ratio(compressed: u64, uncompressed: u64) -> String {
    if uncompressed > 0 && compressed <= uncompressed {
        format!("{:>4}%", 100 - (compressed * 100 / uncompressed))
    } else {
        "  0%".to_string()
    }
}

fn extract_files(
    tree: &DirectoryTree,
    cli: &Cli,
    files: &[String],
    exclude: &[String],
    dest: &Path,
    overwrite: bool,
    junk_paths: bool,
) -> Result<()> {
    // Apply filters to determine which entries to extract:
    // 1. If specific files are requested, only include matching entries
    // 2. Exclude entries matching the exclusion patterns
    let selected = |name: &[u8]| {
        let name = String::from_utf8_lossy(name);
        if !files.is_empty() {
            let matches = files.iter().any(|f| {
                if has_glob_chars(f) {
                    glob_match(f, &name)
                } else {
                    // No wildcards: exact match on the name or its last component
                    let trimmed = name.trim_end_matches('/');
                    let basename = trimmed.rsplit('/').next().unwrap_or(trimmed);
                    name == *f || trimmed == f || basename == f
                }
            });
            if !matches {
                return false;
            }
        }
        !exclude
            .iter()
            .any(|x| name.contains(x.as_str()) || glob_match(x, &name))
    };

    let extractor = Extractor::new(tree)
        .overwrite(overwrite)
        .junk_paths(junk_paths);
    for (name, outcome) in extractor.extract_matching(dest, selected)? {
        let name = String::from_utf8_lossy(&name);
        match outcome {
            Extracted::File { .. } if !cli.is_quiet() => println!("  extracting: {name}"),
            Extracted::Directory(_) if !cli.is_quiet() && !junk_paths => println!("    creating: {name}"),
            Extracted::Skipped(_) if !cli.is_very_quiet() => {
                eprintln!("Skipping: {name} (use -o to overwrite)")
            }
            Extracted::Unsafe if !cli.is_very_quiet() => {
                eprintln!("Skipping: {name} (path escapes the destination)")
            }
            _ => {}
        }
    }
    Ok(())
}

fn put_file(tree: &DirectoryTree, source: &Path, entry: &str, append: bool) -> Result<()> {
    if is_directory_name(entry.as_bytes()) {
        bail!("{entry}: entry name must not end with '/'");
    }
    if let Some(parent) = parent_name(entry.as_bytes()) {
        if !tree.exists(parent) {
            tree.create_directories(parent)?;
        }
    }

    let mut input = File::open(source).with_context(|| format!("cannot read {}", source.display()))?;
    let mut writer = tree.writer(entry.as_bytes(), append)?;
    io::copy(&mut input, &mut writer)?;
    writer
        .commit()
        .with_context(|| format!("cannot write {entry}"))?;
    Ok(())
}

/// Remove `name`; with `recursive`, everything below a directory goes first.
fn remove_entry(tree: &DirectoryTree, name: &str, recursive: bool) -> Result<()> {
    if recursive && is_directory_name(name.as_bytes()) {
        let prefix = name.as_bytes();
        let mut below = tree.matching(|n| n.len() > prefix.len() && n.starts_with(prefix));
        // Deepest first so every directory is empty when its turn comes.
        below.sort_by_key(|n| std::cmp::Reverse(n.len()));
        for child in below {
            tree.remove(&child)?;
        }
    }
    tree.remove(name.as_bytes())
        .with_context(|| format!("cannot remove {name}"))?;
    Ok(())
}

/// Check if a pattern contains glob wildcard characters.
fn has_glob_chars(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?')
}

/// Simple glob pattern matching supporting `*` and `?` wildcards.
///
/// - `*` matches zero or more characters
/// - `?` matches exactly one character
///
/// ```ignore
/// assert!(glob_match("*.txt", "readme.txt"));
/// assert!(glob_match("file?.dat", "file1.dat"));
/// assert!(!glob_match("*.txt", "readme.md"));
/// ```
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern_chars: Vec<char> = pattern.chars().collect();
    let text_chars: Vec<char> = text.chars().collect();

    fn do_match(pattern: &[char], text: &[char]) -> bool {
        match (pattern.first(), text.first()) {
            (None, None) => true,
            // Star matches zero characters, or one and stays for more
            (Some('*'), _) => {
                do_match(&pattern[1..], text) || (!text.is_empty() && do_match(pattern, &text[1..]))
            }
            (Some('?'), Some(_)) => do_match(&pattern[1..], &text[1..]),
            (Some(p), Some(t)) if *p == *t => do_match(&pattern[1..], &text[1..]),
            _ => false,
        }
    }

    do_match(&pattern_chars, &text_chars)
}

/// Format a byte size into a human-readable string.
///
/// ```ignore
/// assert_eq!(format_size(500), "500 bytes");
/// assert_eq!(format_size(1536), "1.50 KB");
/// ```
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
