use anyhow::{Context, Result};
use clap::Parser;
use entrapk::cli::{Args, Command, OutputFormat};
use entrapk::output::{format_json, format_terminal};
use entrapk::{AnalysisConfig, CancellationToken, CsvSink, Orchestrator};
use std::io::{BufRead, IsTerminal};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

/// Read paths from stdin, one per line.
/// Filters out empty lines and comments (lines starting with #).
fn read_paths_from_stdin() -> Vec<String> {
    let stdin = std::io::stdin();
    let reader = stdin.lock();
    reader
        .lines()
        .map_while(std::result::Result::ok)
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect()
}

/// Expand paths, replacing "-" with paths read from stdin.
fn expand_paths(paths: Vec<String>) -> Vec<String> {
    let mut expanded = Vec::new();
    let mut stdin_read = false;

    for path in paths {
        if path == "-" {
            if !stdin_read {
                let stdin_paths = read_paths_from_stdin();
                debug!("Read {} paths from stdin", stdin_paths.len());
                expanded.extend(stdin_paths);
                stdin_read = true;
            }
        } else {
            expanded.push(path);
        }
    }

    expanded
}

fn is_apk(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("apk"))
}

/// Files are taken as given; directories contribute their `*.apk` files.
fn discover_packages(paths: &[String], recursive: bool) -> Vec<PathBuf> {
    let mut packages = Vec::new();
    for path in paths.iter().map(Path::new) {
        if !path.is_dir() {
            packages.push(path.to_path_buf());
            continue;
        }

        let walker = WalkDir::new(path).max_depth(if recursive { usize::MAX } else { 1 }).sort_by_file_name();
        for entry in walker {
            match entry {
                Ok(entry) if entry.file_type().is_file() && is_apk(entry.path()) => {
                    packages.push(entry.into_path());
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to access directory entry: {}", e),
            }
        }
    }
    packages
}

fn load_config(args: &Args) -> Result<AnalysisConfig> {
    let mut config = match &args.config {
        Some(path) => AnalysisConfig::from_yaml_file(path)?,
        None => AnalysisConfig::default(),
    };
    if let Some(threshold) = args.threshold {
        config.entropy_threshold = threshold;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(timeout) = args.timeout {
        config.decompiler_timeout_secs = timeout;
    }
    if args.no_decompile {
        config.decompilers.clear();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Use RUST_LOG env var if set, otherwise use verbose flag
    // Examples: RUST_LOG=debug, RUST_LOG=entrapk::archive=trace
    let env_filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if args.verbose {
        EnvFilter::new("entrapk=debug")
    } else {
        EnvFilter::new("entrapk=info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    debug!("Logging initialized (verbose={})", args.verbose);

    if !std::io::stdout().is_terminal() {
        colored::control::set_override(false);
    }

    let config = load_config(&args)?;

    match &args.command {
        Command::Scan { paths, recursive, remove_processed } => {
            let paths = expand_paths(paths.clone());
            let packages = discover_packages(&paths, *recursive);
            if packages.is_empty() {
                anyhow::bail!("No packages found in {}", paths.join(", "));
            }
            info!("Found {} packages", packages.len());

            let cancel = match args.deadline {
                Some(secs) => CancellationToken::with_timeout(Duration::from_secs(secs)),
                None => CancellationToken::new(),
            };

            let sink = CsvSink::create(&args.output)
                .with_context(|| format!("Failed to open output file {}", args.output))?;
            let orchestrator = Orchestrator::from_config(config)?.remove_processed(*remove_processed);
            let outcome = orchestrator
                .run_batch(&packages, sink, &cancel)
                .with_context(|| format!("Analysis aborted; {} may be incomplete", args.output))?;

            info!("Wrote {} findings to {}", outcome.rows, args.output);

            let rendered = match args.format {
                OutputFormat::Json => format_json(&outcome.report)?,
                OutputFormat::Terminal => format_terminal(&outcome.report),
            };
            print!("{rendered}");
            if matches!(args.format, OutputFormat::Json) {
                println!();
            }
        }
    }

    Ok(())
}
