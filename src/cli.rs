use clap::{Parser, Subcommand};

/// Default sink file, relative to the working directory
pub const DEFAULT_OUTPUT: &str = "obfuscation_analysis.csv";

#[derive(Parser, Debug)]
#[command(name = "entrapk")]
#[command(about = "Entropy-based obfuscation detection for Android packages")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Run summary format (json, terminal)
    #[arg(short, long, default_value = "terminal", global = true)]
    pub format: OutputFormat,

    /// CSV file receiving one row per finding
    #[arg(short, long, default_value = DEFAULT_OUTPUT, global = true)]
    pub output: String,

    /// YAML file overriding analysis defaults
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Entropy cutoff in bits per byte
    #[arg(long, global = true)]
    pub threshold: Option<f64>,

    /// Maximum concurrent packages (0 = available parallelism)
    #[arg(short, long, global = true)]
    pub workers: Option<usize>,

    /// Per-decompiler timeout in seconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Cancel the whole run after this many seconds
    #[arg(long, global = true)]
    pub deadline: Option<u64>,

    /// Skip external decompilers
    #[arg(long, global = true)]
    pub no_decompile: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Analyse packages (files, directories of *.apk, or "-" for paths on stdin)
    Scan {
        /// Packages or directories to scan
        #[arg(required = true)]
        paths: Vec<String>,

        /// Descend into subdirectories when searching for *.apk
        #[arg(short, long)]
        recursive: bool,

        /// Delete each package after it has been analysed
        #[arg(long)]
        remove_processed: bool,
    },
}

#[derive(Debug, Clone, clap::ValueEnum)]
pub enum OutputFormat {
    /// JSON output for machine consumption
    Json,
    /// Human-readable terminal output
    Terminal,
}
