//! entrapk - entropy-driven obfuscation detection for Android packages.
//!
//! Walks an APK's entries (signing blocks, manifest, bytecode, media, assets)
//! and the output trees of external decompilers, scores each resource's
//! Shannon entropy, applies naming and permission heuristics, and streams one
//! finding per resource to a CSV sink.
//!
//! # Example
//!
//! ```no_run
//! use entrapk::{AnalysisConfig, CancellationToken, CsvSink, Orchestrator};
//! use std::path::PathBuf;
//!
//! let orchestrator = Orchestrator::from_config(AnalysisConfig::default()).unwrap();
//! let sink = CsvSink::create("obfuscation_analysis.csv").unwrap();
//! let outcome = orchestrator
//!     .run_batch(&[PathBuf::from("app.apk")], sink, &CancellationToken::new())
//!     .unwrap();
//!
//! println!("{} findings", outcome.report.tally.findings);
//! ```

pub mod archive;
pub mod cancel;
pub mod classify;
pub mod cli;
pub mod config;
pub mod decompiler;
pub mod entropy;
pub mod error;
pub mod manifest;
pub mod orchestrator;
pub mod output;
pub mod resolver;
pub mod rules;
pub mod scanner;
pub mod types;

pub use archive::{ArchiveEntry, ArchiveOpener, ArchiveWalker, PackageArchive, ZipOpener};
pub use cancel::CancellationToken;
pub use classify::{ComponentClassifier, ComponentKind};
pub use config::{AnalysisConfig, DecompilerSpec};
pub use entropy::{calculate_entropy, EntropyScore};
pub use error::{AnalysisError, Result, SkipKind};
pub use orchestrator::{BatchOutcome, Collaborators, Orchestrator};
pub use output::{read_findings, CsvSink, FindingSink, SinkRow};
pub use rules::SuspicionRules;
pub use types::{Finding, PackageHandle, PackageOutcome, PackageReport, RunReport, RuleName, SuspicionVerdict};
