use crate::cancel::CancellationToken;
use crate::classify::ComponentKind;
use crate::config::AnalysisConfig;
use crate::entropy::calculate_text_entropy;
use crate::error::{Result, SkipKind};
use crate::rules::SuspicionRules;
use crate::types::{Finding, PackageHandle};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

/// Result of scanning one decompiler output tree
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    /// The tree was missing or held no matching files
    NoContent,
    Scanned(TreeStats),
}

impl ScanOutcome {
    pub fn is_no_content(&self) -> bool {
        matches!(self, ScanOutcome::NoContent)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeStats {
    pub files_matched: usize,
    pub scored: usize,
    pub emitted: usize,
    pub skipped: BTreeMap<SkipKind, usize>,
}

/// Scores text files (`.java`, `.smali`) in a decompiler output directory.
///
/// Knows nothing about the tool that produced the tree.
#[derive(Debug)]
pub struct DecompiledTreeScanner<'a> {
    rules: &'a SuspicionRules,
    extensions: Vec<String>,
    cancel: &'a CancellationToken,
}

impl<'a> DecompiledTreeScanner<'a> {
    pub fn new<I, S>(rules: &'a SuspicionRules, extensions: I, cancel: &'a CancellationToken) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            rules,
            extensions: extensions.into_iter().map(|e| e.as_ref().to_lowercase()).collect(),
            cancel,
        }
    }

    pub fn from_config(config: &AnalysisConfig, rules: &'a SuspicionRules, cancel: &'a CancellationToken) -> Self {
        Self::new(rules, &config.decompiled_extensions, cancel)
    }

    fn matches_extension(&self, file_name: &str) -> bool {
        let lower = file_name.to_lowercase();
        self.extensions.iter().any(|ext| lower.ends_with(ext.as_str()))
    }

    fn kind_for(file_name: &str) -> ComponentKind {
        if file_name.to_lowercase().ends_with(".smali") {
            ComponentKind::Disassembly
        } else {
            ComponentKind::Source
        }
    }

    /// Walk `root` recursively, emitting one finding per matching file.
    ///
    /// Unreadable files and traversal errors are logged and counted. Only
    /// cancellation and `emit` errors are returned.
    pub fn scan<E>(&self, package: &PackageHandle, root: &Path, mut emit: E) -> Result<ScanOutcome>
    where
        E: FnMut(Finding) -> Result<()>,
    {
        if !root.is_dir() {
            debug!("{}: decompiler output {} does not exist", package.name(), root.display());
            return Ok(ScanOutcome::NoContent);
        }

        let mut stats = TreeStats::default();

        // sorted so repeated runs emit rows in the same order
        for entry in WalkDir::new(root).sort_by_file_name() {
            self.cancel.check()?;

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("{}: failed to access entry under {}: {}", package.name(), root.display(), e);
                    *stats.skipped.entry(SkipKind::EntryRead).or_insert(0) += 1;
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy();
            if !self.matches_extension(&file_name) {
                continue;
            }
            stats.files_matched += 1;

            let bytes = match fs::read(entry.path()) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("{}: failed to read {}: {}", package.name(), entry.path().display(), e);
                    *stats.skipped.entry(SkipKind::EntryRead).or_insert(0) += 1;
                    continue;
                }
            };

            // best-effort decode; the score is taken over the UTF-8 re-encoding
            let text = String::from_utf8_lossy(&bytes);
            let score = match calculate_text_entropy(&text) {
                Ok(score) => score,
                Err(_) => {
                    trace!("{}: {} is empty", package.name(), entry.path().display());
                    *stats.skipped.entry(SkipKind::EmptyInput).or_insert(0) += 1;
                    continue;
                }
            };
            stats.scored += 1;

            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            let resource_name = relative.to_string_lossy().replace('\\', "/");

            let finding = Finding::new(package.name(), resource_name, Self::kind_for(&file_name))
                .with_entropy(score)
                .with_verdict(self.rules.entropy_verdict(score.bits));

            emit(finding)?;
            stats.emitted += 1;
        }

        if stats.files_matched == 0 {
            info!("{}: no decompiled files under {}", package.name(), root.display());
            return Ok(ScanOutcome::NoContent);
        }

        debug!(
            "{}: scanned {} decompiled files under {} ({} scored)",
            package.name(),
            stats.files_matched,
            root.display(),
            stats.scored
        );
        Ok(ScanOutcome::Scanned(stats))
    }
}
