//! Per-package analysis and the batch pool.
//!
//! Each package runs `Pending → Extracting → Scanning → Aggregated → Done`
//! (or `Failed` when the archive cannot be opened). The certificate, manifest
//! and archive sub-scans share the opened archive and run in sequence; the
//! decompiled sub-scan runs alongside them via `rayon::join`. A sub-scan that
//! fails or panics only marks itself `Failed`.
//!
//! Batches run on a bounded rayon pool, one package per task. Findings stream
//! to the single sink writer.

use crate::archive::{ArchiveOpener, ArchiveWalker, PackageArchive, ZipOpener};
use crate::cancel::CancellationToken;
use crate::classify::{ComponentClassifier, ComponentKind};
use crate::config::AnalysisConfig;
use crate::decompiler::{Decompiler, ExternalDecompiler};
use crate::error::{AnalysisError, Result, SkipKind};
use crate::output::{FindingSink, SinkHandle, SinkWriter, SINK_CHANNEL_CAPACITY};
use crate::resolver::{ManifestResolver, PackageNameResolver};
use crate::rules::SuspicionRules;
use crate::scanner::{DecompiledTreeScanner, ScanOutcome};
use crate::types::{
    CertificateFingerprint, Finding, PackageHandle, PackageOutcome, PackageReport, PackageState, RunReport, SubScan,
    SubScanStatus, UNKNOWN_PACKAGE,
};
use chrono::Utc;
use rayon::prelude::*;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, info, warn};

/// External collaborators, injectable for tests
pub struct Collaborators {
    pub opener: Box<dyn ArchiveOpener>,
    pub resolver: Box<dyn PackageNameResolver>,
    pub decompilers: Vec<Box<dyn Decompiler>>,
}

impl Collaborators {
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            opener: Box::new(ZipOpener { max_entry_size: config.max_entry_size }),
            resolver: Box::new(ManifestResolver::from_config(config)),
            decompilers: ExternalDecompiler::from_config(config),
        }
    }
}

/// What one sub-scan contributed to its package
#[derive(Debug)]
struct SubScanResult {
    status: SubScanStatus,
    scored: usize,
    skipped: BTreeMap<SkipKind, usize>,
    findings: usize,
    flagged: usize,
    certificates: Vec<CertificateFingerprint>,
}

impl SubScanResult {
    fn new(status: SubScanStatus) -> Self {
        Self {
            status,
            scored: 0,
            skipped: BTreeMap::new(),
            findings: 0,
            flagged: 0,
            certificates: Vec::new(),
        }
    }

    fn add_skipped(&mut self, skipped: &BTreeMap<SkipKind, usize>) {
        for (kind, count) in skipped {
            *self.skipped.entry(*kind).or_insert(0) += count;
        }
    }
}

/// Counts findings on their way to the sink
struct Emitter<'a> {
    sink: &'a SinkHandle,
    findings: usize,
    flagged: usize,
}

impl<'a> Emitter<'a> {
    fn new(sink: &'a SinkHandle) -> Self {
        Self { sink, findings: 0, flagged: 0 }
    }

    fn emit(&mut self, finding: Finding) -> Result<()> {
        let flagged = finding.obfuscation_flag();
        self.sink.send(finding)?;
        self.findings += 1;
        if flagged {
            self.flagged += 1;
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Reason recorded on a failed sub-scan. Unrecoverable errors escape it.
fn failure_reason(error: AnalysisError) -> Result<String> {
    if !error.is_recoverable() {
        return Err(error);
    }
    Ok(match error {
        AnalysisError::Cancelled => "cancelled".to_string(),
        e => e.to_string(),
    })
}

/// Run one sub-scan with its panics contained.
///
/// Findings already handed to the sink stay counted when the scan panics.
fn contained<'s, F>(package: &PackageHandle, sub_scan: SubScan, sink: &'s SinkHandle, scan: F) -> Result<SubScanResult>
where
    F: FnOnce(&mut Emitter<'s>) -> Result<SubScanResult>,
{
    let mut emitter = Emitter::new(sink);
    let mut result = match catch_unwind(AssertUnwindSafe(|| scan(&mut emitter))) {
        Ok(result) => result?,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!("{}: {} sub-scan panicked: {}", package.name(), sub_scan.as_str(), message);
            SubScanResult::new(SubScanStatus::Failed(format!("panicked: {message}")))
        }
    };
    result.findings = emitter.findings;
    result.flagged = emitter.flagged;
    Ok(result)
}

/// Output of a batch run
pub struct BatchOutcome<S> {
    pub report: RunReport,
    pub sink: S,
    pub rows: u64,
}

pub struct Orchestrator {
    config: AnalysisConfig,
    rules: SuspicionRules,
    classifier: ComponentClassifier,
    collaborators: Collaborators,
    remove_processed: bool,
}

impl Orchestrator {
    pub fn new(config: AnalysisConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            rules: SuspicionRules::from_config(&config),
            classifier: ComponentClassifier::from_config(&config),
            config,
            collaborators,
            remove_processed: false,
        })
    }

    /// Orchestrator wired to the zip opener, manifest resolver and configured decompilers
    pub fn from_config(config: AnalysisConfig) -> Result<Self> {
        let collaborators = Collaborators::from_config(&config);
        Self::new(config, collaborators)
    }

    /// Delete each package file once it has been analysed (fully or partially)
    #[must_use]
    pub fn remove_processed(mut self, remove: bool) -> Self {
        self.remove_processed = remove;
        self
    }

    fn transition(report: &mut PackageReport, state: PackageState) {
        debug!("{}: {:?} -> {:?}", report.package.name(), report.state, state);
        report.state = state;
        report.transitions.push(state);
    }

    /// Enter `Scanning(sub_scan)` from either `rayon::join` arm
    fn enter_scan(lifecycle: &Mutex<&mut PackageReport>, sub_scan: SubScan) {
        let mut report = lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        Self::transition(&mut **report, PackageState::Scanning(sub_scan));
    }

    /// Run one walk over the opened archive for the entries `sub_scan` owns.
    fn scan_archive_entries(
        &self,
        package: &PackageHandle,
        archive: &mut dyn PackageArchive,
        sub_scan: SubScan,
        emitter: &mut Emitter<'_>,
        cancel: &CancellationToken,
    ) -> Result<SubScanResult> {
        debug!("{}: scanning {}", package.name(), sub_scan.as_str());
        let select = move |kind: ComponentKind| match sub_scan {
            SubScan::Certificate => kind == ComponentKind::Certificate,
            SubScan::Manifest => kind == ComponentKind::Manifest,
            _ => !matches!(kind, ComponentKind::Certificate | ComponentKind::Manifest),
        };

        let walker = ArchiveWalker::new(&self.classifier, &self.rules, cancel);
        match walker.walk(package, archive, select, |f| emitter.emit(f)) {
            Ok(stats) => {
                let status = if stats.visited == 0 { SubScanStatus::NoContent } else { SubScanStatus::Completed };
                let mut result = SubScanResult::new(status);
                result.scored = stats.scored;
                result.add_skipped(&stats.skipped);
                result.certificates = stats.certificates;
                Ok(result)
            }
            Err(e) => Ok(SubScanResult::new(SubScanStatus::Failed(failure_reason(e)?))),
        }
    }

    /// Run every decompiler into a scratch directory and scan what each produced.
    fn scan_decompiled(
        &self,
        package: &PackageHandle,
        emitter: &mut Emitter<'_>,
        cancel: &CancellationToken,
    ) -> Result<SubScanResult> {
        let decompilers = &self.collaborators.decompilers;
        if decompilers.is_empty() {
            return Ok(SubScanResult::new(SubScanStatus::Skipped));
        }

        // removed on every return path, including unwinding
        let workdir = match tempfile::Builder::new().prefix("entrapk-").tempdir() {
            Ok(dir) => dir,
            Err(e) => return Ok(SubScanResult::new(SubScanStatus::Failed(format!("scratch directory: {e}")))),
        };

        let scanner = DecompiledTreeScanner::from_config(&self.config, &self.rules, cancel);
        let mut result = SubScanResult::new(SubScanStatus::NoContent);
        let mut failures = Vec::new();
        let mut scanned_any = false;

        for decompiler in decompilers {
            let output = workdir.path().join(decompiler.name());
            debug!("{}: decompiling with {}", package.name(), decompiler.name());

            let attempt = catch_unwind(AssertUnwindSafe(|| decompiler.decompile(package.path(), &output, cancel)))
                .unwrap_or_else(|payload| {
                    Err(AnalysisError::external_tool(
                        decompiler.name(),
                        format!("panicked: {}", panic_message(payload.as_ref())),
                    ))
                });
            match attempt {
                Ok(()) => {}
                Err(AnalysisError::Cancelled) => {
                    failures.push("cancelled".to_string());
                    break;
                }
                Err(e) if !e.is_recoverable() => return Err(e),
                Err(e) => {
                    warn!("{}: {}", package.name(), e);
                    *result.skipped.entry(SkipKind::ExternalTool).or_insert(0) += 1;
                    failures.push(e.to_string());
                }
            }

            // a failed or timed-out tool may still have written part of its tree
            match scanner.scan(package, &output, |f| emitter.emit(f)) {
                Ok(ScanOutcome::NoContent) => {}
                Ok(ScanOutcome::Scanned(stats)) => {
                    scanned_any = true;
                    result.scored += stats.scored;
                    result.add_skipped(&stats.skipped);
                }
                Err(e) => {
                    failures.push(failure_reason(e)?);
                    break;
                }
            }
        }

        result.status = if !failures.is_empty() {
            SubScanStatus::Failed(failures.join("; "))
        } else if scanned_any {
            SubScanStatus::Completed
        } else {
            SubScanStatus::NoContent
        };

        if let Err(e) = workdir.close() {
            warn!("{}: failed to remove scratch directory: {}", package.name(), e);
        }
        Ok(result)
    }

    /// Extract, scan and aggregate into `report`.
    ///
    /// Errors returned here are package scope or wider: the archive could not
    /// be opened, the run was cancelled before the package started, or the
    /// sink failed.
    fn run_package(
        &self,
        package: &PackageHandle,
        report: &mut PackageReport,
        sink: &SinkHandle,
        cancel: &CancellationToken,
    ) -> Result<()> {
        cancel.check()?;

        Self::transition(report, PackageState::Extracting);
        let mut archive = self.collaborators.opener.open(package.path())?;

        let (archive_results, decompiled) = {
            let lifecycle = Mutex::new(&mut *report);
            let lifecycle = &lifecycle;
            rayon::join(
                || -> Result<Vec<(SubScan, SubScanResult)>> {
                    let mut results = Vec::with_capacity(3);
                    for sub_scan in [SubScan::Certificate, SubScan::Manifest, SubScan::Archive] {
                        let result = if cancel.is_cancelled() {
                            SubScanResult::new(SubScanStatus::Failed("cancelled".to_string()))
                        } else {
                            Self::enter_scan(lifecycle, sub_scan);
                            contained(package, sub_scan, sink, |emitter| {
                                self.scan_archive_entries(package, archive.as_mut(), sub_scan, emitter, cancel)
                            })?
                        };
                        results.push((sub_scan, result));
                    }
                    Ok(results)
                },
                || {
                    Self::enter_scan(lifecycle, SubScan::Decompiled);
                    contained(package, SubScan::Decompiled, sink, |emitter| {
                        self.scan_decompiled(package, emitter, cancel)
                    })
                },
            )
        };

        // merge whatever finished before escalating, so counts match the sink
        let mut results = Vec::with_capacity(SubScan::ALL.len());
        let mut escalated = None;
        match archive_results {
            Ok(archive_results) => results.extend(archive_results),
            Err(e) => escalated = Some(e),
        }
        match decompiled {
            Ok(result) => results.push((SubScan::Decompiled, result)),
            Err(e) => {
                escalated.get_or_insert(e);
            }
        }

        for (sub_scan, result) in results {
            if let SubScanStatus::Failed(reason) = &result.status {
                warn!("{}: {} sub-scan failed: {}", package.name(), sub_scan.as_str(), reason);
            }
            report.sub_scans.insert(sub_scan, result.status);
            report.resources_scored += result.scored;
            for (kind, count) in result.skipped {
                *report.skipped.entry(kind).or_insert(0) += count;
            }
            report.findings += result.findings;
            report.flagged += result.flagged;
            report.certificates.extend(result.certificates);
        }
        if let Some(e) = escalated {
            return Err(e);
        }
        Self::transition(report, PackageState::Aggregated);
        Ok(())
    }

    /// Analyse one package, streaming its findings to `sink`.
    ///
    /// Package failures (unopenable archive, cancellation, a panic outside any
    /// sub-scan) are recorded in the report, which keeps the resolved name and
    /// whatever was counted so far. Returns `Err` only for sink failures,
    /// which are fatal for the run.
    pub fn analyze_package(&self, path: &Path, sink: &SinkHandle, cancel: &CancellationToken) -> Result<PackageReport> {
        let started = Instant::now();
        let name = catch_unwind(AssertUnwindSafe(|| self.collaborators.resolver.resolve(path))).unwrap_or_else(|payload| {
            warn!("{}: name resolution panicked: {}", path.display(), panic_message(payload.as_ref()));
            UNKNOWN_PACKAGE.to_string()
        });
        let package = PackageHandle::new(name, path);
        let mut report = PackageReport::new(package.clone());

        let escalated = match catch_unwind(AssertUnwindSafe(|| self.run_package(&package, &mut report, sink, cancel))) {
            Ok(Ok(())) => None,
            Ok(Err(e @ (AnalysisError::SinkWrite { .. } | AnalysisError::Configuration { .. }))) => return Err(e),
            Ok(Err(e)) => Some(e.to_string()),
            Err(payload) => Some(format!("analysis panicked: {}", panic_message(payload.as_ref()))),
        };

        if let Some(error) = escalated {
            warn!("{}: {}", package.name(), error);
            Self::transition(&mut report, PackageState::Failed);
            for status in report.sub_scans.values_mut() {
                if *status == SubScanStatus::Pending {
                    *status = SubScanStatus::Skipped;
                }
            }
            report.error = Some(error);
        }

        report.outcome = report.derive_outcome();
        report.duration_ms = started.elapsed().as_millis() as u64;
        if report.state != PackageState::Failed {
            Self::transition(&mut report, PackageState::Done);
        }

        info!(
            "{}: {} ({} scored, {} findings, {} flagged) in {}ms",
            package.name(),
            report.outcome.as_str(),
            report.resources_scored,
            report.findings,
            report.flagged,
            report.duration_ms
        );
        Ok(report)
    }

    fn remove_package(report: &PackageReport) {
        let path = report.package.path();
        match std::fs::remove_file(path) {
            Ok(()) => debug!("Removed processed package {}", path.display()),
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }

    /// Analyse `paths` on a pool of `effective_workers()` threads.
    ///
    /// The sink header is written before any package starts. A sink failure
    /// cancels the remaining work and is returned as the run's error.
    pub fn run_batch<S: FindingSink + 'static>(
        &self,
        paths: &[PathBuf],
        sink: S,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome<S>> {
        let started_at = Utc::now();
        let workers = self.config.effective_workers();
        info!("Analysing {} packages with {} workers", paths.len(), workers);

        let writer = SinkWriter::spawn(sink, SINK_CHANNEL_CAPACITY)?;
        let handle = writer.handle().ok_or_else(|| AnalysisError::sink_write("sink writer not running"))?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("entrapk-worker-{i}"))
            .build()
            .map_err(|e| AnalysisError::configuration(format!("failed to build worker pool: {e}")))?;

        let results: Vec<Result<PackageReport>> = pool.install(|| {
            paths
                .par_iter()
                .map(|path| {
                    let result = self.analyze_package(path, &handle, cancel);
                    match &result {
                        Err(e) => {
                            warn!("{}: {}; cancelling run", path.display(), e);
                            cancel.cancel();
                        }
                        Ok(report) if self.remove_processed && report.outcome != PackageOutcome::Failed => {
                            Self::remove_package(report);
                        }
                        Ok(_) => {}
                    }
                    result
                })
                .collect()
        });
        drop(handle);

        let finished = writer.finish();

        let mut packages = Vec::with_capacity(results.len());
        let mut sink_error = None;
        for result in results {
            match result {
                Ok(report) => packages.push(report),
                Err(e) => {
                    sink_error.get_or_insert(e);
                }
            }
        }

        let (sink, rows) = finished?;
        if let Some(e) = sink_error {
            return Err(e);
        }

        let report = RunReport::new(started_at, packages);
        info!(
            "Run finished: {} completed, {} partially failed, {} failed, {} rows written",
            report.tally.completed, report.tally.partially_failed, report.tally.failed, rows
        );
        Ok(BatchOutcome { report, sink, rows })
    }
}
