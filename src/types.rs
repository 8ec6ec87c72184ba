//! Data model shared by the scanners, the sink and the orchestrator.

use crate::classify::ComponentKind;
use crate::error::SkipKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Label used when the package name cannot be resolved
pub const UNKNOWN_PACKAGE: &str = "Unknown";

/// One package under analysis. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageHandle {
    name: String,
    path: PathBuf,
}

impl PackageHandle {
    pub fn new<S: Into<String>, P: Into<PathBuf>>(name: S, path: P) -> Self {
        let name = name.into();
        let name = if name.trim().is_empty() { UNKNOWN_PACKAGE.to_string() } else { name };
        Self { name, path: path.into() }
    }

    pub fn unknown<P: Into<PathBuf>>(path: P) -> Self {
        Self::new(UNKNOWN_PACKAGE, path)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Name of the rule that produced a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleName {
    HighEntropy,
    SuspiciousIdentifier,
    SuspiciousPermission,
    EncodedPayload,
}

impl RuleName {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleName::HighEntropy => "high_entropy",
            RuleName::SuspiciousIdentifier => "suspicious_identifier",
            RuleName::SuspiciousPermission => "suspicious_permission",
            RuleName::EncodedPayload => "encoded_payload",
        }
    }
}

impl std::fmt::Display for RuleName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one rule applied to one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspicionVerdict {
    pub rule: RuleName,
    pub triggered: bool,
    /// What triggered the rule (offending identifier, permission, ...)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub detail: Option<String>,
}

impl SuspicionVerdict {
    pub fn new(rule: RuleName, triggered: bool) -> Self {
        Self { rule, triggered, detail: None }
    }

    #[must_use]
    pub fn with_detail<S: Into<String>>(mut self, detail: S) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// One scored resource.
///
/// The flattened obfuscation flag is derived from the verdicts, so it holds
/// iff at least one verdict triggered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub package_name: String,
    pub resource_name: String,
    pub component_kind: ComponentKind,
    /// Bits per byte, in `[0, 8]`. 0 for findings that carry no measurement.
    pub entropy: f64,
    /// Bytes the entropy was computed over; 0 when nothing was measured
    pub scored_bytes: u64,
    pub verdicts: Vec<SuspicionVerdict>,
}

impl Finding {
    pub fn new<S1: Into<String>, S2: Into<String>>(
        package_name: S1,
        resource_name: S2,
        component_kind: ComponentKind,
    ) -> Self {
        Self {
            package_name: package_name.into(),
            resource_name: resource_name.into(),
            component_kind,
            entropy: 0.0,
            scored_bytes: 0,
            verdicts: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_entropy(mut self, score: crate::entropy::EntropyScore) -> Self {
        self.entropy = score.bits;
        self.scored_bytes = score.len;
        self
    }

    #[must_use]
    pub fn with_verdict(mut self, verdict: SuspicionVerdict) -> Self {
        self.verdicts.push(verdict);
        self
    }

    pub fn push_verdict(&mut self, verdict: SuspicionVerdict) {
        self.verdicts.push(verdict);
    }

    pub fn obfuscation_flag(&self) -> bool {
        self.verdicts.iter().any(|v| v.triggered)
    }

    /// Rules that triggered, in the order they were applied
    pub fn triggered_rules(&self) -> Vec<RuleName> {
        self.verdicts.iter().filter(|v| v.triggered).map(|v| v.rule).collect()
    }
}

/// SHA-256 fingerprint of a signing block entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateFingerprint {
    pub entry: String,
    pub sha256: String,
    pub entropy: f64,
}

/// Independent phases of one package's scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubScan {
    Certificate,
    Manifest,
    Archive,
    Decompiled,
}

impl SubScan {
    pub const ALL: [SubScan; 4] = [SubScan::Certificate, SubScan::Manifest, SubScan::Archive, SubScan::Decompiled];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubScan::Certificate => "certificate",
            SubScan::Manifest => "manifest",
            SubScan::Archive => "archive",
            SubScan::Decompiled => "decompiled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum SubScanStatus {
    Pending,
    Completed,
    /// Ran to completion but found nothing to score
    NoContent,
    /// Not configured for this run
    Skipped,
    Failed(String),
}

impl SubScanStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, SubScanStatus::Failed(_))
    }
}

/// Per-package lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "sub_scan", rename_all = "snake_case")]
pub enum PackageState {
    Pending,
    Extracting,
    Scanning(SubScan),
    Aggregated,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageOutcome {
    Completed,
    PartiallyFailed,
    Failed,
}

impl PackageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageOutcome::Completed => "completed",
            PackageOutcome::PartiallyFailed => "partially-failed",
            PackageOutcome::Failed => "failed",
        }
    }
}

/// Summary of one package's analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageReport {
    pub package: PackageHandle,
    pub state: PackageState,
    /// Every state entered after `Pending`, in order
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub transitions: Vec<PackageState>,
    pub outcome: PackageOutcome,
    pub sub_scans: BTreeMap<SubScan, SubScanStatus>,
    pub resources_scored: usize,
    pub skipped: BTreeMap<SkipKind, usize>,
    pub findings: usize,
    pub flagged: usize,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub certificates: Vec<CertificateFingerprint>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl PackageReport {
    pub fn new(package: PackageHandle) -> Self {
        Self {
            package,
            state: PackageState::Pending,
            transitions: Vec::new(),
            outcome: PackageOutcome::Completed,
            sub_scans: SubScan::ALL.iter().map(|s| (*s, SubScanStatus::Pending)).collect(),
            resources_scored: 0,
            skipped: BTreeMap::new(),
            findings: 0,
            flagged: 0,
            certificates: Vec::new(),
            error: None,
            duration_ms: 0,
        }
    }

    pub fn total_skipped(&self) -> usize {
        self.skipped.values().sum()
    }

    /// Outcome implied by the sub-scan statuses
    pub fn derive_outcome(&self) -> PackageOutcome {
        if self.state == PackageState::Failed {
            return PackageOutcome::Failed;
        }
        if self.sub_scans.values().any(SubScanStatus::is_failed) {
            PackageOutcome::PartiallyFailed
        } else {
            PackageOutcome::Completed
        }
    }
}

/// Final batch tally
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTally {
    pub completed: usize,
    pub partially_failed: usize,
    pub failed: usize,
    pub resources_scored: usize,
    pub resources_skipped: BTreeMap<SkipKind, usize>,
    pub findings: usize,
    pub flagged: usize,
}

impl RunTally {
    pub fn add(&mut self, report: &PackageReport) {
        match report.outcome {
            PackageOutcome::Completed => self.completed += 1,
            PackageOutcome::PartiallyFailed => self.partially_failed += 1,
            PackageOutcome::Failed => self.failed += 1,
        }
        self.resources_scored += report.resources_scored;
        for (kind, count) in &report.skipped {
            *self.resources_skipped.entry(*kind).or_insert(0) += count;
        }
        self.findings += report.findings;
        self.flagged += report.flagged;
    }

    pub fn packages(&self) -> usize {
        self.completed + self.partially_failed + self.failed
    }
}

/// Everything a run produced besides the sink rows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub packages: Vec<PackageReport>,
    pub tally: RunTally,
}

impl RunReport {
    pub fn new(started_at: DateTime<Utc>, packages: Vec<PackageReport>) -> Self {
        let mut tally = RunTally::default();
        for report in &packages {
            tally.add(report);
        }
        Self { started_at, finished_at: Utc::now(), packages, tally }
    }
}
