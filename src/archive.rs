//! Package archive access and the entry walker.
//!
//! [`PackageArchive`] is the "named entry + bytes" boundary: the walker never
//! sees container internals. [`ZipPackage`] backs it with the `zip` crate and
//! [`MemoryArchive`] with an in-memory entry list.

use crate::cancel::CancellationToken;
use crate::classify::{ComponentClassifier, ComponentKind};
use crate::entropy::{calculate_entropy, EntropyLevel};
use crate::error::{AnalysisError, Result, SkipKind};
use crate::manifest::ManifestAnalyzer;
use crate::rules::SuspicionRules;
use crate::types::{CertificateFingerprint, Finding, PackageHandle};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{debug, info, trace, warn};

/// Listing information for one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub name: String,
    /// Uncompressed size declared by the container
    pub size: u64,
}

/// An entry's name and content, read-only for one scan pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub data: Vec<u8>,
}

/// List entries and read their bytes by name.
pub trait PackageArchive: Send {
    fn entries(&self) -> &[EntryInfo];
    fn read_entry(&mut self, name: &str) -> Result<ArchiveEntry>;
}

/// Opens a package path as a [`PackageArchive`]. Failure fails the whole package.
pub trait ArchiveOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn PackageArchive>>;
}

/// Zip-backed package (APKs are zip containers)
pub struct ZipPackage {
    archive: zip::ZipArchive<BufReader<File>>,
    entries: Vec<EntryInfo>,
    max_entry_size: u64,
}

impl ZipPackage {
    pub fn open<P: AsRef<Path>>(path: P, max_entry_size: u64) -> Result<Self> {
        let path = path.as_ref();
        debug!("Opening package archive: {}", path.display());

        let file = File::open(path).map_err(|e| AnalysisError::archive(path, format!("failed to open: {e}")))?;
        let mut archive = zip::ZipArchive::new(BufReader::new(file))
            .map_err(|e| AnalysisError::archive(path, format!("failed to read zip: {e}")))?;

        let mut entries = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            match archive.by_index_raw(i) {
                Ok(entry) if entry.is_file() => {
                    entries.push(EntryInfo { name: entry.name().to_string(), size: entry.size() });
                }
                Ok(_) => {}
                Err(e) => warn!("{}: unreadable central directory record {}: {}", path.display(), i, e),
            }
        }

        debug!("{}: {} entries", path.display(), entries.len());
        Ok(Self { archive, entries, max_entry_size })
    }
}

impl PackageArchive for ZipPackage {
    fn entries(&self) -> &[EntryInfo] {
        &self.entries
    }

    fn read_entry(&mut self, name: &str) -> Result<ArchiveEntry> {
        let entry = self.archive.by_name(name).map_err(|e| AnalysisError::entry_read(name, e.to_string()))?;

        // one extra byte tells us the limit was exceeded
        let mut data = Vec::new();
        entry
            .take(self.max_entry_size + 1)
            .read_to_end(&mut data)
            .map_err(|e| AnalysisError::entry_read(name, e.to_string()))?;

        if data.len() as u64 > self.max_entry_size {
            return Err(AnalysisError::entry_read(
                name,
                format!("exceeds limit of {} bytes", self.max_entry_size),
            ));
        }

        Ok(ArchiveEntry { name: name.to_string(), data })
    }
}

/// Opens packages with [`ZipPackage`]
#[derive(Debug, Clone)]
pub struct ZipOpener {
    pub max_entry_size: u64,
}

impl ArchiveOpener for ZipOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn PackageArchive>> {
        Ok(Box::new(ZipPackage::open(path, self.max_entry_size)?))
    }
}

/// In-memory archive, for callers that already hold entry contents.
///
/// Entries registered with [`MemoryArchive::with_unreadable`] fail on read.
#[derive(Debug, Clone, Default)]
pub struct MemoryArchive {
    entries: Vec<EntryInfo>,
    data: BTreeMap<String, Vec<u8>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_entry<S: Into<String>, B: Into<Vec<u8>>>(mut self, name: S, data: B) -> Self {
        let name = name.into();
        let data = data.into();
        self.entries.push(EntryInfo { name: name.clone(), size: data.len() as u64 });
        self.data.insert(name, data);
        self
    }

    #[must_use]
    pub fn with_unreadable<S: Into<String>>(mut self, name: S, size: u64) -> Self {
        self.entries.push(EntryInfo { name: name.into(), size });
        self
    }
}

impl PackageArchive for MemoryArchive {
    fn entries(&self) -> &[EntryInfo] {
        &self.entries
    }

    fn read_entry(&mut self, name: &str) -> Result<ArchiveEntry> {
        self.data
            .get(name)
            .map(|data| ArchiveEntry { name: name.to_string(), data: data.clone() })
            .ok_or_else(|| AnalysisError::entry_read(name, "entry not readable"))
    }
}

/// Counters from one walk over a package's entries
#[derive(Debug, Default, Clone, PartialEq)]
pub struct WalkStats {
    pub visited: usize,
    pub scored: usize,
    pub emitted: usize,
    pub skipped: BTreeMap<SkipKind, usize>,
    pub certificates: Vec<CertificateFingerprint>,
}

impl WalkStats {
    fn skip(&mut self, kind: SkipKind) {
        *self.skipped.entry(kind).or_insert(0) += 1;
    }
}

/// Classifies and scores package entries, streaming one finding per entry.
///
/// Composition per kind: every payload gets the entropy rule; media may also
/// get the encoded-payload rule; certificates are fingerprinted; the manifest
/// is delegated to [`ManifestAnalyzer`] and may yield several findings.
pub struct ArchiveWalker<'a> {
    classifier: &'a ComponentClassifier,
    rules: &'a SuspicionRules,
    cancel: &'a CancellationToken,
}

impl<'a> ArchiveWalker<'a> {
    pub fn new(classifier: &'a ComponentClassifier, rules: &'a SuspicionRules, cancel: &'a CancellationToken) -> Self {
        Self { classifier, rules, cancel }
    }

    /// Walk every entry whose kind passes `select`, handing findings to `emit`.
    ///
    /// Per-entry failures are logged and counted. Only cancellation and an
    /// `emit` error (sink failure) stop the walk.
    pub fn walk<F, E>(
        &self,
        package: &PackageHandle,
        archive: &mut dyn PackageArchive,
        select: F,
        mut emit: E,
    ) -> Result<WalkStats>
    where
        F: Fn(ComponentKind) -> bool,
        E: FnMut(Finding) -> Result<()>,
    {
        let mut stats = WalkStats::default();

        let selected: Vec<(String, u64, ComponentKind)> = archive
            .entries()
            .iter()
            .map(|e| (e.name.clone(), e.size, self.classifier.classify(&e.name)))
            .filter(|(_, _, kind)| select(*kind))
            .collect();

        // each visited entry lands in exactly one of `scored` or `skipped`
        for (name, size, kind) in selected {
            self.cancel.check()?;
            stats.visited += 1;

            if size == 0 {
                trace!("{}: {} is listed empty, not read", package.name(), name);
                stats.skip(SkipKind::EmptyInput);
                continue;
            }

            let entry = match archive.read_entry(&name) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("{}: skipping {}: {}", package.name(), name, e);
                    stats.skip(e.skip_kind().unwrap_or(SkipKind::EntryRead));
                    continue;
                }
            };

            if kind == ComponentKind::Manifest {
                let analysis = ManifestAnalyzer::new(self.rules).analyze(package.name(), &entry.name, &entry.data);
                // a manifest that was only partly analysed counts as skipped, even
                // though its entropy row is still emitted
                match analysis.errors.iter().find_map(AnalysisError::skip_kind) {
                    Some(kind) => stats.skip(kind),
                    None if !analysis.findings.is_empty() => stats.scored += 1,
                    None => {}
                }
                for finding in analysis.findings {
                    emit(finding)?;
                    stats.emitted += 1;
                }
                continue;
            }

            let score = match calculate_entropy(&entry.data) {
                Ok(score) => score,
                Err(_) => {
                    trace!("{}: {} is empty, not scored", package.name(), name);
                    stats.skip(SkipKind::EmptyInput);
                    continue;
                }
            };
            stats.scored += 1;

            trace!(
                "{}: {} [{}] entropy {:.4} ({})",
                package.name(),
                name,
                kind,
                score.bits,
                EntropyLevel::from_value(score.bits).as_str()
            );

            let mut finding = Finding::new(package.name(), entry.name.as_str(), kind)
                .with_entropy(score)
                .with_verdict(self.rules.entropy_verdict(score.bits));

            match kind {
                ComponentKind::Media if self.rules.detect_encoded_media => {
                    finding.push_verdict(self.rules.encoded_payload_verdict(&entry.data));
                }
                ComponentKind::Certificate => {
                    let sha256 = hex::encode(Sha256::digest(&entry.data));
                    info!("{}: certificate {} sha256={} entropy={:.4}", package.name(), name, sha256, score.bits);
                    stats.certificates.push(CertificateFingerprint {
                        entry: entry.name.clone(),
                        sha256,
                        entropy: score.bits,
                    });
                }
                _ => {}
            }

            if finding.obfuscation_flag() {
                debug!("{}: flagged {} ({:?})", package.name(), name, finding.triggered_rules());
            }
            emit(finding)?;
            stats.emitted += 1;
        }

        Ok(stats)
    }
}
