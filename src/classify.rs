//! Name-based classification of package entries.
//!
//! Classification looks only at the entry path, never at its content.

use crate::config::AnalysisConfig;
use serde::{Deserialize, Serialize};

/// Structural role of a package entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Certificate,
    Manifest,
    Media,
    Asset,
    Source,
    Disassembly,
    Other,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Certificate => "certificate",
            ComponentKind::Manifest => "manifest",
            ComponentKind::Media => "media",
            ComponentKind::Asset => "asset",
            ComponentKind::Source => "source",
            ComponentKind::Disassembly => "disassembly",
            ComponentKind::Other => "other",
        }
    }
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const MANIFEST_NAME: &str = "AndroidManifest.xml";

/// Maps entry names to [`ComponentKind`]. Suffix sets are stored lowercased.
#[derive(Debug, Clone)]
pub struct ComponentClassifier {
    media_suffixes: Vec<String>,
    asset_suffixes: Vec<String>,
}

impl ComponentClassifier {
    pub fn new<I, J, S, T>(media_suffixes: I, asset_suffixes: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        Self {
            media_suffixes: media_suffixes.into_iter().map(|s| s.as_ref().to_lowercase()).collect(),
            asset_suffixes: asset_suffixes.into_iter().map(|s| s.as_ref().to_lowercase()).collect(),
        }
    }

    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self::new(&config.media_suffixes, &config.asset_suffixes)
    }

    /// Classify an entry by name. Total: every name maps to exactly one kind.
    ///
    /// Rules are checked in order, so `AndroidManifest.xml` is a manifest even
    /// though `.xml` is an asset suffix.
    pub fn classify(&self, entry_name: &str) -> ComponentKind {
        let lower = entry_name.to_lowercase();

        if lower.ends_with("cert") || lower.ends_with("sf") {
            ComponentKind::Certificate
        } else if lower == MANIFEST_NAME.to_lowercase() {
            ComponentKind::Manifest
        } else if self.media_suffixes.iter().any(|s| lower.ends_with(s.as_str())) {
            ComponentKind::Media
        } else if self.asset_suffixes.iter().any(|s| lower.ends_with(s.as_str())) {
            ComponentKind::Asset
        } else if lower.ends_with(".java") {
            ComponentKind::Source
        } else if lower.ends_with(".smali") {
            ComponentKind::Disassembly
        } else {
            ComponentKind::Other
        }
    }
}

impl Default for ComponentClassifier {
    fn default() -> Self {
        Self::from_config(&AnalysisConfig::default())
    }
}
