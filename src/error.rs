use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Error taxonomy for package analysis.
///
/// Per-resource and per-sub-scan errors are recovered where they occur and
/// counted; only archive-open failures (package scope) and sink failures (run
/// scope) are escalated.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("no bytes to score")]
    EmptyInput,

    #[error("could not decode {resource} as text: {message}")]
    Decode { resource: String, message: String },

    #[error("malformed {resource}: {message}")]
    Parse { resource: String, message: String },

    #[error("cannot open package {path}: {message}")]
    Archive { path: PathBuf, message: String },

    #[error("failed to read entry {entry}: {message}")]
    EntryRead { entry: String, message: String },

    #[error("external tool {tool} failed: {message}")]
    ExternalTool { tool: String, message: String },

    #[error("external tool {tool} exceeded {secs}s timeout")]
    Timeout { tool: String, secs: u64 },

    #[error("analysis cancelled")]
    Cancelled,

    #[error("failed to write findings: {message}")]
    SinkWrite { message: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AnalysisError>;

/// Counter key for resources that were seen but produced no (or only partial) findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipKind {
    EmptyInput,
    Decode,
    Parse,
    EntryRead,
    ExternalTool,
}

impl SkipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipKind::EmptyInput => "empty_input",
            SkipKind::Decode => "decode",
            SkipKind::Parse => "parse",
            SkipKind::EntryRead => "entry_read",
            SkipKind::ExternalTool => "external_tool",
        }
    }
}

impl std::fmt::Display for SkipKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AnalysisError {
    pub fn decode<S1: Into<String>, S2: Into<String>>(resource: S1, message: S2) -> Self {
        Self::Decode { resource: resource.into(), message: message.into() }
    }

    pub fn parse<S1: Into<String>, S2: Into<String>>(resource: S1, message: S2) -> Self {
        Self::Parse { resource: resource.into(), message: message.into() }
    }

    pub fn archive<P: Into<PathBuf>, S: Into<String>>(path: P, message: S) -> Self {
        Self::Archive { path: path.into(), message: message.into() }
    }

    pub fn entry_read<S1: Into<String>, S2: Into<String>>(entry: S1, message: S2) -> Self {
        Self::EntryRead { entry: entry.into(), message: message.into() }
    }

    pub fn external_tool<S1: Into<String>, S2: Into<String>>(tool: S1, message: S2) -> Self {
        Self::ExternalTool { tool: tool.into(), message: message.into() }
    }

    pub fn sink_write<S: Into<String>>(message: S) -> Self {
        Self::SinkWrite { message: message.into() }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Returns true if the error only affects a single resource or sub-scan.
    ///
    /// Unrecoverable errors escape their sub-scan: archive errors fail the
    /// package, sink and configuration errors fail the run.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Archive { .. } | Self::SinkWrite { .. } | Self::Configuration { .. })
    }

    /// Maps per-resource errors to the counter they are reported under
    pub fn skip_kind(&self) -> Option<SkipKind> {
        match self {
            Self::EmptyInput => Some(SkipKind::EmptyInput),
            Self::Decode { .. } => Some(SkipKind::Decode),
            Self::Parse { .. } => Some(SkipKind::Parse),
            Self::EntryRead { .. } | Self::Io(_) => Some(SkipKind::EntryRead),
            Self::ExternalTool { .. } | Self::Timeout { .. } => Some(SkipKind::ExternalTool),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverability() {
        assert!(AnalysisError::EmptyInput.is_recoverable());
        assert!(AnalysisError::parse("AndroidManifest.xml", "bad tag").is_recoverable());
        assert!(AnalysisError::Timeout { tool: "jadx".into(), secs: 5 }.is_recoverable());
        assert!(!AnalysisError::archive("x.apk", "not a zip").is_recoverable());
        assert!(!AnalysisError::sink_write("disk full").is_recoverable());
    }

    #[test]
    fn test_skip_kind_mapping() {
        assert_eq!(AnalysisError::EmptyInput.skip_kind(), Some(SkipKind::EmptyInput));
        assert_eq!(AnalysisError::decode("m", "utf8").skip_kind(), Some(SkipKind::Decode));
        assert_eq!(
            AnalysisError::Timeout { tool: "apktool".into(), secs: 1 }.skip_kind(),
            Some(SkipKind::ExternalTool)
        );
        assert_eq!(AnalysisError::Cancelled.skip_kind(), None);
        assert_eq!(AnalysisError::sink_write("x").skip_kind(), None);
    }

    #[test]
    fn test_display_messages() {
        let err = AnalysisError::archive("/tmp/bad.apk", "invalid Zip archive");
        assert_eq!(err.to_string(), "cannot open package /tmp/bad.apk: invalid Zip archive");
        assert_eq!(SkipKind::EntryRead.to_string(), "entry_read");
    }
}
