use crate::error::{AnalysisError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default entropy cutoff in bits per byte
pub const DEFAULT_ENTROPY_THRESHOLD: f64 = 7.5;
pub const DEFAULT_DECOMPILER_TIMEOUT_SECS: u64 = 300;
pub const MAX_ENTRY_SIZE: u64 = 100 * 1024 * 1024; // 100MB

pub const DEFAULT_IDENTIFIER_FRAGMENTS: &[&str] = &["a", "b", "c", "x", "y", "z", "1234", "random"];

pub const DEFAULT_SUSPICIOUS_PERMISSIONS: &[&str] = &[
    "ACCESS_FINE_LOCATION",
    "READ_SMS",
    "WRITE_SMS",
    "INTERNET",
    "ACCESS_COARSE_LOCATION",
    "READ_CONTACTS",
    "SEND_SMS",
    "WRITE_EXTERNAL_STORAGE",
];

pub const DEFAULT_MEDIA_SUFFIXES: &[&str] = &[".mp3", ".mp4", ".ogg"];
pub const DEFAULT_ASSET_SUFFIXES: &[&str] = &[".png", ".jpg", ".xml", ".json"];
pub const DEFAULT_DECOMPILED_EXTENSIONS: &[&str] = &[".java", ".smali"];

/// Placeholder replaced with the package path in decompiler arguments
pub const INPUT_PLACEHOLDER: &str = "{input}";
/// Placeholder replaced with the tool's output directory in decompiler arguments
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

fn owned(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// An external decompiler invocation, e.g. `apktool d {input} -o {output} -f`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompilerSpec {
    /// Short label, also used as the output subdirectory name
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
}

impl DecompilerSpec {
    pub fn apktool() -> Self {
        Self {
            name: "apktool".to_string(),
            program: "apktool".to_string(),
            args: owned(&["d", INPUT_PLACEHOLDER, "-o", OUTPUT_PLACEHOLDER, "-f"]),
        }
    }

    pub fn jadx() -> Self {
        Self {
            name: "jadx".to_string(),
            program: "jadx".to_string(),
            args: owned(&["-d", OUTPUT_PLACEHOLDER, INPUT_PLACEHOLDER]),
        }
    }

    /// Arguments with placeholders substituted
    pub fn render_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace(INPUT_PLACEHOLDER, &input).replace(OUTPUT_PLACEHOLDER, &output))
            .collect()
    }
}

/// Thresholds, pattern lists and resource limits for an analysis run.
///
/// Read-only once a run starts; shared across workers behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisConfig {
    pub entropy_threshold: f64,
    pub identifier_fragments: Vec<String>,
    pub suspicious_permissions: Vec<String>,
    pub media_suffixes: Vec<String>,
    pub asset_suffixes: Vec<String>,
    pub decompiled_extensions: Vec<String>,
    pub decompilers: Vec<DecompilerSpec>,
    pub decompiler_timeout_secs: u64,
    /// Worker cap; 0 means "use available parallelism"
    pub workers: usize,
    pub max_entry_size: u64,
    pub detect_encoded_media: bool,
    /// `aapt` binary used as a fallback package-name lookup
    pub aapt_program: Option<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            entropy_threshold: DEFAULT_ENTROPY_THRESHOLD,
            identifier_fragments: owned(DEFAULT_IDENTIFIER_FRAGMENTS),
            suspicious_permissions: owned(DEFAULT_SUSPICIOUS_PERMISSIONS),
            media_suffixes: owned(DEFAULT_MEDIA_SUFFIXES),
            asset_suffixes: owned(DEFAULT_ASSET_SUFFIXES),
            decompiled_extensions: owned(DEFAULT_DECOMPILED_EXTENSIONS),
            decompilers: vec![DecompilerSpec::apktool(), DecompilerSpec::jadx()],
            decompiler_timeout_secs: DEFAULT_DECOMPILER_TIMEOUT_SECS,
            workers: 0,
            max_entry_size: MAX_ENTRY_SIZE,
            detect_encoded_media: true,
            aapt_program: None,
        }
    }
}

impl AnalysisConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a YAML override file; keys not present keep their defaults.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            AnalysisError::configuration(format!("Failed to read config {}: {e}", path.display()))
        })?;
        Self::from_yaml(&text)
            .map_err(|e| AnalysisError::configuration(format!("{}: {e}", path.display())))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)
            .map_err(|e| AnalysisError::configuration(format!("Invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration and return errors for invalid settings
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=8.0).contains(&self.entropy_threshold) {
            return Err(AnalysisError::configuration(format!(
                "entropy_threshold must be within [0, 8], got {}",
                self.entropy_threshold
            )));
        }

        if self.decompiler_timeout_secs == 0 {
            return Err(AnalysisError::configuration("decompiler_timeout_secs must be greater than 0"));
        }

        if self.max_entry_size == 0 {
            return Err(AnalysisError::configuration("max_entry_size must be greater than 0"));
        }

        // names double as output subdirectories
        let mut names = std::collections::HashSet::new();
        for spec in &self.decompilers {
            if spec.name.trim().is_empty() || spec.program.trim().is_empty() {
                return Err(AnalysisError::configuration("decompiler name and program must not be empty"));
            }
            if !names.insert(spec.name.as_str()) {
                return Err(AnalysisError::configuration(format!("duplicate decompiler name: {}", spec.name)));
            }
        }

        Ok(())
    }

    pub fn decompiler_timeout(&self) -> Duration {
        Duration::from_secs(self.decompiler_timeout_secs)
    }

    /// Pool size: `min(workers, available parallelism)`, or all cores when unset
    pub fn effective_workers(&self) -> usize {
        let available = std::thread::available_parallelism().map(std::num::NonZeroUsize::get).unwrap_or(1);
        match self.workers {
            0 => available,
            cap => cap.min(available),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = AnalysisConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.entropy_threshold, 7.5);
        assert_eq!(config.identifier_fragments.len(), 8);
        assert_eq!(config.decompilers.len(), 2);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let bad = AnalysisConfig { entropy_threshold: 9.0, ..AnalysisConfig::default() };
        assert!(bad.validate().is_err());

        let bad = AnalysisConfig { decompiler_timeout_secs: 0, ..AnalysisConfig::default() };
        assert!(bad.validate().is_err());

        let bad = AnalysisConfig { max_entry_size: 0, ..AnalysisConfig::default() };
        assert!(bad.validate().is_err());

        let bad = AnalysisConfig {
            decompilers: vec![DecompilerSpec { name: "x".into(), program: " ".into(), args: vec![] }],
            ..AnalysisConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_duplicate_decompiler_names_rejected() {
        let config = AnalysisConfig {
            decompilers: vec![
                DecompilerSpec::jadx(),
                DecompilerSpec { program: "/opt/jadx/bin/jadx".into(), ..DecompilerSpec::jadx() },
            ],
            ..AnalysisConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate decompiler name: jadx"), "{err}");

        let yaml = "decompilers:\n  - {name: a, program: tool, args: []}\n  - {name: a, program: tool, args: []}\n";
        assert!(AnalysisConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_yaml_overrides_keep_defaults() {
        let yaml = "entropy_threshold: 6.0\nsuspicious_permissions: [CAMERA]\ndecompilers: []\n";
        let config = AnalysisConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.entropy_threshold, 6.0);
        assert_eq!(config.suspicious_permissions, vec!["CAMERA".to_string()]);
        assert!(config.decompilers.is_empty());
        assert_eq!(config.media_suffixes, owned(DEFAULT_MEDIA_SUFFIXES));
    }

    #[test]
    fn test_yaml_unknown_key_rejected() {
        assert!(AnalysisConfig::from_yaml("entropy_treshold: 6.0\n").is_err());
    }

    #[test]
    fn test_render_args() {
        let args = DecompilerSpec::apktool().render_args(Path::new("/in/app.apk"), Path::new("/out/apktool"));
        assert_eq!(args, vec!["d", "/in/app.apk", "-o", "/out/apktool", "-f"]);
        let args = DecompilerSpec::jadx().render_args(Path::new("a.apk"), Path::new("o"));
        assert_eq!(args, vec!["-d", "o", "a.apk"]);
    }

    #[test]
    fn test_effective_workers_capped() {
        let config = AnalysisConfig { workers: 1, ..AnalysisConfig::default() };
        assert_eq!(config.effective_workers(), 1);
        let config = AnalysisConfig { workers: 0, ..AnalysisConfig::default() };
        assert!(config.effective_workers() >= 1);
    }
}
