//! Package-name lookup. Best effort: every failure resolves to `"Unknown"`.

use crate::archive::{PackageArchive, ZipPackage};
use crate::classify::MANIFEST_NAME;
use crate::config::AnalysisConfig;
use crate::manifest::package_name_from_text;
use crate::types::UNKNOWN_PACKAGE;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::debug;

pub trait PackageNameResolver: Send + Sync {
    /// Human-readable identifier for the package at `path`, or `"Unknown"`.
    fn resolve(&self, path: &Path) -> String;
}

/// Text manifest `package` attribute, then `aapt dump badging` when configured.
#[derive(Debug, Clone)]
pub struct ManifestResolver {
    max_entry_size: u64,
    aapt_program: Option<String>,
}

impl ManifestResolver {
    pub fn new(max_entry_size: u64, aapt_program: Option<String>) -> Self {
        Self { max_entry_size, aapt_program }
    }

    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self::new(config.max_entry_size, config.aapt_program.clone())
    }

    fn from_manifest(&self, path: &Path) -> Option<String> {
        let mut archive = ZipPackage::open(path, self.max_entry_size).ok()?;
        let name = archive
            .entries()
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(MANIFEST_NAME))
            .map(|e| e.name.clone())?;
        let entry = archive.read_entry(&name).ok()?;
        let text = std::str::from_utf8(&entry.data).ok()?;
        package_name_from_text(text)
    }

    fn from_aapt(&self, program: &str, path: &Path) -> Option<String> {
        let output = Command::new(program)
            .args(["dump", "badging"])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .inspect_err(|e| debug!("{} unavailable: {}", program, e))
            .ok()?;
        if !output.status.success() {
            debug!("{} exited with {} for {}", program, output.status, path.display());
            return None;
        }
        parse_badging(&String::from_utf8_lossy(&output.stdout))
    }
}

impl PackageNameResolver for ManifestResolver {
    fn resolve(&self, path: &Path) -> String {
        if let Some(name) = self.from_manifest(path) {
            return name;
        }
        if let Some(program) = &self.aapt_program {
            if let Some(name) = self.from_aapt(program, path) {
                return name;
            }
        }
        debug!("Could not resolve package name for {}", path.display());
        UNKNOWN_PACKAGE.to_string()
    }
}

/// Extract `name='...'` from the `package:` line of `aapt dump badging` output
pub fn parse_badging(output: &str) -> Option<String> {
    let line = output.lines().find(|l| l.starts_with("package:"))?;
    let start = line.find("name='")? + "name='".len();
    let end = line[start..].find('\'')? + start;
    let name = &line[start..end];
    (!name.is_empty()).then(|| name.to_string())
}

/// Resolves every package to the same fixed name
#[derive(Debug, Clone)]
pub struct FixedResolver(pub String);

impl PackageNameResolver for FixedResolver {
    fn resolve(&self, _path: &Path) -> String {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn write_apk(dir: &Path, manifest: &[u8]) -> std::path::PathBuf {
        let path = dir.join("app.apk");
        let mut zip = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
        zip.start_file("AndroidManifest.xml", SimpleFileOptions::default()).unwrap();
        zip.write_all(manifest).unwrap();
        zip.finish().unwrap();
        path
    }

    #[test]
    fn test_parse_badging() {
        let out = "package: name='com.example.notes' versionCode='12' versionName='1.2'\nsdkVersion:'21'\n";
        assert_eq!(parse_badging(out).as_deref(), Some("com.example.notes"));
        assert_eq!(parse_badging("sdkVersion:'21'"), None);
        assert_eq!(parse_badging("package: name=''"), None);
    }

    #[test]
    fn test_resolves_text_manifest() {
        let dir = TempDir::new().unwrap();
        let apk = write_apk(dir.path(), br#"<manifest package="com.example.notes"/>"#);
        let resolver = ManifestResolver::new(1024 * 1024, None);
        assert_eq!(resolver.resolve(&apk), "com.example.notes");
    }

    #[test]
    fn test_binary_manifest_is_unknown() {
        let dir = TempDir::new().unwrap();
        let apk = write_apk(dir.path(), &[0x03, 0x00, 0x08, 0x00, 0xff, 0xfe]);
        let resolver = ManifestResolver::new(1024 * 1024, Some("entrapk-no-such-aapt".into()));
        assert_eq!(resolver.resolve(&apk), UNKNOWN_PACKAGE);
    }

    #[test]
    fn test_not_an_archive_is_unknown() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.apk");
        std::fs::write(&path, b"not a zip").unwrap();
        assert_eq!(ManifestResolver::new(1024, None).resolve(&path), UNKNOWN_PACKAGE);
    }
}
