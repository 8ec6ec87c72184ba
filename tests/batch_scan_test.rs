use entrapk::archive::{ArchiveOpener, ZipOpener};
use entrapk::config::MAX_ENTRY_SIZE;
use entrapk::scanner::{DecompiledTreeScanner, ScanOutcome};
use entrapk::types::{PackageState, SubScan, SubScanStatus};
use entrapk::{
    read_findings, AnalysisConfig, AnalysisError, CancellationToken, CsvSink, Orchestrator, PackageHandle,
    PackageOutcome, SuspicionRules,
};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

fn write_apk(dir: &Path, name: &str, entries: &[(&str, &[u8])]) -> PathBuf {
    let path = dir.join(name);
    let mut zip = zip::ZipWriter::new(fs::File::create(&path).unwrap());
    for (entry, data) in entries {
        zip.start_file(*entry, SimpleFileOptions::default()).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
    path
}

fn no_decompile() -> AnalysisConfig {
    AnalysisConfig { decompilers: Vec::new(), workers: 2, ..AnalysisConfig::default() }
}

fn run_to_csv(paths: &[PathBuf], csv: &Path) -> entrapk::RunReport {
    let orchestrator = Orchestrator::from_config(no_decompile()).unwrap();
    let sink = CsvSink::create(csv).unwrap();
    orchestrator.run_batch(paths, sink, &CancellationToken::new()).unwrap().report
}

#[test]
fn test_uniform_and_constant_payloads() {
    let dir = TempDir::new().unwrap();
    let uniform: Vec<u8> = (0..=255).collect();
    let apk = write_apk(
        dir.path(),
        "a.apk",
        &[("assets/constant.bin", &[b'A'; 100][..]), ("assets/uniform.bin", uniform.as_slice())],
    );
    let csv = dir.path().join("out.csv");
    run_to_csv(&[apk], &csv);

    let rows = read_findings(fs::File::open(&csv).unwrap()).unwrap();
    assert_eq!(rows.len(), 2);

    let constant = rows.iter().find(|r| r.file_resource == "assets/constant.bin").unwrap();
    assert_eq!(constant.entropy, 0.0);
    assert!(!constant.obfuscation_flag);

    let uniform = rows.iter().find(|r| r.file_resource == "assets/uniform.bin").unwrap();
    assert!((uniform.entropy - 8.0).abs() < 1e-6);
    assert!(uniform.obfuscation_flag);
}

#[test]
fn test_read_sms_permission_row() {
    let dir = TempDir::new().unwrap();
    let manifest = br#"<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="com.sms.reader">
        <uses-permission android:name="android.permission.READ_SMS"/>
    </manifest>"#;
    let apk = write_apk(dir.path(), "sms.apk", &[("AndroidManifest.xml", &manifest[..])]);
    let csv = dir.path().join("out.csv");
    run_to_csv(&[apk], &csv);

    let rows = read_findings(fs::File::open(&csv).unwrap()).unwrap();
    let sms = rows.iter().find(|r| r.file_resource.ends_with("READ_SMS")).unwrap();
    assert_eq!(sms.package_name, "com.sms.reader");
    assert!(sms.obfuscation_flag);
}

#[test]
fn test_empty_decompiler_tree_is_not_an_error() {
    let dir = TempDir::new().unwrap();
    let rules = SuspicionRules::default();
    let cancel = CancellationToken::new();
    let scanner = DecompiledTreeScanner::new(&rules, [".java", ".smali"], &cancel);
    let mut emitted = 0;
    let outcome = scanner
        .scan(&PackageHandle::unknown("a.apk"), dir.path(), |_| {
            emitted += 1;
            Ok(())
        })
        .unwrap();
    assert_eq!(outcome, ScanOutcome::NoContent);
    assert_eq!(emitted, 0);
}

#[test]
fn test_corrupt_archive_fails_only_its_package() {
    let dir = TempDir::new().unwrap();
    let corrupt = dir.path().join("corrupt.apk");
    fs::write(&corrupt, b"PK\x03\x04 truncated").unwrap();
    let good = write_apk(dir.path(), "good.apk", &[("classes.dex", &b"dex\n035\0payload"[..])]);

    let opener = ZipOpener { max_entry_size: MAX_ENTRY_SIZE };
    match opener.open(&corrupt) {
        Err(AnalysisError::Archive { path, .. }) => assert_eq!(path, corrupt),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("corrupt archive opened"),
    }

    let csv = dir.path().join("out.csv");
    let report = run_to_csv(&[corrupt.clone(), good], &csv);
    assert_eq!(report.tally.failed, 1);
    assert_eq!(report.tally.completed, 1);

    let failed = report.packages.iter().find(|p| p.package.path() == corrupt).unwrap();
    assert_eq!(failed.state, PackageState::Failed);
    assert_eq!(failed.outcome, PackageOutcome::Failed);
    assert_eq!(failed.findings, 0);

    let rows = read_findings(fs::File::open(&csv).unwrap()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].file_resource, "classes.dex");
}

#[test]
fn test_binary_manifest_keeps_entropy_row() {
    let dir = TempDir::new().unwrap();
    let axml: &[u8] = &[0x03, 0x00, 0x08, 0x00, 0xd0, 0x05, 0x00, 0x00, 0x01, 0x00, 0x1c, 0x00, 0xff, 0xfe];
    let apk = write_apk(dir.path(), "bin.apk", &[("AndroidManifest.xml", axml), ("META-INF/CERT.SF", &b"SHA-256-Digest: x"[..])]);
    let csv = dir.path().join("out.csv");
    let report = run_to_csv(&[apk], &csv);

    let package = &report.packages[0];
    assert_eq!(package.package.name(), "Unknown");
    assert_eq!(package.sub_scans[&SubScan::Manifest], SubScanStatus::Completed);
    assert_eq!(package.skipped[&entrapk::SkipKind::Decode], 1);
    // the certificate; the binary manifest is counted as skipped only
    assert_eq!(package.resources_scored, 1);
    assert_eq!(package.certificates.len(), 1);

    let rows = read_findings(fs::File::open(&csv).unwrap()).unwrap();
    assert!(rows.iter().any(|r| r.file_resource == "AndroidManifest.xml" && r.package_name == "Unknown"));
}

#[test]
fn test_header_written_once_across_packages() {
    let dir = TempDir::new().unwrap();
    let paths: Vec<PathBuf> = (0..6)
        .map(|i| write_apk(dir.path(), &format!("p{i}.apk"), &[("a.bin", &b"abc"[..]), ("b.bin", &b"defg"[..])]))
        .collect();
    let csv = dir.path().join("out.csv");
    let report = run_to_csv(&paths, &csv);
    assert_eq!(report.tally.completed, 6);

    let text = fs::read_to_string(&csv).unwrap();
    assert_eq!(text.matches("package_name,file_resource").count(), 1);
    assert_eq!(read_findings(text.as_bytes()).unwrap().len(), 12);
}
