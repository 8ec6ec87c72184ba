//! Findings sink and run-report rendering.
//!
//! The tabular sink is the durable contract consumed by dataset tooling:
//!
//! ```text
//! package_name,file_resource,obfuscation_flag,entropy
//! com.example,classes.dex,Yes,7.981234
//! ```
//!
//! Rows are CSV (RFC 4180, minimal quoting, CRLF line endings). Workers never
//! touch the sink directly; they send findings over a bounded channel to the
//! single [`SinkWriter`] thread, which writes each row with one `write_all`.
//!
//! ```text
//! ┌──────────────┐  bounded channel  ┌──────────────┐     ┌──────┐
//! │ Rayon workers│ ──── Finding ───→ │ Sink writer  │ ──→ │ CSV  │
//! │ (N packages) │                   │  (1 thread)  │     │      │
//! └──────────────┘                   └──────────────┘     └──────┘
//! ```

use crate::error::{AnalysisError, Result};
use crate::types::{Finding, PackageOutcome, PackageReport, RunReport, SubScanStatus};
use colored::Colorize;
use crossbeam_channel::{bounded, Sender};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::thread::JoinHandle;
use tracing::{debug, error};

pub const CSV_HEADER: [&str; 4] = ["package_name", "file_resource", "obfuscation_flag", "entropy"];

const LINE_END: &str = "\r\n";

/// Findings buffered between workers and the writer thread
pub const SINK_CHANNEL_CAPACITY: usize = 256;

/// Destination for findings. Implementations are driven from one thread.
pub trait FindingSink: Send {
    /// Write the header row. Called once per run before any finding.
    fn write_header(&mut self) -> Result<()>;
    fn write_finding(&mut self, finding: &Finding) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

fn quote_field(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\r', '\n']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

/// Entropy column. Measured values use the shortest round-trip form (`8.0`,
/// `7.981234...`); findings that carry no measurement are written as `0`.
pub fn format_entropy(finding: &Finding) -> String {
    if finding.scored_bytes == 0 && finding.entropy == 0.0 {
        "0".to_string()
    } else {
        format!("{:?}", finding.entropy)
    }
}

pub fn format_flag(flag: bool) -> &'static str {
    if flag {
        "Yes"
    } else {
        "No"
    }
}

/// One complete CSV record, including the line terminator
pub fn format_row(finding: &Finding) -> String {
    format!(
        "{},{},{},{}{LINE_END}",
        quote_field(&finding.package_name),
        quote_field(&finding.resource_name),
        format_flag(finding.obfuscation_flag()),
        format_entropy(finding)
    )
}

/// CSV sink over any writer
pub struct CsvSink<W: Write + Send> {
    writer: W,
    header_written: bool,
}

impl<W: Write + Send> CsvSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, header_written: false }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl CsvSink<BufWriter<File>> {
    /// Create (truncate) the sink file at `path`
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)
            .map_err(|e| AnalysisError::sink_write(format!("cannot create {}: {e}", path.display())))?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> FindingSink for CsvSink<W> {
    fn write_header(&mut self) -> Result<()> {
        if self.header_written {
            return Ok(());
        }
        let line = format!("{}{LINE_END}", CSV_HEADER.join(","));
        self.writer.write_all(line.as_bytes()).map_err(|e| AnalysisError::sink_write(e.to_string()))?;
        self.header_written = true;
        Ok(())
    }

    fn write_finding(&mut self, finding: &Finding) -> Result<()> {
        self.write_header()?;
        self.writer
            .write_all(format_row(finding).as_bytes())
            .map_err(|e| AnalysisError::sink_write(e.to_string()))
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(|e| AnalysisError::sink_write(e.to_string()))
    }
}

/// Collects findings in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    pub header_writes: usize,
    pub findings: Vec<Finding>,
}

impl FindingSink for MemorySink {
    fn write_header(&mut self) -> Result<()> {
        self.header_writes += 1;
        Ok(())
    }

    fn write_finding(&mut self, finding: &Finding) -> Result<()> {
        self.findings.push(finding.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Cloneable producer side of the sink channel
#[derive(Debug, Clone)]
pub struct SinkHandle {
    sender: Sender<Finding>,
}

impl SinkHandle {
    /// Queue one finding. Fails once the writer has stopped.
    pub fn send(&self, finding: Finding) -> Result<()> {
        self.sender
            .send(finding)
            .map_err(|_| AnalysisError::sink_write("sink writer stopped"))
    }
}

/// Owns the sink on a dedicated thread.
pub struct SinkWriter<S: FindingSink + 'static> {
    sender: Option<Sender<Finding>>,
    thread: Option<JoinHandle<(S, Result<u64>)>>,
}

impl<S: FindingSink + 'static> SinkWriter<S> {
    /// Write the header, then start the writer thread.
    pub fn spawn(mut sink: S, capacity: usize) -> Result<Self> {
        sink.write_header()?;

        let (sender, receiver) = bounded::<Finding>(capacity.max(1));
        let thread = std::thread::Builder::new()
            .name("entrapk-sink".to_string())
            .spawn(move || {
                let mut written = 0u64;
                // returning drops the receiver, which disconnects every producer
                for finding in receiver.iter() {
                    if let Err(e) = sink.write_finding(&finding) {
                        error!("Sink write failed: {}", e);
                        return (sink, Err(e));
                    }
                    written += 1;
                }
                let result = sink.flush().map(|()| written);
                debug!("Sink writer finished: {} rows", written);
                (sink, result)
            })?;

        Ok(Self { sender: Some(sender), thread: Some(thread) })
    }

    pub fn handle(&self) -> Option<SinkHandle> {
        self.sender.as_ref().map(|sender| SinkHandle { sender: sender.clone() })
    }

    /// Close the channel, wait for the writer and return the sink with its row count.
    ///
    /// Every [`SinkHandle`] must have been dropped, or this blocks.
    pub fn finish(mut self) -> Result<(S, u64)> {
        drop(self.sender.take());
        let thread = self
            .thread
            .take()
            .ok_or_else(|| AnalysisError::sink_write("sink writer already finished"))?;
        match thread.join() {
            Ok((sink, Ok(rows))) => Ok((sink, rows)),
            Ok((_, Err(e))) => Err(e),
            Err(_) => Err(AnalysisError::sink_write("sink writer panicked")),
        }
    }
}

/// A row read back from a sink file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkRow {
    pub package_name: String,
    pub file_resource: String,
    pub obfuscation_flag: bool,
    pub entropy: f64,
}

fn split_records(text: &str) -> Result<Vec<Vec<String>>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(AnalysisError::parse("findings", "unterminated quoted field"));
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    Ok(records)
}

/// Parse a sink file back into rows, validating the header.
pub fn read_findings<R: Read>(mut reader: R) -> Result<Vec<SinkRow>> {
    let mut text = String::new();
    reader.read_to_string(&mut text).map_err(|e| AnalysisError::decode("findings", e.to_string()))?;

    let mut records = split_records(&text)?.into_iter();
    let header = records.next().ok_or_else(|| AnalysisError::parse("findings", "missing header"))?;
    if header != CSV_HEADER {
        return Err(AnalysisError::parse("findings", format!("unexpected header: {}", header.join(","))));
    }

    records
        .enumerate()
        .map(|(i, record)| {
            let line = i + 2;
            let [package_name, file_resource, flag, entropy]: [String; 4] = record
                .try_into()
                .map_err(|r: Vec<String>| AnalysisError::parse("findings", format!("row {line}: {} fields", r.len())))?;
            let obfuscation_flag = match flag.as_str() {
                "Yes" => true,
                "No" => false,
                other => return Err(AnalysisError::parse("findings", format!("row {line}: bad flag {other:?}"))),
            };
            let entropy = entropy
                .parse::<f64>()
                .map_err(|e| AnalysisError::parse("findings", format!("row {line}: bad entropy: {e}")))?;
            Ok(SinkRow { package_name, file_resource, obfuscation_flag, entropy })
        })
        .collect()
}

/// Format the run report as pretty JSON
pub fn format_json(report: &RunReport) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

fn status_label(status: &SubScanStatus) -> String {
    match status {
        SubScanStatus::Pending => "pending".dimmed().to_string(),
        SubScanStatus::Completed => "ok".green().to_string(),
        SubScanStatus::NoContent => "no content".yellow().to_string(),
        SubScanStatus::Skipped => "skipped".dimmed().to_string(),
        SubScanStatus::Failed(reason) => format!("failed ({reason})").red().to_string(),
    }
}

fn format_package(out: &mut String, report: &PackageReport) {
    let outcome = match report.outcome {
        PackageOutcome::Completed => report.outcome.as_str().green(),
        PackageOutcome::PartiallyFailed => report.outcome.as_str().yellow(),
        PackageOutcome::Failed => report.outcome.as_str().red(),
    };
    let _ = writeln!(
        out,
        "├─ {} {} [{}] {}ms",
        report.package.name().bright_white(),
        report.package.path().display().to_string().dimmed(),
        outcome,
        report.duration_ms
    );

    if let Some(error) = &report.error {
        let _ = writeln!(out, "│     {}", error.red());
        return;
    }

    let scans: Vec<String> =
        report.sub_scans.iter().map(|(scan, status)| format!("{}: {}", scan.as_str(), status_label(status))).collect();
    let _ = writeln!(out, "│     {}", scans.join(", "));

    let flagged = if report.flagged > 0 { report.flagged.to_string().bright_red() } else { "0".normal() };
    let _ = writeln!(
        out,
        "│     {} scored, {} skipped, {} findings, {} flagged",
        report.resources_scored,
        report.total_skipped(),
        report.findings,
        flagged
    );
    for cert in &report.certificates {
        let _ = writeln!(out, "│     🔏 {} sha256:{} entropy {:.4}", cert.entry, cert.sha256.dimmed(), cert.entropy);
    }
}

/// Human-readable run summary
pub fn format_terminal(report: &RunReport) -> String {
    let mut out = String::new();
    for package in &report.packages {
        format_package(&mut out, package);
        out.push_str("│\n");
    }

    let tally = &report.tally;
    let _ = writeln!(
        out,
        "╰─ {} packages: {} completed, {} partially failed, {} failed",
        tally.packages(),
        tally.completed.to_string().green(),
        tally.partially_failed.to_string().yellow(),
        tally.failed.to_string().red()
    );
    let skipped: Vec<String> = tally.resources_skipped.iter().map(|(kind, n)| format!("{kind}={n}")).collect();
    let _ = writeln!(
        out,
        "   {} resources scored, {} skipped{}, {} findings ({} flagged)",
        tally.resources_scored,
        tally.resources_skipped.values().sum::<usize>(),
        if skipped.is_empty() { String::new() } else { format!(" [{}]", skipped.join(", ")) },
        tally.findings,
        tally.flagged
    );
    let elapsed = report.finished_at - report.started_at;
    let _ = writeln!(out, "   finished in {:.2}s", elapsed.num_milliseconds() as f64 / 1000.0);
    out
}
