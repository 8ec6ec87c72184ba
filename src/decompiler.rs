//! External decompiler invocation.
//!
//! A decompiler is a blocking subprocess given `(package_path, output_dir)`.
//! It is bounded by a timeout and killed early if the run is cancelled.
//!
//! On unix the tool runs in its own process group and the whole group is
//! killed, so launcher scripts (`apktool`, `jadx`) take their JVM with them.

use crate::cancel::CancellationToken;
use crate::config::{AnalysisConfig, DecompilerSpec};
use crate::error::{AnalysisError, Result};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;
#[cfg(unix)]
use std::os::unix::process::CommandExt;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const STDERR_TAIL: usize = 512;

pub trait Decompiler: Send + Sync {
    /// Label, also the name of the tool's output subdirectory
    fn name(&self) -> &str;

    /// Populate `output` with a file tree for `package`.
    fn decompile(&self, package: &Path, output: &Path, cancel: &CancellationToken) -> Result<()>;
}

/// Runs a configured [`DecompilerSpec`] as a child process
#[derive(Debug, Clone)]
pub struct ExternalDecompiler {
    spec: DecompilerSpec,
    timeout: Duration,
}

impl ExternalDecompiler {
    pub fn new(spec: DecompilerSpec, timeout: Duration) -> Self {
        Self { spec, timeout }
    }

    /// One decompiler per configured spec
    pub fn from_config(config: &AnalysisConfig) -> Vec<Box<dyn Decompiler>> {
        config
            .decompilers
            .iter()
            .map(|spec| Box::new(Self::new(spec.clone(), config.decompiler_timeout())) as Box<dyn Decompiler>)
            .collect()
    }

    fn wait(&self, child: &mut Child, cancel: &CancellationToken) -> Result<ExitStatus> {
        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if started.elapsed() >= self.timeout {
                warn!("{} exceeded {:?}, killing", self.spec.name, self.timeout);
                kill(child);
                return Err(AnalysisError::Timeout { tool: self.spec.name.clone(), secs: self.timeout.as_secs() });
            }
            if cancel.is_cancelled() {
                debug!("{} cancelled, killing", self.spec.name);
                kill(child);
                return Err(AnalysisError::Cancelled);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Kill the child's process group, then the child itself, and reap it.
///
/// Must run before the child is reaped: until then its pid is still the
/// group id.
fn kill(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Err(e) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
            debug!("killpg failed (group may have exited): {}", e);
        }
    }
    if let Err(e) = child.kill() {
        debug!("kill failed (child may have exited): {}", e);
    }
    let _ = child.wait();
}

/// Command for `program`, leading a fresh process group on unix
fn tool_command(program: &str) -> Command {
    #[allow(unused_mut)]
    let mut command = Command::new(program);
    #[cfg(unix)]
    {
        command.process_group(0);
    }
    command
}

fn stderr_tail(file: &mut std::fs::File) -> String {
    let mut buf = Vec::new();
    if file.seek(SeekFrom::Start(0)).is_err() || file.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    let start = buf.len().saturating_sub(STDERR_TAIL);
    String::from_utf8_lossy(&buf[start..]).trim().to_string()
}

impl Decompiler for ExternalDecompiler {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn decompile(&self, package: &Path, output: &Path, cancel: &CancellationToken) -> Result<()> {
        cancel.check()?;

        let args = self.spec.render_args(package, output);
        debug!("Running {} {}", self.spec.program, args.join(" "));

        // stderr goes to an unlinked temp file so a chatty tool can't fill a pipe
        let mut stderr = tempfile::tempfile()?;
        let mut child = tool_command(&self.spec.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr.try_clone()?))
            .spawn()
            .map_err(|e| AnalysisError::external_tool(&self.spec.name, format!("failed to start {}: {e}", self.spec.program)))?;

        let status = self.wait(&mut child, cancel)?;
        if !status.success() {
            let tail = stderr_tail(&mut stderr);
            return Err(AnalysisError::external_tool(
                &self.spec.name,
                if tail.is_empty() { format!("exited with {status}") } else { format!("exited with {status}: {tail}") },
            ));
        }

        debug!("{} finished for {}", self.spec.name, package.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn shell(name: &str, script: &str, timeout: Duration) -> ExternalDecompiler {
        ExternalDecompiler::new(
            DecompilerSpec { name: name.to_string(), program: "sh".to_string(), args: vec!["-c".into(), script.into()] },
            timeout,
        )
    }

    #[test]
    fn test_missing_program() {
        let tool = ExternalDecompiler::new(
            DecompilerSpec { name: "ghost".into(), program: "entrapk-no-such-tool".into(), args: vec![] },
            Duration::from_secs(5),
        );
        let dir = TempDir::new().unwrap();
        let err = tool.decompile(Path::new("a.apk"), dir.path(), &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, AnalysisError::ExternalTool { ref tool, .. } if tool == "ghost"));
    }

    #[cfg(unix)]
    #[test]
    fn test_populates_output() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");
        let tool = shell("fake", "mkdir -p {output} && echo 'class A {}' > {output}/A.java", Duration::from_secs(10));
        tool.decompile(Path::new("a.apk"), &out, &CancellationToken::new()).unwrap();
        assert!(out.join("A.java").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn test_nonzero_exit_reports_stderr() {
        let dir = TempDir::new().unwrap();
        let tool = shell("broken", "echo 'bad dex' >&2; exit 3", Duration::from_secs(10));
        let err = tool.decompile(Path::new("a.apk"), dir.path(), &CancellationToken::new()).unwrap_err();
        match err {
            AnalysisError::ExternalTool { message, .. } => assert!(message.contains("bad dex"), "{message}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_kills_child() {
        let dir = TempDir::new().unwrap();
        let tool = shell("slow", "sleep 30", Duration::from_millis(200));
        let started = Instant::now();
        let err = tool.decompile(Path::new("a.apk"), dir.path(), &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, AnalysisError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn test_cancel_kills_child() {
        let dir = TempDir::new().unwrap();
        let tool = shell("slow", "sleep 30", Duration::from_secs(60));
        let cancel = CancellationToken::with_timeout(Duration::from_millis(100));
        let err = tool.decompile(Path::new("a.apk"), dir.path(), &cancel).unwrap_err();
        assert!(matches!(err, AnalysisError::Cancelled));
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_kills_background_descendants() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");
        let tool = shell(
            "launcher",
            "mkdir -p {output}; (sleep 1; echo late > {output}/late.java) & wait",
            Duration::from_millis(300),
        );
        let err = tool.decompile(Path::new("a.apk"), &out, &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, AnalysisError::Timeout { .. }));

        std::thread::sleep(Duration::from_millis(1500));
        assert!(!out.join("late.java").exists(), "descendant outlived the timeout");
    }

    #[cfg(unix)]
    #[test]
    fn test_cancel_kills_background_descendants() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");
        let tool = shell(
            "launcher",
            "mkdir -p {output}; (sleep 1; echo late > {output}/late.java) & wait",
            Duration::from_secs(60),
        );
        let cancel = CancellationToken::with_timeout(Duration::from_millis(200));
        let err = tool.decompile(Path::new("a.apk"), &out, &cancel).unwrap_err();
        assert!(matches!(err, AnalysisError::Cancelled));

        std::thread::sleep(Duration::from_millis(1500));
        assert!(!out.join("late.java").exists(), "descendant outlived cancellation");
    }
}
