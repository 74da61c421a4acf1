//! Child processes with a deadline and bounded captured output.

use std::io::Read;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes dropped beyond the capture limit, per stream.
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        self.status.success() && !self.timed_out
    }

    /// stdout then stderr as lossy text, with truncation notes.
    pub fn combined_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            text.push_str(&format!("\n[stdout truncated {} bytes]", self.stdout_truncated));
        }
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        if self.stderr_truncated > 0 {
            text.push_str(&format!("\n[stderr truncated {} bytes]", self.stderr_truncated));
        }
        if self.timed_out {
            text.push_str("\n[timed out]");
        }
        text
    }
}

/// `sh -c <script>` in `workdir`.
pub fn shell(script: &str, workdir: &Path) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script).current_dir(workdir);
    cmd
}

/// Run a command with a timeout, draining stdout/stderr on reader threads so
/// a chatty child cannot deadlock on a full pipe. Bytes past `limit` per
/// stream are counted and discarded.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), limit))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    limit: usize,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    let started = Instant::now();
    let mut child = cmd.spawn().context("spawn command")?;

    if let Some(input) = stdin {
        use std::io::Write;
        let mut pipe = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        pipe.write_all(input).context("write stdin")?;
    }

    let stdout = spawn_reader(child.stdout.take(), limit)?;
    let stderr = spawn_reader(child.stderr.take(), limit)?;

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            child.kill().context("kill command")?;
            (child.wait().context("wait after kill")?, true)
        }
    };

    let (stdout, stdout_truncated) = join_reader(stdout).context("join stdout")?;
    let (stderr, stderr_truncated) = join_reader(stderr).context("join stderr")?;
    let duration = started.elapsed();
    debug!(exit_code = ?status.code(), timed_out, ms = duration.as_millis() as u64, "command finished");

    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        duration,
    })
}

type Reader = JoinHandle<Result<(Vec<u8>, usize)>>;

fn spawn_reader<R: Read + Send + 'static>(stream: Option<R>, limit: usize) -> Result<Reader> {
    let stream = stream.ok_or_else(|| anyhow!("output was not piped"))?;
    Ok(thread::spawn(move || read_limited(stream, limit)))
}

fn join_reader(handle: Reader) -> Result<(Vec<u8>, usize)> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))?
}

fn read_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(kept.len()).min(n);
        kept.extend_from_slice(&chunk[..room]);
        dropped += n - room;
    }
    Ok((kept, dropped))
}
