//! One tracing session: start a wait recorder against a backend, let it run
//! until the operator stops it, then merge its wait log after the SQL trace.
//!
//! ```text
//! Init -> Attaching -> Running -> Stopping -> Merging -> Done
//!             |            |
//!             +--> Failed <+
//! ```
//!
//! The recorder runs as a child process (`waittrace record`) in its own
//! process group, so a Ctrl-C at the terminal reaches only the session, which
//! then stops the recorder with SIGINT and waits for it to drain.

use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::TraceError;
use crate::merge::{merge, MergeSummary};
use crate::recorder::RecordSummary;

/// Lines of recorder stderr kept for error reports.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Attaching,
    Running,
    Stopping,
    Merging,
    Done,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Init => "init",
            SessionState::Attaching => "attaching",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Merging => "merging",
            SessionState::Done => "done",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How a recorder finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderExit {
    pub success: bool,
    pub status: String,
    /// The recorder's JSON summary, if it got far enough to print one.
    pub summary: Option<RecordSummary>,
}

/// A running wait recorder.
pub trait WaitRecorder {
    /// `Some` once the recorder has exited. Never blocks.
    fn try_exit(&mut self) -> Result<Option<RecorderExit>>;
    /// Ask the recorder to stop and flush.
    fn interrupt(&mut self) -> Result<()>;
    /// Block until the recorder exits.
    fn wait(&mut self) -> Result<RecorderExit>;
    /// What the recorder reported about itself, for error messages.
    fn diagnostics(&self) -> String;
}

/// Starts wait recorders.
pub trait RecorderLauncher {
    type Recorder: WaitRecorder;

    fn launch(&self, config: &SessionConfig, wait_log: &Path) -> Result<Self::Recorder>;
}

/// Launches `waittrace record` as a child process.
pub struct ProcessLauncher {
    exe: PathBuf,
}

impl ProcessLauncher {
    pub fn new(exe: PathBuf) -> Self {
        ProcessLauncher { exe }
    }

    /// Launch recorders from the currently running binary.
    pub fn current() -> Result<Self> {
        let exe = std::env::current_exe().context("cannot locate the waittrace binary")?;
        Ok(ProcessLauncher::new(exe))
    }

    pub fn command(&self, config: &SessionConfig, wait_log: &Path) -> Command {
        let mut cmd = Command::new(&self.exe);
        cmd.arg("record")
            .arg("--pid")
            .arg(config.pid.to_string())
            .arg("--output")
            .arg(wait_log)
            .arg("--summary-json")
            .args(config.probe.to_args());
        for _ in 0..config.verbosity {
            cmd.arg("-v");
        }
        cmd
    }
}

impl RecorderLauncher for ProcessLauncher {
    type Recorder = RecorderProcess;

    fn launch(&self, config: &SessionConfig, wait_log: &Path) -> Result<RecorderProcess> {
        let mut cmd = self.command(config, wait_log);
        debug!("launching recorder: {:?}", cmd);

        // Own process group: terminal signals go to the session only.
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.exe.display()))?;

        let stdout = child.stdout.take().context("recorder stdout not captured")?;
        let stderr = child.stderr.take().context("recorder stderr not captured")?;

        let stdout_thread = thread::Builder::new()
            .name("recorder_stdout".to_string())
            .spawn(move || read_stdout(stdout))?;

        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        let tail = stderr_tail.clone();
        let stderr_thread = thread::Builder::new()
            .name("recorder_stderr".to_string())
            .spawn(move || read_stderr(stderr, &tail))?;

        Ok(RecorderProcess {
            child,
            stdout_thread: Some(stdout_thread),
            stderr_thread: Some(stderr_thread),
            stderr_tail,
            summary: None,
        })
    }
}

fn read_stdout(stdout: impl Read) -> Vec<String> {
    let mut lines = Vec::new();
    for line in BufReader::new(stdout).lines().map_while(Result::ok) {
        debug!("recorder: {}", line);
        lines.push(line);
    }
    lines
}

fn read_stderr(stderr: impl Read, tail: &Mutex<VecDeque<String>>) {
    for line in BufReader::new(stderr).lines().map_while(Result::ok) {
        debug!("recorder: {}", line);
        let mut tail = tail.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

/// The summary is the last stdout line that parses as one.
pub fn parse_summary(lines: &[String]) -> Option<RecordSummary> {
    lines
        .iter()
        .rev()
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str(line).ok())
}

/// A `waittrace record` child process.
pub struct RecorderProcess {
    child: Child,
    stdout_thread: Option<JoinHandle<Vec<String>>>,
    stderr_thread: Option<JoinHandle<()>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    summary: Option<RecordSummary>,
}

impl RecorderProcess {
    fn finish(&mut self, status: ExitStatus) -> RecorderExit {
        // The pipes close when the child exits, so these return promptly.
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.stdout_thread.take() {
            if let Ok(lines) = handle.join() {
                self.summary = parse_summary(&lines);
            }
        }
        RecorderExit {
            success: status.success(),
            status: status.to_string(),
            summary: self.summary,
        }
    }
}

impl WaitRecorder for RecorderProcess {
    fn try_exit(&mut self) -> Result<Option<RecorderExit>> {
        match self.child.try_wait()? {
            Some(status) => Ok(Some(self.finish(status))),
            None => Ok(None),
        }
    }

    fn interrupt(&mut self) -> Result<()> {
        let pid = Pid::from_raw(self.child.id() as i32);
        match kill(pid, Signal::SIGINT) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(anyhow!("failed to interrupt recorder {}: {}", pid, err)),
        }
    }

    fn wait(&mut self) -> Result<RecorderExit> {
        let status = self.child.wait()?;
        Ok(self.finish(status))
    }

    fn diagnostics(&self) -> String {
        let tail = self
            .stderr_tail
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Reports when a file's size changes.
pub struct FileGrowthWatch {
    path: PathBuf,
    last_size: u64,
}

impl FileGrowthWatch {
    pub fn new(path: &Path) -> Self {
        FileGrowthWatch {
            path: path.to_path_buf(),
            last_size: 0,
        }
    }

    /// The new size if it differs from the last one seen.
    pub fn poll(&mut self) -> Option<u64> {
        let size = fs::metadata(&self.path).ok()?.len();
        if size == self.last_size {
            return None;
        }
        self.last_size = size;
        Some(size)
    }
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub output: PathBuf,
    pub merge: MergeSummary,
    pub recorder: RecorderExit,
}

pub struct TraceSession<L: RecorderLauncher> {
    config: SessionConfig,
    launcher: L,
    wait_log: PathBuf,
    output: PathBuf,
    recorder: Option<L::Recorder>,
    state: SessionState,
}

impl<L: RecorderLauncher> TraceSession<L> {
    pub fn new(config: SessionConfig, launcher: L) -> Self {
        let wait_log = config.wait_log_path();
        let output = config.output_path();
        TraceSession {
            config,
            launcher,
            wait_log,
            output,
            recorder: None,
            state: SessionState::Init,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn wait_log_path(&self) -> &Path {
        &self.wait_log
    }

    pub fn output_path(&self) -> &Path {
        &self.output
    }

    fn expect_state(&self, expected: SessionState) -> Result<()> {
        if self.state != expected {
            bail!("session is {}, expected {}", self.state, expected);
        }
        Ok(())
    }

    fn recorder_exited(&mut self, exit: RecorderExit, diagnostics: String) -> anyhow::Error {
        self.state = SessionState::Failed;
        TraceError::RecorderExited {
            status: exit.status,
            diagnostics,
        }
        .into()
    }

    /// Start the recorder and give it the attach grace period to fail.
    pub fn attach(&mut self) -> Result<()> {
        self.expect_state(SessionState::Init)?;
        if !self.config.sql_trace.exists() {
            return Err(TraceError::MissingSqlTrace {
                path: self.config.sql_trace.clone(),
            }
            .into());
        }

        self.state = SessionState::Attaching;
        info!(
            "starting wait recorder for PID {}, wait log {}",
            self.config.pid,
            self.wait_log.display()
        );
        let mut recorder = match self.launcher.launch(&self.config, &self.wait_log) {
            Ok(recorder) => recorder,
            Err(err) => {
                self.state = SessionState::Failed;
                return Err(TraceError::Attach {
                    pid: self.config.pid,
                    reason: format!("{err:#}"),
                }
                .into());
            }
        };

        thread::sleep(self.config.attach_grace);
        if let Some(exit) = recorder.try_exit()? {
            let diagnostics = recorder.diagnostics();
            return Err(self.recorder_exited(exit, diagnostics));
        }

        self.recorder = Some(recorder);
        self.state = SessionState::Running;
        Ok(())
    }

    /// Run until a stop request arrives on `stop_rx` (or every sender is
    /// gone), reporting SQL trace growth as it goes.
    pub fn run(&mut self, stop_rx: &Receiver<()>) -> Result<()> {
        self.expect_state(SessionState::Running)?;
        let mut watch = FileGrowthWatch::new(&self.config.sql_trace);

        loop {
            match stop_rx.recv_timeout(self.config.poll_interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return Ok(()),
                Err(RecvTimeoutError::Timeout) => {}
            }

            let recorder = self
                .recorder
                .as_mut()
                .context("session is running without a recorder")?;
            if let Some(exit) = recorder.try_exit()? {
                let diagnostics = recorder.diagnostics();
                warn!(
                    "wait recorder exited early, partial wait log kept at {}",
                    self.wait_log.display()
                );
                return Err(self.recorder_exited(exit, diagnostics));
            }

            if let Some(size) = watch.poll() {
                println!("SQL trace size: {} bytes", size);
            }
        }
    }

    /// Interrupt the recorder and wait for it to flush the wait log.
    pub fn stop(&mut self) -> Result<RecorderExit> {
        self.expect_state(SessionState::Running)?;
        self.state = SessionState::Stopping;

        let recorder = self
            .recorder
            .as_mut()
            .context("session is running without a recorder")?;
        recorder.interrupt()?;
        let exit = recorder.wait()?;
        let diagnostics = recorder.diagnostics();
        self.recorder = None;
        if !exit.success {
            // No summary means the recorder never finished its drain, so
            // the wait log is not worth merging.
            if exit.summary.is_none() {
                warn!(
                    "wait recorder failed, partial wait log kept at {}",
                    self.wait_log.display()
                );
                return Err(self.recorder_exited(exit, diagnostics));
            }
            warn!(
                "wait recorder exited with {}, wait log may be incomplete: {}",
                exit.status, diagnostics
            );
        }
        if let Some(summary) = exit.summary {
            info!(
                "recorder wrote {} wait events, {} suppressed, {} unmatched, {} dropped",
                summary.written, summary.suppressed, summary.unmatched, summary.dropped
            );
        }
        Ok(exit)
    }

    /// Merge the wait log after the SQL trace and remove the wait log.
    pub fn merge(&mut self) -> Result<MergeSummary> {
        self.expect_state(SessionState::Stopping)?;
        self.state = SessionState::Merging;

        let summary = merge(&self.config.sql_trace, &self.wait_log, &self.output)?;
        if summary.wait_bytes.is_none() {
            warn!("no wait log at {}", self.wait_log.display());
        }

        if !self.config.keep_wait_log && summary.wait_bytes.is_some() {
            if let Err(err) = fs::remove_file(&self.wait_log) {
                warn!("failed to remove {}: {}", self.wait_log.display(), err);
            }
        }

        self.state = SessionState::Done;
        Ok(summary)
    }
}

/// Drive a session from start to merged output.
pub fn run_session<L: RecorderLauncher>(
    config: SessionConfig,
    launcher: L,
    stop_rx: &Receiver<()>,
) -> Result<SessionReport> {
    let mut session = TraceSession::new(config, launcher);

    session.attach().context("session failed while attaching")?;
    println!(
        "=== Wait recorder attached, wait log {} ===",
        session.wait_log_path().display()
    );
    println!("Press Ctrl-C to stop");

    session.run(stop_rx).context("session failed while running")?;

    println!("Stopping...");
    let recorder = session.stop().context("session failed while stopping")?;

    let merge = session.merge().context("session failed while merging")?;
    println!("Complete trace: {}", session.output_path().display());

    Ok(SessionReport {
        output: session.output_path().to_path_buf(),
        merge,
        recorder,
    })
}
