//! Runtime configuration for the recorder and the session, separated from
//! CLI parsing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::correlator::default_cursor_pin_path;
use crate::format::TimestampMode;

/// Symbol hit when a backend starts waiting.
pub const DEFAULT_START_SYMBOL: &str = "pgstat_report_wait_start";
/// Symbol hit when a backend stops waiting.
pub const DEFAULT_END_SYMBOL: &str = "pgstat_report_wait_end";
/// Waits shorter than this are not reported.
pub const DEFAULT_NOISE_FLOOR_NS: u64 = 1000;
/// Perf buffer pages per CPU.
pub const DEFAULT_PERF_PAGES: usize = 64;
/// How long the recorder gets to attach before the session checks on it.
pub const DEFAULT_ATTACH_GRACE: Duration = Duration::from_secs(2);
/// How often the session reports SQL trace growth.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Where the cursor map is exposed to the extension.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CursorPin {
    /// `/sys/fs/bpf/pg_trace_cursor_<pid>`.
    #[default]
    Default,
    Path(PathBuf),
    Disabled,
}

impl CursorPin {
    pub fn resolve(&self, pid: u32) -> Option<PathBuf> {
        match self {
            CursorPin::Default => Some(default_cursor_pin_path(pid)),
            CursorPin::Path(path) => Some(path.clone()),
            CursorPin::Disabled => None,
        }
    }
}

/// How the probes are attached and how records are rendered. Shared between
/// the session and the recorder process it launches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOptions {
    /// Backend binary; `/proc/<pid>/exe` when unset.
    pub binary: Option<PathBuf>,
    pub start_symbol: String,
    pub end_symbol: String,
    pub noise_floor_ns: u64,
    /// Must be a power of two.
    pub perf_pages: usize,
    pub cursor_pin: CursorPin,
    pub timestamps: TimestampMode,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        ProbeOptions {
            binary: None,
            start_symbol: DEFAULT_START_SYMBOL.to_string(),
            end_symbol: DEFAULT_END_SYMBOL.to_string(),
            noise_floor_ns: DEFAULT_NOISE_FLOOR_NS,
            perf_pages: DEFAULT_PERF_PAGES,
            cursor_pin: CursorPin::Default,
            timestamps: TimestampMode::DecodeTime,
        }
    }
}

impl ProbeOptions {
    /// Command line arguments that reproduce these options for `waittrace record`.
    pub fn to_args(&self) -> Vec<String> {
        let defaults = ProbeOptions::default();
        let mut args = Vec::new();
        if let Some(binary) = &self.binary {
            args.push("--binary".to_string());
            args.push(binary.display().to_string());
        }
        if self.start_symbol != defaults.start_symbol {
            args.push("--start-symbol".to_string());
            args.push(self.start_symbol.clone());
        }
        if self.end_symbol != defaults.end_symbol {
            args.push("--end-symbol".to_string());
            args.push(self.end_symbol.clone());
        }
        if self.noise_floor_ns != defaults.noise_floor_ns {
            args.push("--noise-floor-ns".to_string());
            args.push(self.noise_floor_ns.to_string());
        }
        if self.perf_pages != defaults.perf_pages {
            args.push("--perf-pages".to_string());
            args.push(self.perf_pages.to_string());
        }
        match &self.cursor_pin {
            CursorPin::Default => {}
            CursorPin::Path(path) => {
                args.push("--cursor-map-pin".to_string());
                args.push(path.display().to_string());
            }
            CursorPin::Disabled => args.push("--no-cursor-map-pin".to_string()),
        }
        if self.timestamps == TimestampMode::Kernel {
            args.push("--kernel-timestamps".to_string());
        }
        args
    }
}

/// Options for one `waittrace record` run.
#[derive(Debug, Clone)]
pub struct RecordConfig {
    pub pid: u32,
    /// Wait log to write; stdout when unset.
    pub output: Option<PathBuf>,
    pub probe: ProbeOptions,
    /// Print a JSON summary line on stdout when done.
    pub summary_json: bool,
    pub verbosity: u8,
}

/// Options for one `waittrace session` run.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub pid: u32,
    /// Trace file written by the extension.
    pub sql_trace: PathBuf,
    /// Merged output; `<sql_trace>.complete` when unset.
    pub output: Option<PathBuf>,
    /// Directory for the intermediate wait log; the temp dir when unset.
    pub wait_log_dir: Option<PathBuf>,
    pub attach_grace: Duration,
    pub poll_interval: Duration,
    pub keep_wait_log: bool,
    pub probe: ProbeOptions,
    pub verbosity: u8,
}

impl SessionConfig {
    pub fn new(pid: u32, sql_trace: PathBuf) -> Self {
        SessionConfig {
            pid,
            sql_trace,
            output: None,
            wait_log_dir: None,
            attach_grace: DEFAULT_ATTACH_GRACE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            keep_wait_log: false,
            probe: ProbeOptions::default(),
            verbosity: 0,
        }
    }

    /// The wait log path, a function of the target pid only.
    pub fn wait_log_path(&self) -> PathBuf {
        let dir = self
            .wait_log_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        wait_log_path_in(&dir, self.pid)
    }

    pub fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| crate::merge::default_output_path(&self.sql_trace))
    }
}

pub fn wait_log_path_in(dir: &Path, pid: u32) -> PathBuf {
    dir.join(format!("pg_trace_waits_{pid}.log"))
}
