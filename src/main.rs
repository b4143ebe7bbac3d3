//! waittrace: attribute PostgreSQL backend wait events to SQL cursors.

use std::path::PathBuf;
use std::process;
use std::sync::mpsc::channel;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use waittrace::config::{
    CursorPin, ProbeOptions, RecordConfig, SessionConfig, DEFAULT_END_SYMBOL,
    DEFAULT_NOISE_FLOOR_NS, DEFAULT_PERF_PAGES, DEFAULT_START_SYMBOL,
};
use waittrace::format::TimestampMode;
use waittrace::merge::{default_output_path, merge};
use waittrace::{exit_code_for, record_waits, run_session, ProcessLauncher};

#[derive(Parser)]
#[command(name = "waittrace")]
#[command(about = "Trace PostgreSQL backend wait events and attach them to SQL traces")]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Trace one backend and merge its waits into the SQL trace
    Session {
        /// PID of the backend to trace
        #[arg(short, long)]
        pid: u32,

        /// SQL trace file written by the extension
        #[arg(short = 'f', long)]
        sql_trace: PathBuf,

        /// Merged output file [default: <SQL_TRACE>.complete]
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Seconds to let the recorder attach before checking on it
        #[arg(long, default_value_t = 2)]
        grace_secs: u64,

        /// How often to report SQL trace growth, in milliseconds
        #[arg(long, default_value_t = 1000)]
        poll_interval_ms: u64,

        /// Directory for the intermediate wait log [default: temp dir]
        #[arg(long)]
        wait_log_dir: Option<PathBuf>,

        /// Keep the intermediate wait log after merging
        #[arg(long)]
        keep_wait_log: bool,

        #[command(flatten)]
        probe: ProbeArgs,
    },
    /// Record wait events for one backend into a wait log until interrupted
    Record {
        /// PID of the backend to trace
        #[arg(short, long)]
        pid: u32,

        /// Wait log to write [default: stdout]
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print a JSON summary line when done
        #[arg(long, hide = true)]
        summary_json: bool,

        #[command(flatten)]
        probe: ProbeArgs,
    },
    /// Append a wait log to a SQL trace
    Merge {
        /// SQL trace file
        #[arg(long)]
        sql_trace: PathBuf,

        /// Wait log file
        #[arg(long)]
        wait_log: PathBuf,

        /// Merged output file [default: <SQL_TRACE>.complete]
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
struct ProbeArgs {
    /// Backend binary to probe [default: /proc/<PID>/exe]
    #[arg(long)]
    binary: Option<PathBuf>,

    /// Symbol called when a backend starts waiting
    #[arg(long, default_value = DEFAULT_START_SYMBOL)]
    start_symbol: String,

    /// Symbol called when a backend stops waiting
    #[arg(long, default_value = DEFAULT_END_SYMBOL)]
    end_symbol: String,

    /// Waits shorter than this are not reported
    #[arg(long, default_value_t = DEFAULT_NOISE_FLOOR_NS)]
    noise_floor_ns: u64,

    /// Perf buffer pages per CPU (power of two)
    #[arg(long, default_value_t = DEFAULT_PERF_PAGES, value_parser = parse_pages)]
    perf_pages: usize,

    /// Pin the cursor map here [default: /sys/fs/bpf/pg_trace_cursor_<PID>]
    #[arg(long, conflicts_with = "no_cursor_map_pin")]
    cursor_map_pin: Option<PathBuf>,

    /// Do not pin the cursor map; waits are reported by PID only
    #[arg(long)]
    no_cursor_map_pin: bool,

    /// Stamp waits with the kernel time of the wait end instead of decode time
    #[arg(long)]
    kernel_timestamps: bool,
}

impl From<ProbeArgs> for ProbeOptions {
    fn from(args: ProbeArgs) -> Self {
        let cursor_pin = match (args.cursor_map_pin, args.no_cursor_map_pin) {
            (_, true) => CursorPin::Disabled,
            (Some(path), false) => CursorPin::Path(path),
            (None, false) => CursorPin::Default,
        };
        let timestamps = if args.kernel_timestamps {
            TimestampMode::Kernel
        } else {
            TimestampMode::DecodeTime
        };
        ProbeOptions {
            binary: args.binary,
            start_symbol: args.start_symbol,
            end_symbol: args.end_symbol,
            noise_floor_ns: args.noise_floor_ns,
            perf_pages: args.perf_pages,
            cursor_pin,
            timestamps,
        }
    }
}

fn parse_pages(s: &str) -> Result<usize, String> {
    let pages: usize = s.parse().map_err(|err| format!("{err}"))?;
    if pages == 0 || !pages.is_power_of_two() {
        return Err(format!("{pages} is not a power of two"));
    }
    Ok(pages)
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let verbosity = cli.verbose;
    match cli.command {
        Commands::Session {
            pid,
            sql_trace,
            output,
            grace_secs,
            poll_interval_ms,
            wait_log_dir,
            keep_wait_log,
            probe,
        } => {
            let mut config = SessionConfig::new(pid, sql_trace);
            config.output = output;
            config.attach_grace = Duration::from_secs(grace_secs);
            config.poll_interval = Duration::from_millis(poll_interval_ms);
            config.wait_log_dir = wait_log_dir;
            config.keep_wait_log = keep_wait_log;
            config.probe = probe.into();
            config.verbosity = verbosity;

            let (stop_tx, stop_rx) = channel();
            ctrlc::set_handler(move || {
                let _ = stop_tx.send(());
            })
            .context("failed to install signal handler")?;

            let report = run_session(config, ProcessLauncher::current()?, &stop_rx)?;
            if let Some(summary) = report.recorder.summary {
                println!("Wait events: {}", summary.written);
                println!("Missed wait events: {}", summary.dropped);
            }
            Ok(())
        }
        Commands::Record {
            pid,
            output,
            summary_json,
            probe,
        } => {
            let config = RecordConfig {
                pid,
                output,
                probe: probe.into(),
                summary_json,
                verbosity,
            };
            record_waits(&config)?;
            Ok(())
        }
        Commands::Merge {
            sql_trace,
            wait_log,
            output,
        } => {
            let output = output.unwrap_or_else(|| default_output_path(&sql_trace));
            let summary = merge(&sql_trace, &wait_log, &output)?;
            if summary.sql_bytes.is_none() {
                eprintln!("warning: {} not found", sql_trace.display());
            }
            if summary.wait_bytes.is_none() {
                eprintln!("warning: {} not found", wait_log.display());
            }
            println!("Complete trace: {}", output.display());
            Ok(())
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(err) = run(cli) {
        eprintln!("Error: {err:#}");
        process::exit(exit_code_for(&err));
    }
}
