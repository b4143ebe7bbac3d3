//! The wait recorder: loads the wait timer BPF program, attaches it to one
//! backend and streams wait events into the wait log until interrupted.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::mem::MaybeUninit;
use std::path::{Path, PathBuf};
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use libbpf_rs::skel::{OpenSkel, Skel, SkelBuilder};
use libbpf_rs::{MapCore, MapFlags, MapHandle, UprobeOpts};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RecordConfig;
use crate::correlator::{BpfCursorMap, CursorResolver};
use crate::error::TraceError;
use crate::format::WaitLineFormatter;
use crate::transport::{
    final_drain, open_wait_transport, pump_until_shutdown, DropCounter, ShutdownSignal,
    FINAL_DRAIN_SETTLE, WAIT_QUEUE_CAPACITY,
};
use crate::wait_log::{create_wait_log, run_writer, WaitLogWriter};

mod waittrace {
    include!(concat!(env!("OUT_DIR"), "/waittrace.skel.rs"));
}
use self::waittrace::WaittraceSkelBuilder;

/// Memory lock limit for BPF programs (128 MiB)
const MEMLOCK_RLIMIT_BYTES: u64 = 128 << 20;

// Indexes into the wait_stats per-CPU array.
const WAIT_STAT_EMITTED: u32 = 0;
const WAIT_STAT_SUPPRESSED: u32 = 1;
const WAIT_STAT_UNMATCHED: u32 = 2;

/// What a recorder run saw, printed as JSON for the session to pick up.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSummary {
    /// Events the hooks pushed into the perf buffer.
    pub emitted: u64,
    /// Waits below the noise floor.
    pub suppressed: u64,
    /// Wait ends without a recorded start.
    pub unmatched: u64,
    /// Records lost because the perf buffer or the writer queue was full.
    pub dropped: u64,
    /// Lines written to the wait log.
    pub written: u64,
    /// Records that failed to decode.
    pub decode_errors: u64,
}

/// Bump the memory lock rlimit for BPF programs.
pub fn bump_memlock_rlimit() -> Result<()> {
    let rlimit = libc::rlimit {
        rlim_cur: MEMLOCK_RLIMIT_BYTES,
        rlim_max: MEMLOCK_RLIMIT_BYTES,
    };

    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) } != 0 {
        return Err(anyhow!(
            "Failed to increase RLIMIT_MEMLOCK to {} MiB: {}",
            MEMLOCK_RLIMIT_BYTES >> 20,
            std::io::Error::last_os_error()
        ));
    }

    Ok(())
}

fn attach_error(pid: u32, what: &str, err: impl std::fmt::Display) -> TraceError {
    TraceError::Attach {
        pid,
        reason: format!("{what}: {err}"),
    }
}

fn bpf_attach_error(pid: u32, what: &str, err: libbpf_rs::Error) -> TraceError {
    if err.kind() == libbpf_rs::ErrorKind::PermissionDenied {
        attach_error(pid, what, format!("insufficient privilege ({err})"))
    } else {
        attach_error(pid, what, err)
    }
}

/// The binary the uprobes go on: the override if given, else whatever the
/// target process is executing.
pub fn target_binary(pid: u32, binary: Option<&Path>) -> Result<PathBuf, TraceError> {
    let proc_dir = PathBuf::from(format!("/proc/{pid}"));
    if !proc_dir.exists() {
        return Err(attach_error(pid, "target process", "not found"));
    }

    if let Some(binary) = binary {
        if !binary.exists() {
            return Err(attach_error(
                pid,
                "backend binary",
                format!("{} does not exist", binary.display()),
            ));
        }
        return Ok(binary.to_path_buf());
    }

    let exe = proc_dir.join("exe");
    match fs::read_link(&exe) {
        // The binary was replaced on disk, the magic link still reaches the
        // mapped inode.
        Ok(path) if path.to_string_lossy().ends_with(" (deleted)") => Ok(exe),
        Ok(path) => Ok(path),
        Err(err) => Err(attach_error(
            pid,
            &format!("cannot resolve {}", exe.display()),
            err,
        )),
    }
}

fn sum_percpu_stat<M: MapCore>(map: &M, stat: u32) -> u64 {
    let key = stat.to_ne_bytes();
    match map.lookup_percpu(&key, MapFlags::ANY) {
        Ok(Some(values)) => values
            .iter()
            .filter(|val| val.len() >= 8)
            .map(|val| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&val[..8]);
                u64::from_ne_bytes(bytes)
            })
            .sum(),
        Ok(None) => 0,
        Err(err) => {
            debug!("failed to read wait stat {}: {}", stat, err);
            0
        }
    }
}

/// Record wait events for `config.pid` until SIGINT or SIGTERM.
pub fn record(config: &RecordConfig) -> Result<RecordSummary> {
    // Installed first so a stop request during attach still ends in a drain
    // and a summary rather than the default SIGINT action.
    let shutdown = Arc::new(ShutdownSignal::new()?);
    let handler_shutdown = shutdown.clone();
    ctrlc::set_handler(move || handler_shutdown.signal())
        .context("failed to install signal handler")?;

    let pid = config.pid;
    let probe = &config.probe;
    let binary = target_binary(pid, probe.binary.as_deref())?;
    info!("Using backend binary {}", binary.display());

    bump_memlock_rlimit().map_err(|err| attach_error(pid, "memlock rlimit", err))?;

    let mut skel_builder = WaittraceSkelBuilder::default();
    if config.verbosity > 2 {
        skel_builder.obj_builder.debug(true);
    }

    let mut open_object = MaybeUninit::uninit();
    let mut open_skel = skel_builder
        .open(&mut open_object)
        .map_err(|err| bpf_attach_error(pid, "open BPF object", err))?;
    {
        let rodata = open_skel
            .maps
            .rodata_data
            .as_deref_mut()
            .ok_or_else(|| anyhow!("'rodata' is not mmap'ed, your kernel is too old"))?;
        rodata.target_tgid = pid;
        rodata.noise_floor_ns = probe.noise_floor_ns;
    }

    // Pin the cursor map where the extension can find it. An existing,
    // compatible pinned map is reused by libbpf.
    let mut pin_path = probe.cursor_pin.resolve(pid);
    if let Some(path) = pin_path.as_ref() {
        if path.parent().is_some_and(|dir| dir.is_dir()) {
            open_skel
                .maps
                .pid_to_cursor
                .set_pin_path(path)
                .with_context(|| format!("failed to set pin path {}", path.display()))?;
        } else {
            warn!(
                "cannot pin cursor map at {} (is bpffs mounted?), waits will not carry cursors",
                path.display()
            );
            pin_path = None;
        }
    }
    let created_pin = pin_path.as_ref().filter(|path| !path.exists()).cloned();

    let mut skel = open_skel
        .load()
        .map_err(|err| bpf_attach_error(pid, "load BPF program", err))?;

    let _start_link = skel
        .progs
        .wait_start
        .attach_uprobe_with_opts(
            pid as i32,
            &binary,
            0,
            UprobeOpts {
                func_name: Some(probe.start_symbol.clone()),
                ..Default::default()
            },
        )
        .map_err(|err| {
            bpf_attach_error(
                pid,
                &format!("uprobe on {} in {}", probe.start_symbol, binary.display()),
                err,
            )
        })?;
    let _end_link = skel
        .progs
        .wait_end
        .attach_uprobe_with_opts(
            pid as i32,
            &binary,
            0,
            UprobeOpts {
                func_name: Some(probe.end_symbol.clone()),
                ..Default::default()
            },
        )
        .map_err(|err| {
            bpf_attach_error(
                pid,
                &format!("uprobe on {} in {}", probe.end_symbol, binary.display()),
                err,
            )
        })?;
    info!("Attached to {}/{}", probe.start_symbol, probe.end_symbol);

    let cursors = BpfCursorMap::new(
        MapHandle::try_from(&skel.maps.pid_to_cursor)
            .context("Failed to get handle to BPF cursor map")?,
    );
    match (&pin_path, cursors.resolve(pid)) {
        (Some(path), Some(cursor)) => info!(
            "Cursor map {} already has cursor #{} for PID {}",
            path.display(),
            cursor,
            pid
        ),
        (Some(path), None) => info!("Cursor map pinned at {}", path.display()),
        (None, _) => {}
    }

    let formatter = WaitLineFormatter::new(probe.timestamps);
    let log_name = match &config.output {
        Some(path) => path.display().to_string(),
        None => "<stdout>".to_string(),
    };
    let out: Box<dyn Write + Send> = match &config.output {
        Some(path) => Box::new(
            create_wait_log(path)
                .with_context(|| format!("failed to create wait log {}", path.display()))?,
        ),
        None => Box::new(io::stdout()),
    };
    let mut writer = WaitLogWriter::new(out, formatter);

    let (tx, rx) = sync_channel(WAIT_QUEUE_CAPACITY);
    let writer_shutdown = shutdown.clone();
    let writer_thread = thread::Builder::new()
        .name("wait_log_writer".to_string())
        .spawn(move || run_writer(rx, &mut writer, &writer_shutdown))?;

    let drops = DropCounter::default();
    let perf = open_wait_transport(&skel.maps.wait_events, probe.perf_pages, tx, drops.clone())
        .context("failed to open wait event perf buffer")?;

    let on_stderr = config.output.is_none();
    if shutdown.is_signalled() {
        info!("stop requested while attaching");
    } else {
        status(on_stderr, format_args!("=== Tracing wait events for PID {} ===", pid));
        status(on_stderr, format_args!("Press Ctrl-C to stop"));
    }

    pump_until_shutdown(&perf, &shutdown)?;

    status(on_stderr, format_args!("Stopping..."));
    if let Some(data) = skel.maps.data_data.as_deref_mut() {
        data.tracing_enabled = 0;
    }
    final_drain(&perf, FINAL_DRAIN_SETTLE).context("failed to drain wait event perf buffer")?;
    drop(perf);

    let writer_result = writer_thread.join();

    if let Some(path) = created_pin {
        if let Err(err) = fs::remove_file(&path) {
            warn!("failed to unpin cursor map {}: {}", path.display(), err);
        }
    }

    let stats = writer_result
        .map_err(|_| anyhow!("wait log writer panicked"))?
        .with_context(|| format!("failed to write wait log {}", log_name))?;

    let summary = RecordSummary {
        emitted: sum_percpu_stat(&skel.maps.wait_stats, WAIT_STAT_EMITTED),
        suppressed: sum_percpu_stat(&skel.maps.wait_stats, WAIT_STAT_SUPPRESSED),
        unmatched: sum_percpu_stat(&skel.maps.wait_stats, WAIT_STAT_UNMATCHED),
        dropped: drops.get(),
        written: stats.written,
        decode_errors: stats.decode_errors,
    };

    status(on_stderr, format_args!("=== Trace stopped ==="));
    status(on_stderr, format_args!("Wait events written: {}", summary.written));
    status(on_stderr, format_args!("Missed wait events: {}", summary.dropped));
    if summary.dropped > 0 {
        warn!(
            "{} wait events were dropped, consider a larger --perf-pages or a faster disk",
            summary.dropped
        );
    }
    if config.summary_json {
        let line = serde_json::to_string(&summary)?;
        status(on_stderr, format_args!("{}", line));
    }

    Ok(summary)
}

/// Status lines move to stderr when the wait log itself is on stdout.
fn status(on_stderr: bool, line: fmt::Arguments<'_>) {
    if on_stderr {
        eprintln!("{}", line);
    } else {
        println!("{}", line);
    }
}
