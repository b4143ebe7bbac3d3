//! Decoding transported records and appending them to the wait log.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::mpsc::Receiver;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::format::WaitLineFormatter;
use crate::record::{decode, WaitEvent};
use crate::transport::ShutdownSignal;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterStats {
    pub written: u64,
    pub decode_errors: u64,
}

/// Writes one line per wait event and flushes after each, so the log can be
/// followed while the session runs.
pub struct WaitLogWriter<W: Write> {
    out: W,
    formatter: WaitLineFormatter,
    stats: WriterStats,
}

/// Create (or truncate) the wait log file at `path`.
pub fn create_wait_log(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
}

impl WaitLogWriter<File> {
    pub fn create(path: &Path, formatter: WaitLineFormatter) -> io::Result<Self> {
        Ok(WaitLogWriter::new(create_wait_log(path)?, formatter))
    }
}

impl<W: Write> WaitLogWriter<W> {
    pub fn new(out: W, formatter: WaitLineFormatter) -> Self {
        WaitLogWriter {
            out,
            formatter,
            stats: WriterStats::default(),
        }
    }

    pub fn write_event(&mut self, event: &WaitEvent) -> io::Result<()> {
        let line = self.formatter.format(event);
        writeln!(self.out, "{line}")?;
        self.out.flush()?;
        self.stats.written += 1;
        Ok(())
    }

    /// Decode and write one raw record. Malformed records are skipped.
    pub fn handle_record(&mut self, data: &[u8]) -> io::Result<()> {
        match decode(data) {
            Ok(event) => self.write_event(&event),
            Err(err) => {
                self.stats.decode_errors += 1;
                warn!("skipping wait record: {}", err);
                Ok(())
            }
        }
    }

    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Write every record received on `rx` until all senders are gone.
pub fn drain_records<W: Write>(
    rx: Receiver<Vec<u8>>,
    writer: &mut WaitLogWriter<W>,
) -> io::Result<WriterStats> {
    while let Ok(data) = rx.recv() {
        writer.handle_record(&data)?;
    }
    Ok(writer.stats())
}

/// The writer thread body. A write error stops the whole recorder through
/// `shutdown` instead of silently discarding everything after it.
pub fn run_writer<W: Write>(
    rx: Receiver<Vec<u8>>,
    writer: &mut WaitLogWriter<W>,
    shutdown: &ShutdownSignal,
) -> io::Result<WriterStats> {
    let res = drain_records(rx, writer);
    if let Err(err) = &res {
        error!("wait log write failed, stopping: {}", err);
        shutdown.signal();
    }
    res
}
