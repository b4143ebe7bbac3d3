//! Fatal error kinds surfaced to the operator.
//!
//! Recoverable conditions are not represented here: lost perf records are
//! counted by [`crate::transport::DropCounter`] and malformed records are
//! reported as [`crate::record::DecodeError`] and skipped.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Process exit code for errors that are not a [`TraceError`].
pub const EXIT_FAILURE: i32 = 1;
/// Process exit code when the probes could not be attached or the recorder died.
pub const EXIT_ATTACH: i32 = 2;
/// Process exit code when the SQL trace file does not exist at session start.
pub const EXIT_MISSING_SQL_TRACE: i32 = 3;
/// Process exit code when the merge could not read or write a file.
pub const EXIT_MERGE_IO: i32 = 4;

#[derive(Debug)]
pub enum TraceError {
    /// The probes could not be attached to the target backend.
    Attach { pid: u32, reason: String },
    /// The wait recorder process exited on its own.
    RecorderExited { status: String, diagnostics: String },
    /// The SQL trace file must exist before a session starts.
    MissingSqlTrace { path: PathBuf },
    /// Reading or writing a file during the merge failed.
    MergeIo { path: PathBuf, source: io::Error },
}

impl TraceError {
    pub fn exit_code(&self) -> i32 {
        match self {
            TraceError::Attach { .. } | TraceError::RecorderExited { .. } => EXIT_ATTACH,
            TraceError::MissingSqlTrace { .. } => EXIT_MISSING_SQL_TRACE,
            TraceError::MergeIo { .. } => EXIT_MERGE_IO,
        }
    }
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceError::Attach { pid, reason } => {
                write!(f, "failed to attach to PID {pid}: {reason}")
            }
            TraceError::RecorderExited {
                status,
                diagnostics,
            } => {
                write!(f, "wait recorder exited ({status})")?;
                let diagnostics = diagnostics.trim();
                if !diagnostics.is_empty() {
                    write!(f, ":\n{diagnostics}")?;
                }
                Ok(())
            }
            TraceError::MissingSqlTrace { path } => {
                write!(
                    f,
                    "trace file not found: {} (has the extension started tracing?)",
                    path.display()
                )
            }
            TraceError::MergeIo { path, .. } => {
                write!(f, "merge failed on {}", path.display())
            }
        }
    }
}

impl std::error::Error for TraceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TraceError::MergeIo { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Map an error chain to the process exit code.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<TraceError>())
        .map(TraceError::exit_code)
        .unwrap_or(EXIT_FAILURE)
}
