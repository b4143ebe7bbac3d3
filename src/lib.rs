//! waittrace library - wait event tracing for PostgreSQL backends.
//!
//! A pair of uprobes on the backend's wait start/end hooks time every wait
//! in the kernel, tag it with the SQL cursor the backend is executing and
//! stream it to user space, where it is written as a text wait log and
//! appended to the extension's SQL trace file.
//!
//! # Modules
//!
//! - [`record`] - The binary wait record shared with the BPF program
//! - [`wait_names`] - Wait class codes to names
//! - [`format`] - Wait log lines
//! - [`correlator`] - Backend PID to cursor lookup
//! - [`transport`] - Perf buffer plumbing
//! - [`recorder`] - The `record` command runtime
//! - [`session`] - The `session` command state machine
//! - [`merge`] - SQL trace and wait log merging
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! // Append a wait log after a SQL trace.
//! waittrace::merge::merge(
//!     Path::new("/tmp/pg_trace_1234.trc"),
//!     Path::new("/tmp/pg_trace_waits_1234.log"),
//!     Path::new("/tmp/pg_trace_1234.trc.complete"),
//! )
//! .expect("Failed to merge traces");
//! ```

// Record handling
pub mod clock;
pub mod format;
pub mod record;
pub mod wait_log;
pub mod wait_names;

// Tracing runtime
pub mod config;
pub mod correlator;
pub mod error;
pub mod merge;
pub mod recorder;
pub mod session;
pub mod transport;

#[cfg(test)]
mod wait_timer;

// Re-export for convenience
pub use config::{ProbeOptions, RecordConfig, SessionConfig};
pub use error::{exit_code_for, TraceError};
pub use record::WaitEvent;
pub use recorder::{bump_memlock_rlimit, record as record_waits, RecordSummary};
pub use session::{run_session, ProcessLauncher, SessionState, TraceSession};
