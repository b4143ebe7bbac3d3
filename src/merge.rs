//! Combining the SQL trace and the wait log into one file.
//!
//! The output is the SQL trace verbatim, a fixed delimiter block, then the
//! wait log verbatim. Lines are not interleaved by time. A missing input is an
//! empty section.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::TraceError;

const RULE_WIDTH: usize = 70;
const WAIT_SECTION_TITLE: &str = "WAIT EVENTS (from eBPF)";

/// The block written between the two sections.
pub fn delimiter_block() -> String {
    let rule = "=".repeat(RULE_WIDTH);
    format!("{rule}\n{WAIT_SECTION_TITLE}\n{rule}\n\n")
}

/// Default merged output path for a SQL trace file.
pub fn default_output_path(sql_trace: &Path) -> PathBuf {
    let mut name = sql_trace.as_os_str().to_owned();
    name.push(".complete");
    PathBuf::from(name)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeSummary {
    /// Bytes copied from the SQL trace, `None` if it did not exist.
    pub sql_bytes: Option<u64>,
    /// Bytes copied from the wait log, `None` if it did not exist.
    pub wait_bytes: Option<u64>,
}

fn merge_io(path: &Path, source: io::Error) -> TraceError {
    TraceError::MergeIo {
        path: path.to_path_buf(),
        source,
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Copy `path` into `out`. A file that does not exist copies nothing.
fn copy_section<W: Write>(path: &Path, out: &mut W) -> Result<Option<u64>, TraceError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!("{} not found, section left empty", path.display());
            return Ok(None);
        }
        Err(err) => return Err(merge_io(path, err)),
    };
    io::copy(&mut file, out)
        .map(Some)
        .map_err(|err| merge_io(path, err))
}

/// Write `sql_trace`, the delimiter block and `wait_log` to `output`.
///
/// If the wait log cannot be read the SQL section already written is kept in
/// `output` and the error is returned.
pub fn merge(sql_trace: &Path, wait_log: &Path, output: &Path) -> Result<MergeSummary, TraceError> {
    for input in [sql_trace, wait_log] {
        if same_file(input, output) {
            return Err(merge_io(
                output,
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "output path is also a merge input",
                ),
            ));
        }
    }

    let file = File::create(output).map_err(|err| merge_io(output, err))?;
    let mut out = BufWriter::new(file);

    let sql_bytes = copy_section(sql_trace, &mut out)?;
    out.write_all(delimiter_block().as_bytes())
        .map_err(|err| merge_io(output, err))?;

    let wait_bytes = match copy_section(wait_log, &mut out) {
        Ok(bytes) => bytes,
        Err(err) => {
            let _ = out.flush();
            return Err(err);
        }
    };

    out.flush().map_err(|err| merge_io(output, err))?;

    Ok(MergeSummary {
        sql_bytes,
        wait_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    struct Files {
        dir: TempDir,
    }

    impl Files {
        fn new() -> Self {
            Files {
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        fn write(&self, name: &str, contents: &[u8]) -> PathBuf {
            let path = self.path(name);
            fs::write(&path, contents).unwrap();
            path
        }
    }

    #[test]
    fn test_delimiter_block() {
        let block = delimiter_block();
        let lines: Vec<&str> = block.split('\n').collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "=".repeat(70));
        assert_eq!(lines[1], "WAIT EVENTS (from eBPF)");
        assert_eq!(lines[2], "=".repeat(70));
        assert_eq!(lines[3], "");
        assert_eq!(lines[4], "");
    }

    #[test]
    fn test_merge_is_append() {
        let files = Files::new();
        let cases: [(&[u8], &[u8]); 4] = [
            (b"PARSING IN CURSOR #1\nEXEC #1\n", b"WAIT #1: nam='WALWrite' ela=3 us tim=x\n"),
            (b"", b"WAIT [PID 1]: x\n"),
            (b"sql only, no newline", b""),
            (b"", b""),
        ];
        for (sql, waits) in cases {
            let sql_path = files.write("trace.trc", sql);
            let wait_path = files.write("waits.log", waits);
            let out = files.path("trace.trc.complete");

            let summary = merge(&sql_path, &wait_path, &out).unwrap();
            let mut expected = sql.to_vec();
            expected.extend_from_slice(delimiter_block().as_bytes());
            expected.extend_from_slice(waits);
            assert_eq!(fs::read(&out).unwrap(), expected);
            assert_eq!(summary.sql_bytes, Some(sql.len() as u64));
            assert_eq!(summary.wait_bytes, Some(waits.len() as u64));
        }
    }

    #[test]
    fn test_missing_wait_log() {
        let files = Files::new();
        let sql_path = files.write("trace.trc", b"X");
        let out = files.path("out");

        let summary = merge(&sql_path, &files.path("absent.log"), &out).unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap(), format!("X{}", delimiter_block()));
        assert_eq!(summary.wait_bytes, None);
    }

    #[test]
    fn test_missing_sql_trace() {
        let files = Files::new();
        let wait_path = files.write("waits.log", b"W\n");
        let out = files.path("out");

        let summary = merge(&files.path("absent.trc"), &wait_path, &out).unwrap();
        assert_eq!(
            fs::read_to_string(&out).unwrap(),
            format!("{}W\n", delimiter_block())
        );
        assert_eq!(summary.sql_bytes, None);
    }

    #[test]
    fn test_binary_content_is_verbatim() {
        let files = Files::new();
        let sql: Vec<u8> = (0..=255u8).collect();
        let sql_path = files.write("trace.trc", &sql);
        let wait_path = files.write("waits.log", &[0xff, 0x00, 0x0a]);
        let out = files.path("out");

        merge(&sql_path, &wait_path, &out).unwrap();
        let merged = fs::read(&out).unwrap();
        assert_eq!(&merged[..256], sql.as_slice());
        assert_eq!(&merged[merged.len() - 3..], &[0xff, 0x00, 0x0a]);
    }

    #[test]
    fn test_overwrites_previous_output() {
        let files = Files::new();
        let sql_path = files.write("trace.trc", b"new");
        let out = files.write("out", b"old contents that are longer");

        merge(&sql_path, &files.path("absent"), &out).unwrap();
        assert!(fs::read_to_string(&out).unwrap().starts_with("new===="));
    }

    #[test]
    fn test_refuses_to_overwrite_input() {
        let files = Files::new();
        let sql_path = files.write("trace.trc", b"keep me");
        let wait_path = files.write("waits.log", b"");

        let err = merge(&sql_path, &wait_path, &sql_path).unwrap_err();
        assert!(matches!(err, TraceError::MergeIo { .. }));
        assert_eq!(fs::read_to_string(&sql_path).unwrap(), "keep me");
    }

    #[test]
    fn test_unwritable_output() {
        let files = Files::new();
        let sql_path = files.write("trace.trc", b"X");
        let out = files.path("no/such/dir/out");

        let err = merge(&sql_path, &files.path("absent"), &out).unwrap_err();
        match err {
            TraceError::MergeIo { path, .. } => assert_eq!(path, out),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_unreadable_wait_log_keeps_sql_section() {
        let files = Files::new();
        let sql_path = files.write("trace.trc", b"SQL");
        // A directory opens but cannot be read as a file.
        let wait_path = files.path("waits.d");
        fs::create_dir(&wait_path).unwrap();
        let out = files.path("out");

        let err = merge(&sql_path, &wait_path, &out).unwrap_err();
        assert!(matches!(err, TraceError::MergeIo { .. }));
        assert_eq!(
            fs::read_to_string(&out).unwrap(),
            format!("SQL{}", delimiter_block())
        );
    }

    #[test]
    fn test_default_output_path() {
        assert_eq!(
            default_output_path(Path::new("/tmp/pg_trace_123.trc")),
            PathBuf::from("/tmp/pg_trace_123.trc.complete")
        );
    }
}
