//! Process to cursor correlation.
//!
//! The extension publishes the cursor it is currently executing for each
//! backend in the `pid_to_cursor` BPF map. The wait timer only ever reads it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use libbpf_rs::{MapCore, MapFlags, MapHandle};
use tracing::debug;

/// Directory the cursor map is pinned under by default.
pub const BPFFS_DIR: &str = "/sys/fs/bpf";

/// Read-only lookup of the cursor a process is executing.
pub trait CursorResolver {
    fn resolve(&self, pid: u32) -> Option<u64>;
}

impl<T: CursorResolver + ?Sized> CursorResolver for &T {
    fn resolve(&self, pid: u32) -> Option<u64> {
        (**self).resolve(pid)
    }
}

impl CursorResolver for HashMap<u32, u64> {
    fn resolve(&self, pid: u32) -> Option<u64> {
        self.get(&pid).copied()
    }
}

/// Resolver for sessions where the extension never publishes cursors.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCursors;

impl CursorResolver for NoCursors {
    fn resolve(&self, _pid: u32) -> Option<u64> {
        None
    }
}

/// Default bpffs path the cursor map for `pid` is pinned at.
pub fn default_cursor_pin_path(pid: u32) -> PathBuf {
    Path::new(BPFFS_DIR).join(format!("pg_trace_cursor_{pid}"))
}

/// User-space view of the `pid_to_cursor` map.
pub struct BpfCursorMap {
    map: MapHandle,
}

impl BpfCursorMap {
    pub fn new(map: MapHandle) -> Self {
        BpfCursorMap { map }
    }
}

impl CursorResolver for BpfCursorMap {
    fn resolve(&self, pid: u32) -> Option<u64> {
        match self.map.lookup(&pid.to_ne_bytes(), MapFlags::ANY) {
            Ok(Some(value)) if value.len() >= 8 => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&value[..8]);
                Some(u64::from_ne_bytes(bytes)).filter(|cursor| *cursor != 0)
            }
            Ok(_) => None,
            Err(err) => {
                debug!("cursor lookup for pid {} failed: {}", pid, err);
                None
            }
        }
    }
}
