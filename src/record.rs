//! The binary wait record shared with the BPF program.
//!
//! Layout (version 1, little-endian, 104 bytes):
//!
//! ```text
//! 0   u64  timestamp_ns
//! 8   u32  pid
//! 12  u32  tid
//! 16  u64  cursor_id
//! 24  u32  wait_class_code
//! 28  u32  version
//! 32  u64  duration_ns
//! 40  [u8; 64] reserved name buffer
//! ```
//!
//! Perf samples are padded to 8 bytes by the kernel, so a sample may be longer
//! than the record. Trailing bytes are ignored, short samples are rejected.

use std::fmt;

pub const WAIT_RECORD_VERSION: u32 = 1;
pub const WAIT_NAME_LEN: usize = 64;
pub const WAIT_RECORD_SIZE: usize = 40 + WAIT_NAME_LEN;

const TIMESTAMP_OFFSET: usize = 0;
const PID_OFFSET: usize = 8;
const TID_OFFSET: usize = 12;
const CURSOR_OFFSET: usize = 16;
const CLASS_OFFSET: usize = 24;
const VERSION_OFFSET: usize = 28;
const DURATION_OFFSET: usize = 32;
const NAME_OFFSET: usize = 40;

/// One completed wait, as measured by the wait timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WaitEvent {
    /// Kernel monotonic time at wait end.
    pub timestamp_ns: u64,
    pub pid: u32,
    pub tid: u32,
    /// 0 when no cursor was published for the process.
    pub cursor_id: u64,
    pub wait_class_code: u32,
    pub duration_ns: u64,
}

impl WaitEvent {
    pub fn has_cursor(&self) -> bool {
        self.cursor_id > 0
    }

    pub fn duration_us(&self) -> u64 {
        self.duration_ns / 1000
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The sample is shorter than a wait record.
    Truncated { len: usize },
    /// The producer wrote a layout this decoder does not know.
    UnsupportedVersion { version: u32 },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated { len } => {
                write!(
                    f,
                    "wait record truncated: got {len} bytes, need {WAIT_RECORD_SIZE}"
                )
            }
            DecodeError::UnsupportedVersion { version } => {
                write!(
                    f,
                    "unsupported wait record version {version} (expected {WAIT_RECORD_VERSION})"
                )
            }
        }
    }
}

impl std::error::Error for DecodeError {}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

/// Decode one perf sample into a [`WaitEvent`].
pub fn decode(data: &[u8]) -> Result<WaitEvent, DecodeError> {
    if data.len() < WAIT_RECORD_SIZE {
        return Err(DecodeError::Truncated { len: data.len() });
    }

    let version = read_u32(data, VERSION_OFFSET);
    if version != WAIT_RECORD_VERSION {
        return Err(DecodeError::UnsupportedVersion { version });
    }

    Ok(WaitEvent {
        timestamp_ns: read_u64(data, TIMESTAMP_OFFSET),
        pid: read_u32(data, PID_OFFSET),
        tid: read_u32(data, TID_OFFSET),
        cursor_id: read_u64(data, CURSOR_OFFSET),
        wait_class_code: read_u32(data, CLASS_OFFSET),
        duration_ns: read_u64(data, DURATION_OFFSET),
    })
}

/// Encode an event in the layout the BPF program emits. The name buffer is
/// left zeroed.
pub fn encode(event: &WaitEvent) -> [u8; WAIT_RECORD_SIZE] {
    let mut buf = [0u8; WAIT_RECORD_SIZE];
    buf[TIMESTAMP_OFFSET..PID_OFFSET].copy_from_slice(&event.timestamp_ns.to_le_bytes());
    buf[PID_OFFSET..TID_OFFSET].copy_from_slice(&event.pid.to_le_bytes());
    buf[TID_OFFSET..CURSOR_OFFSET].copy_from_slice(&event.tid.to_le_bytes());
    buf[CURSOR_OFFSET..CLASS_OFFSET].copy_from_slice(&event.cursor_id.to_le_bytes());
    buf[CLASS_OFFSET..VERSION_OFFSET].copy_from_slice(&event.wait_class_code.to_le_bytes());
    buf[VERSION_OFFSET..DURATION_OFFSET].copy_from_slice(&WAIT_RECORD_VERSION.to_le_bytes());
    buf[DURATION_OFFSET..NAME_OFFSET].copy_from_slice(&event.duration_ns.to_le_bytes());
    buf
}
