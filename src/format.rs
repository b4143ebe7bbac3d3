//! 10046-style rendering of wait events.

use chrono::{DateTime, Local};

use crate::clock::ClockAnchor;
use crate::record::WaitEvent;
use crate::wait_names::wait_event_name;

const TIM_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Where the `tim=` value of a wait line comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampMode {
    /// Wall clock at the moment the record is decoded.
    #[default]
    DecodeTime,
    /// The kernel timestamp of the wait end, mapped to wall clock through an
    /// anchor taken when recording started.
    Kernel,
}

/// Render one wait line for `event` with the given `tim=` value.
pub fn format_line(event: &WaitEvent, tim: &DateTime<Local>) -> String {
    let name = wait_event_name(event.wait_class_code);
    let tim = tim.format(TIM_FORMAT);
    if event.has_cursor() {
        format!(
            "WAIT #{}: nam='{}' ela={} us tim={}",
            event.cursor_id,
            name,
            event.duration_us(),
            tim
        )
    } else {
        format!(
            "WAIT [PID {}]: nam='{}' ela={} us tim={}",
            event.pid,
            name,
            event.duration_us(),
            tim
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WaitLineFormatter {
    mode: TimestampMode,
    anchor: ClockAnchor,
}

impl WaitLineFormatter {
    pub fn new(mode: TimestampMode) -> Self {
        Self::with_anchor(mode, ClockAnchor::capture())
    }

    pub fn with_anchor(mode: TimestampMode, anchor: ClockAnchor) -> Self {
        WaitLineFormatter { mode, anchor }
    }

    pub fn timestamp_for(&self, event: &WaitEvent) -> DateTime<Local> {
        match self.mode {
            TimestampMode::DecodeTime => Local::now(),
            TimestampMode::Kernel => self.anchor.wall_clock(event.timestamp_ns),
        }
    }

    pub fn format(&self, event: &WaitEvent) -> String {
        format_line(event, &self.timestamp_for(event))
    }
}
