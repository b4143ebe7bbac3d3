use std::borrow::Cow;

/// Wait event codes the formatter knows by name, as reported in
/// `wait_event_info` by the backend.
const WAIT_EVENT_NAMES: &[(u32, &str)] = &[
    (0x0100_0001, "LockManager"),
    (0x0200_0001, "BufferPin"),
    (0x0300_0001, "ActivityMain"),
    (0x0300_0002, "ActivityAutovacuum"),
    (0x0400_0001, "ClientRead"),
    (0x0400_0002, "ClientWrite"),
    (0x0500_0001, "DataFileRead"),
    (0x0500_0002, "DataFileWrite"),
    (0x0500_0003, "DataFileExtend"),
    (0x0500_0004, "DataFileFlush"),
    (0x0500_0005, "DataFileSync"),
    (0x0500_0006, "WALWrite"),
    (0x0500_0007, "WALSync"),
    (0x0600_0001, "MessageQueueSend"),
    (0x0600_0002, "MessageQueueReceive"),
];

/// Resolve a wait class code to its display name.
///
/// Unknown codes render as `Unknown:0x` followed by the code as eight
/// zero-padded hex digits.
pub fn wait_event_name(code: u32) -> Cow<'static, str> {
    match WAIT_EVENT_NAMES.iter().find(|(known, _)| *known == code) {
        Some((_, name)) => Cow::Borrowed(*name),
        None => Cow::Owned(format!("Unknown:0x{code:08x}")),
    }
}
