//! Wall-clock helpers.

/// Current Unix time in milliseconds.
///
/// Peer `last_seen` stamps and transfer start/end times all use this scale.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
