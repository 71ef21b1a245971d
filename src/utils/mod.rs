pub(crate) mod fsx;
pub(crate) mod jwt;

/// Current wall-clock time as epoch milliseconds. All persisted instants
/// (expiry, cooldowns, timestamps) use this unit.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
