use std::time::{SystemTime, UNIX_EPOCH};

/// Get the current time since the epoch in milliseconds.
#[inline]
pub(crate) fn epoch_millis() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .expect("Time went backwards!!! Check system time.")
    .as_millis() as u64
}
