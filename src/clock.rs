use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock seconds since the Unix epoch, fractional.
pub(crate) fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
