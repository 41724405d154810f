//! Low-power delivery deadline model.
//!
//! Satellite modems sleep between fixed wake windows. When the network tells us
//! when the message will actually be sent, the delivery wait tracks that time;
//! otherwise it falls back to the configured base timeout. Both get a grace
//! period that grows with payload size.

use crate::config::DeliveryDeadlineConfig;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::time::Duration;
use tracing::debug;

/// Extra delivery time for a payload of `size_bytes`
pub fn grace_time(config: &DeliveryDeadlineConfig, size_bytes: Option<usize>) -> Duration {
    let mut grace = config.grace_seconds;
    if let Some(size) = size_bytes {
        if size > config.size_threshold_bytes && config.size_block_bytes > 0 {
            let excess = size - config.size_threshold_bytes;
            let blocks = excess.div_ceil(config.size_block_bytes) as u64;
            grace = grace.saturating_add(blocks.saturating_mul(config.grace_increment_seconds));
        }
    }
    Duration::from_secs(grace)
}

/// Parse a network-provided scheduled send time.
///
/// Accepts RFC 3339 and the network's `YYYY-MM-DD HH:MM:SS` UTC form; anything
/// else is treated as absent.
pub fn parse_scheduled_send_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// How long to wait for delivery after the message starts sending
pub fn compute_delivery_deadline(
    config: &DeliveryDeadlineConfig,
    base_timeout: Duration,
    scheduled_send_time: Option<&str>,
    message_size_bytes: Option<usize>,
    now: DateTime<Utc>,
) -> Duration {
    let grace = grace_time(config, message_size_bytes);

    let deadline = match scheduled_send_time.and_then(parse_scheduled_send_time) {
        Some(scheduled) => {
            let until_wake = (scheduled - now).to_std().unwrap_or(Duration::ZERO);
            until_wake + grace
        }
        None => base_timeout + grace,
    };

    debug!(
        scheduled_send_time = scheduled_send_time,
        message_size_bytes = message_size_bytes,
        grace_seconds = grace.as_secs(),
        deadline_seconds = deadline.as_secs(),
        "Computed delivery deadline"
    );

    deadline
}
