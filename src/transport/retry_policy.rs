use std::time::{Duration, SystemTime};

use http::header::RETRY_AFTER;

pub(crate) const RETRY_AFTER_MAX_SECS: u64 = 30;
pub(crate) const PARSED_ENDPOINT_CACHE_MAX_ENTRIES: usize = 512;

/// Linear backoff: `base * (attempt + 1)`, so the first retry waits `base`.
#[inline]
pub(crate) fn linear_backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt.saturating_add(1))
}

/// Delay before the next attempt, preferring a server-sent `Retry-After`.
#[inline]
pub(crate) fn retry_delay(headers: Option<&http::HeaderMap>, base: Duration, attempt: u32) -> Duration {
    headers
        .and_then(parse_retry_after_delay)
        .unwrap_or_else(|| linear_backoff_delay(base, attempt))
}

#[inline]
pub(crate) fn parse_retry_after_delay(headers: &http::HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds.min(RETRY_AFTER_MAX_SECS)));
    }

    let target = httpdate::parse_http_date(raw).ok()?;
    let delay = target.duration_since(SystemTime::now()).unwrap_or_default();
    Some(delay.min(Duration::from_secs(RETRY_AFTER_MAX_SECS)))
}
