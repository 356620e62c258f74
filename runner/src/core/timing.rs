//! High-resolution timing utilities for task engines.

use time::{format_description::well_known::Rfc3339, OffsetDateTime};

#[cfg(not(target_arch = "wasm32"))]
use once_cell::sync::Lazy;

/// Monotonic timestamp in milliseconds, relative to a per-process origin.
#[derive(Debug, Default, Clone, Copy, PartialEq, PartialOrd)]
pub struct InstantStamp {
    ms: f64,
}

impl InstantStamp {
    pub fn from_millis(ms: f64) -> Self {
        Self { ms }
    }

    /// Milliseconds elapsed between `earlier` and `self`, clamped at zero.
    pub fn millis_since(&self, earlier: InstantStamp) -> f64 {
        (self.ms - earlier.ms).max(0.0)
    }
}

#[cfg(not(target_arch = "wasm32"))]
static ORIGIN: Lazy<tokio::time::Instant> = Lazy::new(tokio::time::Instant::now);

/// Current monotonic time.
#[cfg(not(target_arch = "wasm32"))]
pub fn now() -> InstantStamp {
    InstantStamp::from_millis(ORIGIN.elapsed().as_secs_f64() * 1000.0)
}

/// Current monotonic time (`performance.now()` in the browser).
#[cfg(target_arch = "wasm32")]
pub fn now() -> InstantStamp {
    let ms = web_sys::window()
        .and_then(|window| window.performance())
        .map(|performance| performance.now())
        .unwrap_or_default();
    InstantStamp::from_millis(ms)
}

#[cfg(not(target_arch = "wasm32"))]
pub async fn sleep_ms(ms: u64) {
    tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
}

#[cfg(target_arch = "wasm32")]
pub async fn sleep_ms(ms: u64) {
    let clamped = ms.min(u32::MAX as u64) as u32;
    gloo_timers::future::TimeoutFuture::new(clamped).await;
}

/// Wall-clock UTC timestamp in RFC 3339, the format every stored record uses.
pub fn timestamp_now() -> String {
    format_timestamp(OffsetDateTime::now_utc())
}

pub fn format_timestamp(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_default()
}

/// Parse RFC3339; return None on failure (robust to future format drift).
pub fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_since_never_goes_negative() {
        let early = InstantStamp::from_millis(100.0);
        let late = InstantStamp::from_millis(350.5);
        assert_eq!(late.millis_since(early), 250.5);
        assert_eq!(early.millis_since(late), 0.0);
    }

    #[test]
    fn timestamps_round_trip_through_rfc3339() {
        let raw = timestamp_now();
        assert!(parse_timestamp(&raw).is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }
}
