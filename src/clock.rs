//! Two clocks, deliberately separated.
//!
//! Wall-clock nanoseconds (`wall_now_ns`) drive phase scheduling and duration
//! bookkeeping, since phase durations are configured in seconds of real time.
//! Monotonic perf nanoseconds (`perf_now_ns`) drive every latency computation.
//! The two must never be mixed in arithmetic.

use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

static PERF_ANCHOR: OnceLock<Instant> = OnceLock::new();

/// Wall-clock time in nanoseconds since the Unix epoch.
pub fn wall_now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Monotonic time in nanoseconds since the first call in this process.
pub fn perf_now_ns() -> u64 {
    let anchor = PERF_ANCHOR.get_or_init(Instant::now);
    anchor.elapsed().as_nanos() as u64
}

/// Sleep until the given wall-clock nanosecond instant.
///
/// Coarse tokio sleep to within one millisecond of the target, then a short
/// spin to hit the instant precisely. The spin is bounded by the remaining
/// wall-clock delta, so a target in the past returns immediately.
pub async fn sleep_until_wall_ns(target_ns: u64) {
    const SPIN_THRESHOLD_NS: u64 = 1_000_000;

    loop {
        let now = wall_now_ns();
        if now >= target_ns {
            return;
        }
        let remaining = target_ns - now;
        if remaining > SPIN_THRESHOLD_NS {
            tokio::time::sleep(Duration::from_nanos(remaining - SPIN_THRESHOLD_NS)).await;
        } else {
            // Final approach: yield-spin so the instant lands within ~10us.
            while wall_now_ns() < target_ns {
                std::hint::spin_loop();
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perf_clock_is_monotonic() {
        let a = perf_now_ns();
        let b = perf_now_ns();
        assert!(b >= a);
    }

    #[tokio::test]
    async fn sleep_until_past_instant_returns_immediately() {
        let start = Instant::now();
        sleep_until_wall_ns(wall_now_ns().saturating_sub(1_000_000)).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn sleep_until_hits_target() {
        let target = wall_now_ns() + 20_000_000;
        sleep_until_wall_ns(target).await;
        assert!(wall_now_ns() >= target);
    }
}
