use dashmap::DashMap;
use std::sync::Arc;
use unigate_core::clock::TimeMeter;
use unigate_store::CachedKeyInfo;

const NANOS_PER_SECOND: u64 = 1_000_000_000;
const NANOS_PER_DAY: u64 = 86_400 * NANOS_PER_SECOND;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Request admitted; `remaining` is the smaller of the two buckets'
    /// leftovers, for the `X-Rate-Limit-Remaining` header.
    Allowed { remaining: u64 },
    /// Request denied; wait at least this many whole seconds.
    Denied { retry_after_secs: u64 },
}

/// Token bucket with greedy refill: capacity regenerates spread evenly over
/// the window, tracked in integer "token-nanos" (one token = `period_nanos`
/// units) so no precision is lost at day-scale windows.
#[derive(Debug)]
struct TokenBucket {
    capacity: u64,
    period_nanos: u64,
    available: u64,
    refill_progress: u64,
    last_refill_nanos: u64,
}

impl TokenBucket {
    fn new(capacity: u64, period_nanos: u64, now_nanos: u64) -> Self {
        Self {
            capacity,
            period_nanos,
            available: capacity,
            refill_progress: 0,
            last_refill_nanos: now_nanos,
        }
    }

    fn refill(&mut self, now_nanos: u64) {
        let elapsed = now_nanos.saturating_sub(self.last_refill_nanos);
        self.last_refill_nanos = now_nanos;

        let progress =
            self.refill_progress as u128 + elapsed as u128 * self.capacity as u128;
        let whole = (progress / self.period_nanos as u128) as u64;
        self.refill_progress = (progress % self.period_nanos as u128) as u64;

        self.available = self.available.saturating_add(whole).min(self.capacity);
        if self.available == self.capacity {
            self.refill_progress = 0;
        }
    }

    /// Real nanoseconds until one whole token regenerates.
    fn nanos_until_next_token(&self) -> u64 {
        let needed = self.period_nanos as u128 - self.refill_progress as u128;
        needed.div_ceil(self.capacity.max(1) as u128) as u64
    }
}

#[derive(Debug)]
struct RateLimitEntry {
    info: CachedKeyInfo,
    per_second: TokenBucket,
    per_day: TokenBucket,
}

impl RateLimitEntry {
    fn new(info: CachedKeyInfo, now_nanos: u64) -> Self {
        let rps = info.requests_per_second.max(0) as u64;
        let rpd = info.requests_per_day.max(0) as u64;
        Self {
            per_second: TokenBucket::new(rps, NANOS_PER_SECOND, now_nanos),
            per_day: TokenBucket::new(rpd, NANOS_PER_DAY, now_nanos),
            info,
        }
    }

    fn try_consume(&mut self, now_nanos: u64) -> RateDecision {
        self.per_second.refill(now_nanos);
        self.per_day.refill(now_nanos);

        if self.per_second.available >= 1 && self.per_day.available >= 1 {
            self.per_second.available -= 1;
            self.per_day.available -= 1;
            return RateDecision::Allowed {
                remaining: self.per_second.available.min(self.per_day.available),
            };
        }

        let mut wait_nanos = 0u64;
        for bucket in [&self.per_second, &self.per_day] {
            if bucket.available == 0 {
                wait_nanos = wait_nanos.max(bucket.nanos_until_next_token());
            }
        }
        RateDecision::Denied {
            retry_after_secs: wait_nanos.div_ceil(NANOS_PER_SECOND).max(1),
        }
    }
}

/// Per-key twin token buckets (per-second, per-day).
///
/// The entry step is atomic through the map's exclusive entry guard: two
/// concurrent requests on the same key can never materialize two entries, and
/// an entry whose stored key info no longer equals the cached value is
/// discarded and rebuilt in place at the new plan's limits.
pub struct RateLimiter {
    clock: Arc<dyn TimeMeter>,
    entries: DashMap<String, RateLimitEntry>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn TimeMeter>) -> Self {
        Self {
            clock,
            entries: DashMap::new(),
        }
    }

    pub fn try_consume(&self, info: &CachedKeyInfo) -> RateDecision {
        let now = self.clock.monotonic_nanos();

        let mut entry = self
            .entries
            .entry(info.api_key.clone())
            .or_insert_with(|| RateLimitEntry::new(info.clone(), now));

        if entry.info != *info {
            *entry = RateLimitEntry::new(info.clone(), now);
        }

        entry.try_consume(now)
    }

    /// Drop a key's buckets outright (admin key removal).
    pub fn forget(&self, api_key: &str) {
        self.entries.remove(api_key);
    }

    pub fn tracked_keys(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;
    use std::time::Duration;
    use unigate_core::clock::ManualTimeMeter;

    fn info(rps: i32, rpd: i32) -> CachedKeyInfo {
        CachedKeyInfo {
            api_key: "sk_test".into(),
            requests_per_second: rps,
            requests_per_day: rpd,
            pricing_plan_id: 1,
            active_until: None,
        }
    }

    fn limiter() -> (RateLimiter, Arc<ManualTimeMeter>) {
        let clock = Arc::new(ManualTimeMeter::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        ));
        (RateLimiter::new(clock.clone()), clock)
    }

    #[test]
    fn burst_up_to_capacity_then_denied_with_retry_after_one() {
        let (limiter, clock) = limiter();
        let info = info(5, 50_000);

        // 6 requests inside 200ms: 5 allowed, the 6th denied with Retry-After 1
        for i in 0..5 {
            clock.advance(Duration::from_millis(10));
            assert!(
                matches!(limiter.try_consume(&info), RateDecision::Allowed { .. }),
                "request {i} should pass"
            );
        }
        clock.advance(Duration::from_millis(10));
        assert_eq!(
            limiter.try_consume(&info),
            RateDecision::Denied { retry_after_secs: 1 }
        );
    }

    #[test]
    fn remaining_is_min_of_both_buckets() {
        let (limiter, _) = limiter();
        let info = info(100, 3);

        // Day bucket (3) is the binding constraint
        assert_eq!(
            limiter.try_consume(&info),
            RateDecision::Allowed { remaining: 2 }
        );
        assert_eq!(
            limiter.try_consume(&info),
            RateDecision::Allowed { remaining: 1 }
        );
    }

    #[test]
    fn greedy_refill_returns_tokens_mid_window() {
        let (limiter, clock) = limiter();
        let info = info(5, 50_000);

        for _ in 0..5 {
            limiter.try_consume(&info);
        }
        assert!(matches!(
            limiter.try_consume(&info),
            RateDecision::Denied { .. }
        ));

        // One token regenerates every 200ms at 5 rps
        clock.advance(Duration::from_millis(200));
        assert!(matches!(
            limiter.try_consume(&info),
            RateDecision::Allowed { .. }
        ));
    }

    #[test]
    fn day_bucket_denial_reports_long_wait_in_whole_seconds() {
        let (limiter, _) = limiter();
        let info = info(1_000, 2);

        limiter.try_consume(&info);
        limiter.try_consume(&info);
        match limiter.try_consume(&info) {
            RateDecision::Denied { retry_after_secs } => {
                // One token per 43_200s at 2/day
                assert_eq!(retry_after_secs, 43_200);
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[test]
    fn plan_change_rebuilds_buckets_at_new_capacity() {
        let (limiter, clock) = limiter();
        let old = info(5, 10_000);

        for _ in 0..5 {
            limiter.try_consume(&old);
        }
        assert!(matches!(
            limiter.try_consume(&old),
            RateDecision::Denied { .. }
        ));

        // Upgraded plan: fresh buckets, at least 6 requests pass sub-second
        let mut new = info(20, 500_000);
        new.pricing_plan_id = 2;
        for i in 0..6 {
            clock.advance(Duration::from_millis(5));
            assert!(
                matches!(limiter.try_consume(&new), RateDecision::Allowed { .. }),
                "request {i} on the new plan should pass"
            );
        }
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn unchanged_info_keeps_bucket_state() {
        let (limiter, _) = limiter();
        let info = info(5, 10_000);

        limiter.try_consume(&info);
        limiter.try_consume(&info);
        // Same info again: the entry persists, so remaining keeps shrinking
        match limiter.try_consume(&info) {
            RateDecision::Allowed { remaining } => assert_eq!(remaining, 2),
            other => panic!("expected allow, got {other:?}"),
        }
    }

    #[test]
    fn zero_capacity_plan_always_denies() {
        let (limiter, _) = limiter();
        let info = info(0, 10_000);

        match limiter.try_consume(&info) {
            RateDecision::Denied { retry_after_secs } => assert!(retry_after_secs >= 1),
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[test]
    fn forget_drops_the_entry() {
        let (limiter, _) = limiter();
        let info = info(5, 10_000);
        limiter.try_consume(&info);
        assert_eq!(limiter.tracked_keys(), 1);
        limiter.forget("sk_test");
        assert_eq!(limiter.tracked_keys(), 0);
    }
}
