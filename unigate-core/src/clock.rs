use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Injectable time source.
///
/// All wall-clock and monotonic reads in the gateway go through this trait so
/// tests can fast-forward past key expiries and bucket refill windows without
/// sleeping. Production code uses [`SystemTimeMeter`].
pub trait TimeMeter: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic nanoseconds since an arbitrary fixed origin.
    fn monotonic_nanos(&self) -> u64;
}

/// Real clock backed by `Utc::now()` and `Instant`.
pub struct SystemTimeMeter {
    origin: Instant,
}

impl SystemTimeMeter {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn shared() -> Arc<dyn TimeMeter> {
        Arc::new(Self::new())
    }
}

impl Default for SystemTimeMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeMeter for SystemTimeMeter {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Manually advanced clock for tests.
///
/// Starts at a fixed base instant; `advance` moves both the wall clock and
/// the monotonic counter forward in lockstep.
pub struct ManualTimeMeter {
    base: DateTime<Utc>,
    elapsed_nanos: AtomicU64,
}

impl ManualTimeMeter {
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            elapsed_nanos: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, by: std::time::Duration) {
        self.elapsed_nanos
            .fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl TimeMeter for ManualTimeMeter {
    fn now(&self) -> DateTime<Utc> {
        let nanos = self.elapsed_nanos.load(Ordering::SeqCst);
        self.base + Duration::nanoseconds(nanos as i64)
    }

    fn monotonic_nanos(&self) -> u64 {
        self.elapsed_nanos.load(Ordering::SeqCst)
    }
}
