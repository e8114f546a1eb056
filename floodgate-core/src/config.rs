//! Engine configuration and the cooperative call budget.

use crate::error::ProtocolViolation;
use anyhow::Result;
use std::time::{Duration, Instant};

/// Default capacity of inter-tasklet conduits.
pub const DEFAULT_CONDUIT_CAPACITY: usize = 1024;

/// Time budget of a single lifecycle call on a cooperative processor.
///
/// A call slower than `warn` is logged; a call slower than `fail` is a
/// [`ProtocolViolation::CooperativeTimeLimitExceeded`] when `fail_on_exceed` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooperativeTimeLimits {
    pub warn: Duration,
    pub fail: Duration,
    pub fail_on_exceed: bool,
}

impl Default for CooperativeTimeLimits {
    fn default() -> Self {
        Self {
            warn: Duration::from_millis(5),
            fail: Duration::from_millis(100),
            fail_on_exceed: true,
        }
    }
}

impl CooperativeTimeLimits {
    /// Runs `f`, then checks how long it took.
    ///
    /// The closure's own error wins over a time-limit violation.
    pub fn timed<R>(
        &self,
        call: &'static str,
        owner: &str,
        f: impl FnOnce() -> Result<R>,
    ) -> Result<R> {
        let start = Instant::now();
        let result = f()?;
        self.check(call, owner, start.elapsed())?;
        Ok(result)
    }

    /// [`CooperativeTimeLimits::timed`] for cooperative calls; others run unchecked.
    pub fn run<R>(
        &self,
        cooperative: bool,
        call: &'static str,
        owner: &str,
        f: impl FnOnce() -> Result<R>,
    ) -> Result<R> {
        if cooperative {
            self.timed(call, owner, f)
        } else {
            f()
        }
    }

    pub fn check(&self, call: &'static str, owner: &str, elapsed: Duration) -> Result<()> {
        if self.fail_on_exceed && elapsed >= self.fail {
            return Err(ProtocolViolation::CooperativeTimeLimitExceeded {
                call,
                elapsed,
                limit: self.fail,
            }
            .into());
        }
        if elapsed > self.warn {
            tracing::warn!(
                "call to {}() of {} took {:.2}ms, it should be < {}ms normally",
                call,
                owner,
                elapsed.as_secs_f64() * 1000.0,
                self.warn.as_millis()
            );
        }
        Ok(())
    }
}

/// Back-off of a worker thread whose last full pass made no progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleConfig {
    pub min_park: Duration,
    pub max_park: Duration,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            min_park: Duration::from_micros(25),
            max_park: Duration::from_millis(1),
        }
    }
}

impl IdleConfig {
    /// Park time after `idle_passes` consecutive passes without progress.
    pub fn park_time(&self, idle_passes: u32) -> Duration {
        let factor = 1u32 << idle_passes.min(16);
        self.min_park.saturating_mul(factor).min(self.max_park)
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker threads shared by all cooperative tasklets.
    pub cooperative_thread_count: usize,
    /// Capacity of each outbox queue of a tasklet (data and snapshot).
    pub outbox_capacity: usize,
    /// Maximum number of items moved into an inbox at once.
    pub inbox_batch_size: usize,
    /// Capacity of conduits created by [`crate::conduit::conduit_default`].
    pub conduit_capacity: usize,
    pub time_limits: CooperativeTimeLimits,
    pub idle: IdleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cooperative_thread_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            outbox_capacity: 1024,
            inbox_batch_size: 1024,
            conduit_capacity: DEFAULT_CONDUIT_CAPACITY,
            time_limits: CooperativeTimeLimits::default(),
            idle: IdleConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_limit_pass_and_fail() {
        let limits = CooperativeTimeLimits::default();
        assert!(limits
            .check("process", "t", Duration::from_millis(1))
            .is_ok());
        let err = limits
            .check("process", "t", Duration::from_millis(150))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProtocolViolation>(),
            Some(ProtocolViolation::CooperativeTimeLimitExceeded { call: "process", .. })
        ));
    }

    #[test]
    fn test_time_limit_warn_only_when_not_enforced() {
        let limits = CooperativeTimeLimits {
            fail_on_exceed: false,
            ..Default::default()
        };
        assert!(limits
            .check("complete", "t", Duration::from_millis(500))
            .is_ok());
    }

    #[test]
    fn test_timed_returns_closure_result() {
        let limits = CooperativeTimeLimits::default();
        let value = limits.timed("complete", "t", || Ok(7)).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_idle_park_time_is_capped() {
        let idle = IdleConfig::default();
        assert_eq!(idle.park_time(0), Duration::from_micros(25));
        assert_eq!(idle.park_time(1), Duration::from_micros(50));
        assert_eq!(idle.park_time(30), Duration::from_millis(1));
    }
}
