use crate::error::{EngineError, Result};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Ceilings for the process-wide request budget, all rolling windows.
#[derive(Clone, Copy, Debug)]
pub struct RateLimits {
    pub max_rps: u32,
    pub max_rpm: u32,
    pub max_rpd: u32,
    pub acquire_timeout: Duration,
}

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const DAY_BUCKET: Duration = Duration::from_secs(60);

/// Remaining budget per window, for the health probe.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateBudget {
    pub second_remaining: u32,
    pub minute_remaining: u32,
    pub day_remaining: u32,
}

struct GovernorState {
    /// Grant instants inside the rolling second.
    second: VecDeque<Instant>,
    /// Grant instants inside the rolling minute.
    minute: VecDeque<Instant>,
    /// Day window bucketed per minute: (bucket start, grants in bucket).
    day: VecDeque<(Instant, u32)>,
    day_total: u32,
}

/// Process-wide rate governor. Permits are grantable back-to-back up to the
/// per-second ceiling (the burst allowance); the rolling-second, rolling-
/// minute and rolling-day ceilings are hard.
pub struct RateGovernor {
    limits: RateLimits,
    state: Mutex<GovernorState>,
}

impl RateGovernor {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(GovernorState {
                second: VecDeque::new(),
                minute: VecDeque::new(),
                day: VecDeque::new(),
                day_total: 0,
            }),
        }
    }

    /// Acquire one permit, waiting up to the configured acquire timeout.
    pub async fn acquire(&self) -> Result<()> {
        let started = Instant::now();
        let deadline = started + self.limits.acquire_timeout;
        loop {
            let wait = match self.try_acquire_at(Instant::now()) {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };
            let now = Instant::now();
            if now + wait > deadline {
                return Err(EngineError::RateStalled {
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Single admission check. On refusal returns how long until the
    /// earliest instant at which every violated window could admit again.
    pub fn try_acquire_at(&self, now: Instant) -> std::result::Result<(), Duration> {
        let mut state = self.state.lock().unwrap();
        state.prune(now);

        let mut free_at: Option<Instant> = None;
        let mut block = |at: Instant| {
            free_at = Some(match free_at {
                Some(prev) => prev.max(at),
                None => at,
            });
        };

        if state.second.len() >= self.limits.max_rps as usize {
            if let Some(&oldest) = state.second.front() {
                block(oldest + Duration::from_secs(1));
            }
        }
        if state.minute.len() >= self.limits.max_rpm as usize {
            if let Some(&oldest) = state.minute.front() {
                block(oldest + Duration::from_secs(60));
            }
        }
        if state.day_total >= self.limits.max_rpd {
            if let Some(&(oldest_bucket, _)) = state.day.front() {
                // The whole oldest bucket must age out before admission is
                // guaranteed again.
                block(oldest_bucket + DAY_BUCKET + DAY);
            }
        }

        if let Some(at) = free_at {
            return Err(at.saturating_duration_since(now).max(Duration::from_millis(1)));
        }

        state.second.push_back(now);
        state.minute.push_back(now);
        match state.day.back_mut() {
            Some((bucket, count)) if now.duration_since(*bucket) < DAY_BUCKET => *count += 1,
            _ => state.day.push_back((now, 1)),
        }
        state.day_total += 1;
        Ok(())
    }

    pub fn budget(&self) -> RateBudget {
        let mut state = self.state.lock().unwrap();
        state.prune(Instant::now());
        RateBudget {
            second_remaining: self.limits.max_rps.saturating_sub(state.second.len() as u32),
            minute_remaining: self.limits.max_rpm.saturating_sub(state.minute.len() as u32),
            day_remaining: self.limits.max_rpd.saturating_sub(state.day_total),
        }
    }
}

impl GovernorState {
    fn prune(&mut self, now: Instant) {
        while matches!(self.second.front(), Some(&t) if now.duration_since(t) >= Duration::from_secs(1)) {
            self.second.pop_front();
        }
        while matches!(self.minute.front(), Some(&t) if now.duration_since(t) >= Duration::from_secs(60)) {
            self.minute.pop_front();
        }
        while matches!(self.day.front(), Some(&(t, _)) if now.duration_since(t) >= DAY + DAY_BUCKET) {
            let (_, count) = self.day.pop_front().unwrap();
            self.day_total -= count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(rps: u32, rpm: u32, rpd: u32) -> RateLimits {
        RateLimits {
            max_rps: rps,
            max_rpm: rpm,
            max_rpd: rpd,
            acquire_timeout: Duration::from_secs(15),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rolling_second_never_exceeds_ceiling() {
        let gov = RateGovernor::new(limits(6, 1000, 100_000));
        let t0 = Instant::now();

        for _ in 0..6 {
            assert!(gov.try_acquire_at(t0).is_ok());
        }
        // Seventh permit inside the same second is refused.
        let wait = gov.try_acquire_at(t0).unwrap_err();
        assert!(wait <= Duration::from_secs(1));

        // Exactly one second later the window has rolled.
        assert!(gov.try_acquire_at(t0 + Duration::from_secs(1)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn sixty_pulls_complete_under_rps_six() {
        // Scenario shape of S5: 60 acquisitions against max_rps = 6 must all
        // succeed without a stall when the per-call timeout is generous.
        let gov = std::sync::Arc::new(RateGovernor::new(limits(6, 1000, 100_000)));
        let mut grants: Vec<Instant> = Vec::new();
        for _ in 0..60 {
            gov.acquire().await.expect("no stall expected");
            grants.push(Instant::now());
        }
        assert_eq!(grants.len(), 60);
        // No rolling 1 s window contains more than 6 grants.
        for (i, &start) in grants.iter().enumerate() {
            let in_window = grants[i..]
                .iter()
                .take_while(|&&g| g.duration_since(start) < Duration::from_secs(1))
                .count();
            assert!(in_window <= 6, "window starting at grant {i} holds {in_window}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_with_rate_stalled() {
        let gov = RateGovernor::new(RateLimits {
            max_rps: 1,
            max_rpm: 1,
            max_rpd: 1,
            acquire_timeout: Duration::from_millis(200),
        });
        gov.acquire().await.unwrap();
        // Budget exhausted for a full day; the second acquire must stall out.
        let err = gov.acquire().await.unwrap_err();
        assert!(matches!(err, EngineError::RateStalled { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn day_window_rolls_over() {
        let gov = RateGovernor::new(limits(10, 100, 2));
        let t0 = Instant::now();
        assert!(gov.try_acquire_at(t0).is_ok());
        assert!(gov.try_acquire_at(t0).is_ok());
        assert!(gov.try_acquire_at(t0 + Duration::from_secs(60)).is_err());
        assert_eq!(gov.budget().day_remaining, 0);

        // After the rolling day (plus the bucket width) the budget frees up.
        let later = t0 + DAY + DAY_BUCKET;
        assert!(gov.try_acquire_at(later).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_admitted_without_pacing() {
        let gov = RateGovernor::new(limits(6, 1000, 100_000));
        let t0 = Instant::now();
        // All six permits of the second are grantable at the same instant.
        for _ in 0..6 {
            assert!(gov.try_acquire_at(t0).is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn budget_reports_remaining() {
        let gov = RateGovernor::new(limits(6, 10, 100));
        let t0 = Instant::now();
        gov.try_acquire_at(t0).unwrap();
        gov.try_acquire_at(t0).unwrap();
        let budget = gov.budget();
        assert_eq!(budget.second_remaining, 4);
        assert_eq!(budget.minute_remaining, 8);
        assert_eq!(budget.day_remaining, 98);
    }
}
