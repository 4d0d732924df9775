use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Sliding-window limiter shared by all workers.
///
/// At most `max_calls` acquisitions succeed within any `period`. A caller over
/// budget sleeps until the oldest call leaves the window; callers queue on the
/// lock so they are served in arrival order.
pub struct CallLimiter {
    max_calls: usize,
    period: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl CallLimiter {
    pub fn new(max_calls: usize, period: Duration) -> Self {
        Self {
            max_calls: max_calls.max(1),
            period,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    /// Wait until a call is allowed, then record it.
    pub async fn acquire(&self) {
        let mut calls = self.calls.lock().await;
        self.evict(&mut calls, Instant::now());

        if calls.len() >= self.max_calls {
            if let Some(&oldest) = calls.front() {
                let ready_at = oldest + self.period;
                log::debug!(
                    "Call limit of {} per {:?} reached, waiting {:?}",
                    self.max_calls,
                    self.period,
                    ready_at.saturating_duration_since(Instant::now())
                );
                tokio::time::sleep_until(ready_at).await;
            }
            self.evict(&mut calls, Instant::now());
        }

        calls.push_back(Instant::now());
    }

    fn evict(&self, calls: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&t) = calls.front() {
            if now.saturating_duration_since(t) >= self.period {
                calls.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn under_budget_does_not_wait() {
        let limiter = CallLimiter::new(3, Duration::from_secs(60));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn over_budget_waits_for_window() {
        let limiter = CallLimiter::new(2, Duration::from_secs(10));
        let start = Instant::now();
        limiter.acquire().await;
        tokio::time::advance(Duration::from_secs(4)).await;
        limiter.acquire().await;
        limiter.acquire().await;
        // Third call waits until the first leaves the window.
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        limiter.acquire().await;
        // Fourth waits for the second (t=4) to expire.
        assert_eq!(start.elapsed(), Duration::from_secs(14));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_budget_is_treated_as_one() {
        let limiter = CallLimiter::new(0, Duration::from_secs(5));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }
}
