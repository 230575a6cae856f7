use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Sliding-window admission gate shared by every client that talks to the
/// same upstream budget.
///
/// At most `max_calls` acquisitions are admitted within any trailing
/// `period`. Callers that would exceed the budget are suspended until the
/// oldest admission falls out of the window.
#[derive(Debug)]
pub struct RateLimiter {
    max_calls: usize,
    period: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_calls: usize, period: Duration) -> Self {
        let max_calls = max_calls.max(1);
        Self {
            max_calls,
            period,
            calls: Mutex::new(VecDeque::with_capacity(max_calls)),
        }
    }

    /// `max(1, rpm)` calls per minute.
    pub fn per_minute(requests_per_minute: u32) -> Self {
        Self::new(requests_per_minute as usize, Duration::from_secs(60))
    }

    /// Wait until one more call fits in the window, then record it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut calls = self.calls.lock().await;
                let now = Instant::now();
                while let Some(&oldest) = calls.front() {
                    if now.duration_since(oldest) >= self.period {
                        calls.pop_front();
                    } else {
                        break;
                    }
                }

                if calls.len() < self.max_calls {
                    calls.push_back(now);
                    return;
                }

                // The window is full, so `front` is always present here.
                match calls.front() {
                    Some(&oldest) => self.period.saturating_sub(now.duration_since(oldest)),
                    None => Duration::ZERO,
                }
            };

            // Another waiter may take the freed slot first; re-check after sleeping.
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_max_calls_coerced_to_one() {
        assert_eq!(RateLimiter::new(0, Duration::from_secs(1)).max_calls, 1);
        assert_eq!(RateLimiter::per_minute(0).max_calls, 1);
        assert_eq!(RateLimiter::per_minute(20).period, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_zero_budget_still_admits_one_per_window() {
        let limiter = RateLimiter::new(0, Duration::from_millis(200));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(190));
    }

    #[tokio::test]
    async fn test_admits_immediately_under_budget() {
        let limiter = RateLimiter::new(3, Duration::from_secs(10));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_sequential_calls_respect_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(1));
        let start = Instant::now();
        let mut admitted = Vec::new();
        for _ in 0..5 {
            limiter.acquire().await;
            admitted.push(Instant::now());
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "finished too early: {:?}", elapsed);
        assert!(elapsed <= Duration::from_secs(3), "finished too late: {:?}", elapsed);

        // No trailing one-second window ever holds more than two admissions.
        for i in 2..admitted.len() {
            assert!(admitted[i].duration_since(admitted[i - 2]) >= Duration::from_millis(980));
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_never_exceed_cap() {
        let limiter = Arc::new(RateLimiter::new(2, Duration::from_millis(400)));
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    limiter.acquire().await;
                    Instant::now()
                })
            })
            .collect();

        let mut admitted = Vec::new();
        for handle in handles {
            admitted.push(handle.await.unwrap());
        }
        admitted.sort();

        for i in 2..admitted.len() {
            assert!(
                admitted[i].duration_since(admitted[i - 2]) >= Duration::from_millis(350),
                "three admissions inside one window"
            );
        }
    }
}
