//! 全局调用限流：滚动窗口内最多 max_calls 次模型调用
//!
//! 进程内只构造一次，以 Arc 形式传给所有 RetryingLlmClient（也就是所有并发 Agent）。
//! 超出额度的调用阻塞等待，直到窗口内最旧的一次调用过期；持锁等待保证先到先得。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
pub struct CallRateLimiter {
    max_calls: usize,
    period: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl CallRateLimiter {
    /// max_calls 为 0 表示不限流
    pub fn new(max_calls: usize, period: Duration) -> Self {
        Self {
            max_calls,
            period,
            calls: Mutex::new(VecDeque::with_capacity(max_calls)),
        }
    }

    pub fn shared(max_calls: usize, period: Duration) -> Arc<Self> {
        Arc::new(Self::new(max_calls, period))
    }

    pub fn unlimited() -> Arc<Self> {
        Self::shared(0, Duration::ZERO)
    }

    /// 等待直到窗口允许一次调用，并记录该次调用
    pub async fn acquire(&self) {
        if self.max_calls == 0 {
            return;
        }
        let mut calls = self.calls.lock().await;
        loop {
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
            if let Some(&oldest) = calls.front() {
                let wait_until = oldest + self.period;
                tracing::debug!(
                    wait_ms = wait_until.saturating_duration_since(now).as_millis() as u64,
                    "rate limit window full, waiting"
                );
                tokio::time::sleep_until(wait_until).await;
            }
        }
    }

    /// 当前窗口内已记录的调用数
    pub async fn in_window(&self) -> usize {
        let calls = self.calls.lock().await;
        let now = Instant::now();
        calls
            .iter()
            .filter(|t| now.duration_since(**t) < self.period)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_blocks_until_window_admits() {
        let limiter = CallRateLimiter::shared(2, Duration::from_secs(60));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert_eq!(limiter.in_window().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_never_exceed_rate() {
        let limiter = CallRateLimiter::shared(3, Duration::from_secs(10));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..7 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                Instant::now()
            }));
        }
        let mut admitted = Vec::new();
        for h in handles {
            admitted.push(h.await.unwrap());
        }
        admitted.sort();
        // 任意 10 秒窗口内至多 3 次
        for w in admitted.windows(4) {
            assert!(w[3].duration_since(w[0]) >= Duration::from_secs(10));
        }
        assert!(start.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_unlimited_never_blocks() {
        let limiter = CallRateLimiter::unlimited();
        for _ in 0..100 {
            limiter.acquire().await;
        }
        assert_eq!(limiter.in_window().await, 0);
    }
}
