//! 限流重试与凭据轮换
//!
//! RetryPolicy 只对 LlmError::RateLimited 重试：第 i 次尝试失败后等待 base_backoff * i（线性），
//! 最多尝试 max_retries 次（为 0 时不调用），之后返回 RateLimitExhausted；其它错误立即返回。
//! RetryingLlmClient 组合 RetryPolicy、凭据池与全局 CallRateLimiter，本身也实现 LlmClient。

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::llm::rate_limit::CallRateLimiter;
use crate::llm::{LlmClient, LlmError};
use crate::memory::Message;

/// 线性退避重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: usize, base_backoff: Duration) -> Self {
        Self {
            max_retries,
            base_backoff,
        }
    }

    /// 第 attempt 次（从 1 开始）失败后的等待时间
    pub fn backoff_for(&self, attempt: usize) -> Duration {
        self.base_backoff.saturating_mul(attempt as u32)
    }

    /// 执行 f(attempt)，attempt 从 1 开始
    pub async fn call<T, F, Fut>(&self, mut f: F) -> Result<T, LlmError>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let attempts = self.max_retries;
        for attempt in 1..=attempts {
            match f(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_rate_limited() => {
                    if attempt < attempts {
                        let delay = self.backoff_for(attempt);
                        tracing::warn!(
                            attempt,
                            max_retries = attempts,
                            delay_ms = delay.as_millis() as u64,
                            "rate limited, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        tracing::error!(attempts, "rate limit persisted, giving up");
        Err(LlmError::RateLimitExhausted { attempts })
    }
}

/// 便捷函数：call(fn, max_retries, base_backoff)
pub async fn call_with_retry<T, F, Fut>(
    f: F,
    max_retries: usize,
    base_backoff: Duration,
) -> Result<T, LlmError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    RetryPolicy::new(max_retries, base_backoff).call(f).await
}

/// 何时换用下一个凭据
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationMode {
    /// 每次调用选一个，重试沿用
    #[default]
    PerCall,
    /// 每次重试都换下一个
    PerRetry,
}

/// 从凭据池中选取的方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSelection {
    #[default]
    RoundRobin,
    Random,
}

/// 多凭据客户端池（每个凭据一个客户端）
pub struct CredentialPool {
    clients: Vec<Arc<dyn LlmClient>>,
    selection: CredentialSelection,
    cursor: AtomicUsize,
}

impl CredentialPool {
    pub fn new(clients: Vec<Arc<dyn LlmClient>>, selection: CredentialSelection) -> Self {
        Self {
            clients,
            selection,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn single(client: Arc<dyn LlmClient>) -> Self {
        Self::new(vec![client], CredentialSelection::RoundRobin)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn next(&self) -> Option<Arc<dyn LlmClient>> {
        if self.clients.is_empty() {
            return None;
        }
        let index = match self.selection {
            CredentialSelection::RoundRobin => self.cursor.fetch_add(1, Ordering::Relaxed) % self.clients.len(),
            CredentialSelection::Random => rand::thread_rng().gen_range(0..self.clients.len()),
        };
        self.clients.get(index).cloned()
    }
}

/// 带限流、重试与凭据轮换的客户端
pub struct RetryingLlmClient {
    pool: CredentialPool,
    policy: RetryPolicy,
    rotation: RotationMode,
    limiter: Arc<CallRateLimiter>,
    model: String,
}

impl RetryingLlmClient {
    pub fn new(pool: CredentialPool, policy: RetryPolicy, limiter: Arc<CallRateLimiter>) -> Self {
        let model = pool
            .clients
            .first()
            .map(|c| c.model_name().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            pool,
            policy,
            rotation: RotationMode::default(),
            limiter,
            model,
        }
    }

    pub fn with_rotation(mut self, rotation: RotationMode) -> Self {
        self.rotation = rotation;
        self
    }

}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let first = self
            .pool
            .next()
            .ok_or_else(|| LlmError::Request("no LLM credentials configured".to_string()))?;
        self.policy
            .call(|attempt| {
                let client = match self.rotation {
                    RotationMode::PerRetry if attempt > 1 => self.pool.next().unwrap_or_else(|| first.clone()),
                    _ => first.clone(),
                };
                let limiter = self.limiter.clone();
                async move {
                    limiter.acquire().await;
                    client.complete(messages).await
                }
            })
            .await
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.pool.clients.iter().fold((0, 0, 0), |acc, c| {
            let (p, q, t) = c.token_usage();
            (acc.0 + p, acc.1 + q, acc.2 + t)
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::time::Instant;

    use super::*;
    use crate::llm::mock::ScriptedLlmClient;

    #[tokio::test(start_paused = true)]
    async fn test_linear_backoff_then_success() {
        let policy = RetryPolicy::new(3, Duration::from_secs(5));
        let start = Instant::now();
        let calls = Mutex::new(Vec::new());
        let result = policy
            .call(|attempt| {
                calls.lock().unwrap().push(start.elapsed());
                async move {
                    if attempt < 3 {
                        Err(LlmError::RateLimited { retry_after_ms: 0 })
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;
        assert_eq!(result, Ok("ok"));
        // 第 1 次后等 5s，第 2 次后等 10s
        let calls = calls.into_inner().unwrap();
        assert_eq!(calls.len(), 3);
        assert!(calls[1] >= Duration::from_secs(5) && calls[1] < Duration::from_secs(6));
        assert!(calls[2] >= Duration::from_secs(15) && calls[2] < Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_structured_error() {
        let mut count = 0;
        let result: Result<(), _> = call_with_retry(
            |_| {
                count += 1;
                async { Err(LlmError::RateLimited { retry_after_ms: 0 }) }
            },
            4,
            Duration::from_millis(10),
        )
        .await;
        assert_eq!(count, 4);
        assert_eq!(result, Err(LlmError::RateLimitExhausted { attempts: 4 }));
    }

    #[tokio::test]
    async fn test_zero_retries_never_calls() {
        let mut count = 0;
        let result: Result<(), _> = call_with_retry(
            |_| {
                count += 1;
                async { Ok(()) }
            },
            0,
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(count, 0);
        assert_eq!(result, Err(LlmError::RateLimitExhausted { attempts: 0 }));
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let mut count = 0;
        let result: Result<(), _> = call_with_retry(
            |_| {
                count += 1;
                async { Err(LlmError::Request("401".into())) }
            },
            5,
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(count, 1);
        assert_eq!(result, Err(LlmError::Request("401".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_retry_rotation_switches_credentials() {
        let a = Arc::new(ScriptedLlmClient::new(vec![Err(LlmError::RateLimited { retry_after_ms: 0 })]));
        let b = Arc::new(ScriptedLlmClient::new(vec![Ok("from b".to_string())]));
        let pool = CredentialPool::new(
            vec![a.clone() as Arc<dyn LlmClient>, b.clone() as Arc<dyn LlmClient>],
            CredentialSelection::RoundRobin,
        );
        let client = RetryingLlmClient::new(pool, RetryPolicy::new(3, Duration::from_secs(1)), CallRateLimiter::unlimited())
            .with_rotation(RotationMode::PerRetry);
        let reply = client.complete(&[Message::user("hi")]).await.unwrap();
        assert_eq!(reply, "from b");
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
    }

    #[test]
    fn test_round_robin_cycles() {
        let clients: Vec<Arc<dyn LlmClient>> = (0..3)
            .map(|i| Arc::new(ScriptedLlmClient::new(vec![]).with_model(format!("m{i}"))) as Arc<dyn LlmClient>)
            .collect();
        let pool = CredentialPool::new(clients, CredentialSelection::RoundRobin);
        let names: Vec<String> = (0..4)
            .map(|_| pool.next().unwrap().model_name().to_string())
            .collect();
        assert_eq!(names, vec!["m0", "m1", "m2", "m0"]);
    }
}
