//! LLM 层：客户端抽象、OpenAI 兼容实现、Mock、限流与重试

pub mod mock;
pub mod openai;
pub mod rate_limit;
pub mod retry;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use rate_limit::CallRateLimiter;
pub use retry::{
    call_with_retry, CredentialPool, CredentialSelection, RetryPolicy, RetryingLlmClient, RotationMode,
};
pub use traits::{LlmClient, LlmError};

use crate::config::LlmConfig;

/// 按配置创建客户端：每个 API key 一个 OpenAiClient，外层包 RetryingLlmClient；
/// provider 为 mock 或未配置任何 key 时退回 MockLlmClient。
/// limiter 为进程级共享限流器。
pub fn create_llm_from_config(cfg: &LlmConfig, limiter: Arc<CallRateLimiter>) -> Arc<dyn LlmClient> {
    let keys = cfg.resolved_api_keys();
    let clients: Vec<Arc<dyn LlmClient>> = if cfg.provider.eq_ignore_ascii_case("mock") || keys.is_empty() {
        tracing::warn!("No API key set or provider is mock, using Mock LLM");
        vec![Arc::new(MockLlmClient)]
    } else {
        tracing::info!(model = %cfg.model, credentials = keys.len(), "Using OpenAI-compatible LLM");
        keys.iter()
            .map(|key| {
                let mut client = OpenAiClient::new(cfg.base_url.as_deref(), &cfg.model, key);
                if cfg.request_timeout_secs > 0 {
                    client = client.with_timeout(Duration::from_secs(cfg.request_timeout_secs));
                }
                Arc::new(client) as Arc<dyn LlmClient>
            })
            .collect()
    };
    let policy = RetryPolicy::new(cfg.retry.max_retries, Duration::from_secs(cfg.retry.base_backoff_secs));
    Arc::new(
        RetryingLlmClient::new(CredentialPool::new(clients, cfg.retry.selection), policy, limiter)
            .with_rotation(cfg.retry.rotation),
    )
}
