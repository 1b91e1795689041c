//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock / 重试包装）实现 LlmClient：complete(messages) -> 原始文本。
//! LlmError 区分「限流 / 配额耗尽」与其它错误，重试策略只对前者生效。

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::Message;

/// LLM 调用错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    /// 限流或配额耗尽（HTTP 429 / RESOURCE_EXHAUSTED），可退避重试
    #[error("Rate limited (retry after {retry_after_ms} ms)")]
    RateLimited { retry_after_ms: u64 },

    /// 重试次数用尽后仍然限流
    #[error("Rate limit persisted after {attempts} attempts")]
    RateLimitExhausted { attempts: usize },

    /// 网络、鉴权等其它请求失败，不重试
    #[error("Request failed: {0}")]
    Request(String),

    /// 后端返回了无法使用的响应（如空 choices）
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// 是否属于可重试的限流类错误
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. })
    }
}

/// LLM 客户端 trait：invoke(messages) -> raw text
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }

    /// 模型名（用于日志）
    fn model_name(&self) -> &str {
        "unknown"
    }
}
