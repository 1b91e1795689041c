//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定重试当前步（RetryStep）还是立即终止（Abort）。
//! 步数耗尽、取消等属于正常终态，不在此枚举中（见 core::state::TerminalState）。

use thiserror::Error;

use crate::llm::LlmError;

/// Agent 运行过程中可能出现的错误（解析、模型调用、环境、配置等）
#[derive(Error, Debug)]
pub enum AgentError {
    /// 模型输出经修复后仍不是合法 JSON，或不满足输出 schema
    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("LLM error: {0}")]
    LlmError(#[from] LlmError),

    /// 环境观察或动作执行失败
    #[error("Environment error: {0}")]
    EnvironmentError(String),

    /// 配置非法（致命，不重试）
    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AgentError {
    /// 截断错误描述，仅保留末尾 max_len 个字符（错误尾部通常包含最具体的原因）
    pub fn truncated(&self, max_len: usize) -> String {
        truncate_tail(&self.to_string(), max_len)
    }
}

/// 保留字符串末尾 max_len 个字符
pub fn truncate_tail(text: &str, max_len: usize) -> String {
    let count = text.chars().count();
    if count <= max_len {
        return text.to_string();
    }
    text.chars().skip(count - max_len).collect()
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 回滚本步消息，等待固定间隔后重试同一步
    RetryStep,
    /// 终止当前任务并把错误交给调用方
    Abort,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_tail_keeps_end() {
        assert_eq!(truncate_tail("abcdef", 3), "def");
        assert_eq!(truncate_tail("abc", 10), "abc");
    }

    #[test]
    fn test_truncated_error_message() {
        let err = AgentError::EnvironmentError("x".repeat(50));
        assert_eq!(err.truncated(10).chars().count(), 10);
    }

    #[test]
    fn test_llm_error_converts() {
        let err: AgentError = LlmError::RateLimitExhausted { attempts: 3 }.into();
        assert!(matches!(err, AgentError::LlmError(_)));
        assert!(err.to_string().contains("3 attempts"));
    }
}
