//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供 Agent 主循环决定是回滚并重试当前步，还是立即终止。

use crate::core::{AgentError, RecoveryAction};
use crate::llm::LlmError;

/// 语义化错误恢复：解析 / 模型 / 环境错误可在步级重试，配置等致命错误直接终止
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::JsonParseError(_) => RecoveryAction::RetryStep,
            AgentError::EnvironmentError(_) => RecoveryAction::RetryStep,
            AgentError::LlmError(LlmError::RateLimited { .. })
            | AgentError::LlmError(LlmError::RateLimitExhausted { .. })
            | AgentError::LlmError(LlmError::Request(_))
            | AgentError::LlmError(LlmError::InvalidResponse(_)) => RecoveryAction::RetryStep,
            AgentError::Serialization(_) => RecoveryAction::RetryStep,
            AgentError::ConfigError(_) | AgentError::Io(_) => RecoveryAction::Abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_json_parse_error() {
        let engine = RecoveryEngine::new();
        let err = AgentError::JsonParseError("invalid json".to_string());
        assert_eq!(engine.handle(&err), RecoveryAction::RetryStep);
    }

    #[test]
    fn test_recovery_rate_limit_exhausted() {
        let engine = RecoveryEngine::new();
        let err = AgentError::LlmError(LlmError::RateLimitExhausted { attempts: 3 });
        assert_eq!(engine.handle(&err), RecoveryAction::RetryStep);
    }

    #[test]
    fn test_recovery_environment_error() {
        let engine = RecoveryEngine::new();
        let err = AgentError::EnvironmentError("page crashed".to_string());
        assert_eq!(engine.handle(&err), RecoveryAction::RetryStep);
    }

    #[test]
    fn test_recovery_config_error_aborts() {
        let engine = RecoveryEngine::new();
        let err = AgentError::ConfigError("max_failures must be > 0".to_string());
        assert_eq!(engine.handle(&err), RecoveryAction::Abort);
    }
}
