//! 会话监管：停止信号
//!
//! 持有 CancellationToken：用户 Ctrl+C 或上层编排器取消时触发；Agent 只在步边界轮询，
//! 不会打断进行中的模型调用或动作批次。研究编排器为每个子任务派生子 token。

use tokio_util::sync::CancellationToken;

/// 会话级停止信号
#[derive(Debug, Clone, Default)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 触发停止（用户 Ctrl+C）
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 创建子 token（用于单个子任务，父 token 取消时一并取消）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_propagates_to_children() {
        let supervisor = SessionSupervisor::new();
        let child = supervisor.child_token();
        assert!(!supervisor.is_stop_requested());
        supervisor.cancel();
        assert!(supervisor.is_stop_requested());
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_child_cancel_does_not_affect_parent() {
        let supervisor = SessionSupervisor::new();
        let child = supervisor.child_token();
        child.cancel();
        assert!(!supervisor.is_stop_requested());
    }
}
