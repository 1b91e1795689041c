//! Agent 状态机：运行阶段与终态
//!
//! Idle → Running → {StepOk, StepFailed} → Running | Done | Stopped | MaxStepsReached | Failed。
//! 终态（TerminalState）随 AgentHistory 一起返回，调用方据此区分「步数耗尽」与「失败」。

use serde::{Deserialize, Serialize};

/// Agent 运行阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentPhase {
    Idle,
    Running,
    StepOk,
    StepFailed,
    Done,
    Stopped,
    MaxStepsReached,
    Failed,
}

impl AgentPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentPhase::Done | AgentPhase::Stopped | AgentPhase::MaxStepsReached | AgentPhase::Failed
        )
    }

    /// 状态机允许的迁移
    pub fn can_transition_to(&self, next: AgentPhase) -> bool {
        use AgentPhase::*;
        match (self, next) {
            (Idle, Running) | (Idle, Stopped) | (Idle, MaxStepsReached) => true,
            (Running, StepOk) | (Running, StepFailed) => true,
            (StepOk, Running) | (StepOk, Done) | (StepOk, Stopped) | (StepOk, MaxStepsReached) => true,
            (StepFailed, Running)
            | (StepFailed, Stopped)
            | (StepFailed, MaxStepsReached)
            | (StepFailed, Failed) => true,
            _ => false,
        }
    }
}

/// 单次运行的终态（非异常）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TerminalState {
    /// 环境报告了 is_done
    Done,
    /// 外部停止信号
    Stopped,
    /// 步数预算耗尽
    MaxStepsReached,
    /// 连续失败达到 max_failures；error 为最后一次失败的描述
    Failed { error: String },
}

impl TerminalState {
    pub fn phase(&self) -> AgentPhase {
        match self {
            TerminalState::Done => AgentPhase::Done,
            TerminalState::Stopped => AgentPhase::Stopped,
            TerminalState::MaxStepsReached => AgentPhase::MaxStepsReached,
            TerminalState::Failed { .. } => AgentPhase::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_cycle_transitions() {
        assert!(AgentPhase::Idle.can_transition_to(AgentPhase::Running));
        assert!(AgentPhase::Running.can_transition_to(AgentPhase::StepFailed));
        assert!(AgentPhase::StepFailed.can_transition_to(AgentPhase::Running));
        assert!(AgentPhase::StepOk.can_transition_to(AgentPhase::Done));
    }

    #[test]
    fn test_terminal_phases_are_final() {
        for phase in [AgentPhase::Done, AgentPhase::Stopped, AgentPhase::MaxStepsReached, AgentPhase::Failed] {
            assert!(phase.is_terminal());
            assert!(!phase.can_transition_to(AgentPhase::Running));
        }
    }

    #[test]
    fn test_failed_only_after_step_failure() {
        assert!(!AgentPhase::StepOk.can_transition_to(AgentPhase::Failed));
        assert!(AgentPhase::StepFailed.can_transition_to(AgentPhase::Failed));
    }

    #[test]
    fn test_terminal_state_serializes_with_tag() {
        let json = serde_json::to_string(&TerminalState::Failed { error: "boom".into() }).unwrap();
        assert_eq!(json, r#"{"status":"failed","error":"boom"}"#);
        assert_eq!(TerminalState::MaxStepsReached.phase(), AgentPhase::MaxStepsReached);
    }
}
