//! Agent 过程事件：供 CLI / 前端实时展示步数、模型判断、动作结果与终态

use serde::Serialize;

use crate::agent::views::{ActionModel, ActionResult, AgentBrain};
use crate::core::TerminalState;

/// 单步过程事件（可序列化为 JSON）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// 开始第几步
    StepStarted { step: usize, max_steps: usize },
    /// 模型对当前状态的判断与计划动作
    ModelOutput {
        step: usize,
        brain: AgentBrain,
        actions: Vec<ActionModel>,
    },
    /// 本步动作结果（与动作一一对应）
    ActionResults { step: usize, results: Vec<ActionResult> },
    /// 本步失败（将回滚并重试）
    StepFailed {
        step: usize,
        error: String,
        consecutive_failures: usize,
    },
    /// 运行结束
    Finished { outcome: TerminalState },
}
