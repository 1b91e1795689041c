//! 环境抽象：observe() 返回状态快照，execute(actions) 批量执行动作
//!
//! Agent 不关心动作如何落地；execute 可以返回少于请求数量的结果（中途停顿），由主循环补齐。

pub mod http;

use std::sync::Arc;

use async_trait::async_trait;

use crate::agent::views::{ActionModel, ActionResult, EnvironmentState};
use crate::core::AgentError;

pub use http::{HttpEnvironment, HttpEnvironmentConfig, HttpEnvironmentFactory};

/// 动作执行环境
#[async_trait]
pub trait Environment: Send + Sync {
    /// 当前状态快照
    async fn observe(&self) -> Result<EnvironmentState, AgentError>;

    /// 按顺序执行动作；结果与动作一一对应，可能提前停止
    async fn execute(&self, actions: &[ActionModel]) -> Result<Vec<ActionResult>, AgentError>;

    /// 可用动作说明（写入系统提示）
    fn action_descriptions(&self) -> String {
        String::new()
    }
}

/// 为每个子任务创建独立环境（研究编排器并发派发时使用）
pub trait EnvironmentFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn Environment>, AgentError>;
}
