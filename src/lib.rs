//! Forager - 自主网页研究 Agent
//!
//! 模块划分：
//! - **agent**: 单任务 Agent：观察 → 模型决策 → 动作执行的有界循环
//! - **cache**: 内容寻址结果缓存（TTL、原子写文件）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、状态、会话监管
//! - **environment**: Agent 可操作的环境抽象与 HTTP 实现
//! - **llm**: LLM 客户端抽象、OpenAI 兼容实现、重试与限流
//! - **memory**: 对话消息与 token 预算
//! - **observability**: 日志初始化
//! - **research**: 多轮深度研究与报告

pub mod agent;
pub mod cache;
pub mod config;
pub mod core;
pub mod environment;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod research;
