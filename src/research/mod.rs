//! 深度研究：查询规划、并发子 Agent、结果缓存、报告合成

pub mod orchestrator;
pub mod report;

pub use orchestrator::{
    AgentRunner, Finding, ResearchOrchestrator, ResearchOutcome, ResearchSession, ResearchSettings, TaskRunner,
};
pub use report::{ReportWriter, RECORD_FILE, REPORT_FILE};
