//! 单任务 Agent：数据模型、JSON 修复与解析、提示词、有界上下文、主循环、完成校验

pub mod events;
pub mod loop_;
pub mod message_manager;
pub mod parser;
pub mod prompts;
pub mod repair;
pub mod transcript;
pub mod validator;
pub mod views;

pub use events::AgentEvent;
pub use loop_::{Agent, AgentSettings};
pub use message_manager::{MessageManager, MessageManagerSettings};
pub use parser::{parse_json_object, parse_structured, ResponseParser};
pub use prompts::{
    default_state_prompt, default_system_prompt, PromptBuilders, StatePromptBuilder, StatePromptContext,
    SystemPromptBuilder, SystemPromptContext,
};
pub use repair::{repair_json, strip_code_fences};
pub use transcript::ConversationRecorder;
pub use validator::{DoneValidator, LlmDoneValidator};
pub use views::{
    ActionModel, ActionResult, AgentBrain, AgentHistory, AgentHistoryItem, AgentOutput, EnvironmentState,
    StepInfo,
};
