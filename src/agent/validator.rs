//! 完成校验：Agent 声称 done 后，用一次额外的模型调用判断结果是否满足任务

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::agent::parser::parse_structured;
use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::memory::Message;

const VALIDATOR_SYSTEM_PROMPT: &str = "You are a validator of an agent that browses the web to complete a task. \
Decide whether the final result answers the user's task completely and correctly. \
If the task is unclear, accept the result. If the result is missing, vague, or only partial, reject it. \
Respond with a JSON object only: {\"is_valid\": true or false, \"reason\": \"why the result is or is not acceptable\"}";

#[async_trait]
pub trait DoneValidator: Send + Sync {
    /// Ok(None) 接受；Ok(Some(reason)) 拒绝并给出原因
    async fn validate(&self, task: &str, result: &str) -> Result<Option<String>, AgentError>;
}

#[derive(Debug, Deserialize)]
struct Verdict {
    is_valid: bool,
    #[serde(default)]
    reason: String,
}

/// 基于模型的校验器
pub struct LlmDoneValidator {
    llm: Arc<dyn LlmClient>,
}

impl LlmDoneValidator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn build_messages(task: &str, result: &str) -> Vec<Message> {
        vec![
            Message::system(VALIDATOR_SYSTEM_PROMPT),
            Message::user(format!("Task: {}\n\nFinal result:\n{}", task, result)),
        ]
    }
}

#[async_trait]
impl DoneValidator for LlmDoneValidator {
    async fn validate(&self, task: &str, result: &str) -> Result<Option<String>, AgentError> {
        let raw = self.llm.complete(&Self::build_messages(task, result)).await?;
        let verdict: Verdict = parse_structured(&raw)?;
        if verdict.is_valid {
            Ok(None)
        } else {
            Ok(Some(verdict.reason))
        }
    }
}
