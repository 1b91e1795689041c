//! Mock / 脚本化 LLM 客户端（无需 API）
//!
//! MockLlmClient：未配置凭据时使用，按提示类型给出最小合法回复，便于本地跑通流程。
//! ScriptedLlmClient：按顺序返回预设结果，用于测试。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};
use crate::memory::{Message, Role};

/// Mock 客户端：查询规划返回空列表，报告合成返回占位报告，其余一律输出 done 动作
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let wants_queries = messages.iter().any(|m| m.content.contains("\"queries\""));
        if wants_queries {
            return Ok(r#"{"queries": []}"#.to_string());
        }
        let wants_report = messages
            .iter()
            .any(|m| m.role == Role::System && m.content.contains("report writer"));
        if wants_report {
            return Ok("# Mock report\n\nNo model is configured; findings were not synthesized.".to_string());
        }
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| {
                m.content
                    .lines()
                    .find_map(|l| l.strip_prefix("1. Task: "))
                    .unwrap_or_else(|| m.content.lines().next().unwrap_or_default())
            })
            .unwrap_or("(no input)");
        let reply = serde_json::json!({
            "current_state": {
                "prev_action_evaluation": "Unknown - mock model",
                "important_contents": "",
                "task_progress": "",
                "future_plans": "",
                "thought": "Mock model has no real reasoning; finishing.",
                "summary": "done"
            },
            "action": [{"done": {"text": format!("Mock reply to: {}", last_user)}}]
        });
        Ok(reply.to_string())
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

/// 脚本化客户端：依次返回预设结果，用完后返回 fallback（未设置时报错）
#[derive(Debug)]
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: Option<Result<String, LlmError>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<Message>>>,
    model: String,
}

impl ScriptedLlmClient {
    pub fn new(script: Vec<Result<String, LlmError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            model: "scripted".to_string(),
        }
    }

    /// 每次都返回同一结果
    pub fn repeating(reply: Result<String, LlmError>) -> Self {
        Self::new(Vec::new()).with_fallback(reply)
    }

    pub fn with_fallback(mut self, reply: Result<String, LlmError>) -> Self {
        self.fallback = Some(reply);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 每次调用收到的消息
    pub fn seen(&self) -> Vec<Vec<Message>> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(messages.to_vec());
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match next {
            Some(reply) => reply,
            None => self
                .fallback
                .clone()
                .unwrap_or_else(|| Err(LlmError::Request("script exhausted".to_string()))),
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
