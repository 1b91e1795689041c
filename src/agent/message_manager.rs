//! 有界对话上下文
//!
//! 受保护前缀：system 消息 + 可选的静态上下文消息，永不被淘汰。
//! 每次 add 之后，若总 token 超过 max_input_tokens 且长度大于前缀长度，则删除最旧的非保护消息。

use crate::agent::prompts::{StatePromptBuilder, StatePromptContext};
use crate::agent::views::{ActionModel, ActionResult, AgentOutput, EnvironmentState, StepInfo};
use crate::memory::{Message, MessageHistory, Role, TokenEstimator};
use tracing::warn;

/// 消息管理配置
#[derive(Debug, Clone)]
pub struct MessageManagerSettings {
    pub max_input_tokens: usize,
    pub max_error_length: usize,
    /// 状态消息是否附带截图
    pub use_vision: bool,
    /// 可选的静态上下文（作为第二条受保护消息）
    pub message_context: Option<String>,
}

impl Default for MessageManagerSettings {
    fn default() -> Self {
        Self {
            max_input_tokens: 128_000,
            max_error_length: 400,
            use_vision: true,
            message_context: None,
        }
    }
}

pub struct MessageManager {
    history: MessageHistory,
    estimator: TokenEstimator,
    settings: MessageManagerSettings,
    state_prompt: StatePromptBuilder,
    protected_len: usize,
}

impl MessageManager {
    pub fn new(
        system_prompt: impl Into<String>,
        settings: MessageManagerSettings,
        estimator: TokenEstimator,
        state_prompt: StatePromptBuilder,
    ) -> Self {
        let mut manager = Self {
            history: MessageHistory::new(),
            estimator,
            settings,
            state_prompt,
            protected_len: 0,
        };
        manager.push(Message::system(system_prompt));
        if let Some(context) = manager.settings.message_context.clone() {
            manager.push(Message::user(format!("Context for the task: {}", context)));
        }
        manager.protected_len = manager.history.len();
        manager
    }

    fn push(&mut self, message: Message) {
        let tokens = self.estimator.estimate(&message);
        self.history.push(message, tokens);
    }

    /// 追加一条消息并按预算淘汰
    pub fn add(&mut self, message: Message) {
        self.push(message);
        self.cut_messages();
    }

    fn cut_messages(&mut self) {
        while self.history.total_tokens() > self.settings.max_input_tokens
            && self.history.len() > self.protected_len
        {
            if let Some(removed) = self.history.remove(self.protected_len) {
                tracing::debug!(
                    role = ?removed.message.role,
                    tokens = removed.tokens,
                    total = self.history.total_tokens(),
                    "evicted message over token budget"
                );
            }
        }
    }

    /// 按绝对位置删除；受保护前缀不可删除
    pub fn remove(&mut self, index: usize) -> Option<Message> {
        if index < self.protected_len {
            return None;
        }
        self.history.remove(index).map(|m| m.message)
    }

    /// 删除从末尾数第 n 条（n 从 1 开始）状态消息（role = user，且不在受保护前缀中）
    pub fn remove_state_message_by_index(&mut self, n: usize) -> Option<Message> {
        if n == 0 {
            return None;
        }
        let index = self
            .history
            .messages()
            .iter()
            .enumerate()
            .skip(self.protected_len)
            .rev()
            .filter(|(_, m)| m.message.role == Role::User)
            .nth(n - 1)
            .map(|(i, _)| i)?;
        self.history.remove(index).map(|m| m.message)
    }

    /// 渲染并追加当前状态消息
    pub fn add_state_message(
        &mut self,
        state: &EnvironmentState,
        last_actions: &[ActionModel],
        last_results: &[ActionResult],
        step_info: Option<&StepInfo>,
    ) {
        let content = (self.state_prompt)(&StatePromptContext {
            state,
            last_actions,
            last_results,
            step_info,
            max_error_length: self.settings.max_error_length,
        });
        let mut message = Message::user(content);
        if self.settings.use_vision {
            if let Some(screenshot) = &state.screenshot {
                message = message.with_image(screenshot.clone());
            }
        }
        self.add(message);
    }

    /// 追加模型输出（序列化为 JSON 的 assistant 消息）
    pub fn add_model_output(&mut self, output: &AgentOutput) {
        match serde_json::to_string(output) {
            Ok(content) => self.add(Message::assistant(content)),
            Err(e) => warn!(error = %e, "failed to serialize model output, not recorded"),
        }
    }

    pub fn messages(&self) -> Vec<Message> {
        self.history.messages().iter().map(|m| m.message.clone()).collect()
    }

    pub fn total_tokens(&self) -> usize {
        self.history.total_tokens()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn protected_len(&self) -> usize {
        self.protected_len
    }
}
