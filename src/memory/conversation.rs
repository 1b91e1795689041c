//! 对话消息与有序历史
//!
//! Message 一旦加入历史即不可变；MessageHistory 记录每条消息的估算 token 数，
//! 总数始终等于各条之和（增删时同步维护）。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息；image 为可选的 base64 PNG 截图
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            image: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            image: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            image: None,
        }
    }

    /// 附加截图（base64 PNG）
    pub fn with_image(mut self, image_base64: impl Into<String>) -> Self {
        self.image = Some(image_base64.into());
        self
    }
}

/// 历史中的一条消息及其 token 估算
#[derive(Clone, Debug)]
pub struct ManagedMessage {
    pub message: Message,
    pub tokens: usize,
}

/// 有序消息历史，由单个 MessageManager 独占
#[derive(Clone, Debug, Default)]
pub struct MessageHistory {
    messages: Vec<ManagedMessage>,
    total_tokens: usize,
}

impl MessageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message, tokens: usize) {
        self.total_tokens += tokens;
        self.messages.push(ManagedMessage { message, tokens });
    }

    /// 按绝对位置删除；越界返回 None
    pub fn remove(&mut self, index: usize) -> Option<ManagedMessage> {
        if index >= self.messages.len() {
            return None;
        }
        let removed = self.messages.remove(index);
        self.total_tokens -= removed.tokens;
        Some(removed)
    }

    pub fn messages(&self) -> &[ManagedMessage] {
        &self.messages
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    /// 重新求和（用于校验 total_tokens 的不变量）
    pub fn recomputed_tokens(&self) -> usize {
        self.messages.iter().map(|m| m.tokens).sum()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_tracks_token_sum() {
        let mut history = MessageHistory::new();
        history.push(Message::system("sys"), 5);
        history.push(Message::user("hi"), 3);
        history.push(Message::assistant("hello"), 4);
        assert_eq!(history.total_tokens(), 12);

        let removed = history.remove(1).unwrap();
        assert_eq!(removed.message.content, "hi");
        assert_eq!(history.total_tokens(), 9);
        assert_eq!(history.total_tokens(), history.recomputed_tokens());
        assert!(history.remove(10).is_none());
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Message::assistant("ok")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"ok"}"#);
    }
}
