//! 记忆层：对话消息、有序历史与 token 估算

pub mod conversation;
pub mod token_budget;

pub use conversation::{ManagedMessage, Message, MessageHistory, Role};
pub use token_budget::{TokenEstimator, Tokenizer};
