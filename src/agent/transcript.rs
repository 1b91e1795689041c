//! 按步保存对话记录
//!
//! 每次模型调用成功解析后写一个文本文件：<root>/<run_id>/<seq>_step_<n>.txt，
//! 内容为本次输入的全部消息与解析后的输出。写盘失败只记日志。

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::warn;

use crate::agent::views::AgentOutput;
use crate::memory::Message;

pub struct ConversationRecorder {
    dir: PathBuf,
    seq: usize,
}

impl ConversationRecorder {
    /// 每个 run 一个独立子目录
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            dir: root.as_ref().join(uuid::Uuid::new_v4().to_string()),
            seq: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn save(&mut self, step: usize, messages: &[Message], output: &AgentOutput) -> Option<PathBuf> {
        self.seq += 1;
        let path = self.dir.join(format!("{:03}_step_{}.txt", self.seq, step));
        let text = render(messages, output);
        let written = async {
            fs::create_dir_all(&self.dir).await?;
            fs::write(&path, text).await
        }
        .await;
        match written {
            Ok(()) => Some(path),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to save conversation");
                None
            }
        }
    }
}

fn render(messages: &[Message], output: &AgentOutput) -> String {
    let mut text = String::new();
    for message in messages {
        let role = serde_json::to_value(message.role)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        text.push_str(&format!("[{}]\n{}\n", role, message.content));
        if message.image.is_some() {
            text.push_str("(screenshot attached)\n");
        }
        text.push('\n');
    }
    let response = serde_json::to_string_pretty(output).unwrap_or_else(|e| format!("<unserializable: {}>", e));
    text.push_str(&format!("[response]\n{}\n", response));
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::views::{ActionModel, AgentBrain};

    fn output() -> AgentOutput {
        AgentOutput {
            current_state: AgentBrain {
                thought: "open the page".into(),
                ..AgentBrain::default()
            },
            action: vec![ActionModel::bare("go_back")],
        }
    }

    #[tokio::test]
    async fn test_each_call_gets_its_own_file() {
        let root = tempfile::tempdir().unwrap();
        let mut recorder = ConversationRecorder::new(root.path());
        let messages = vec![Message::system("rules"), Message::user("Current step: 1/3")];

        let first = recorder.save(1, &messages, &output()).await.unwrap();
        let second = recorder.save(1, &messages, &output()).await.unwrap();

        assert_ne!(first, second);
        assert!(first.ends_with("001_step_1.txt"));
        assert!(second.ends_with("002_step_1.txt"));
        assert_eq!(first.parent(), Some(recorder.dir()));
        let text = std::fs::read_to_string(&first).unwrap();
        assert!(text.starts_with("[system]\nrules\n"), "{text}");
        assert!(text.contains("[user]\nCurrent step: 1/3\n"), "{text}");
        assert!(text.contains("[response]\n"), "{text}");
        assert!(text.contains("open the page"), "{text}");
    }

    #[tokio::test]
    async fn test_unwritable_dir_is_not_fatal() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let mut recorder = ConversationRecorder::new(&blocker);

        assert!(recorder.save(1, &[Message::user("hi")], &output()).await.is_none());
    }
}
