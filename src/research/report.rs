//! 研究报告：合成提示、单次模型调用、落盘
//!
//! 目录布局：<save_dir>/<session_id>/record_infos.json（原始发现）与 final_report.md（报告）。
//! 发现先于合成写盘，合成失败不会丢失已完成的研究。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;

use crate::agent::strip_code_fences;
use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::memory::Message;
use crate::research::orchestrator::ResearchSession;

pub const RECORD_FILE: &str = "record_infos.json";
pub const REPORT_FILE: &str = "final_report.md";

const REPORT_SYSTEM_PROMPT: &str = "You are a professional research report writer. \
Using only the collected findings, write a well-structured Markdown report that answers the user's instruction. \
Start with a title and a short summary, organise the body by topic, cite the sub-query a fact came from when useful, \
and state clearly what could not be determined. Output the report only.";

pub struct ReportWriter {
    llm: Arc<dyn LlmClient>,
    save_dir: PathBuf,
}

impl ReportWriter {
    pub fn new(llm: Arc<dyn LlmClient>, save_dir: impl Into<PathBuf>) -> Self {
        Self {
            llm,
            save_dir: save_dir.into(),
        }
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.save_dir.join(session_id)
    }

    /// 合成报告提示
    pub fn build_messages(session: &ResearchSession) -> Vec<Message> {
        let mut findings = String::new();
        for (i, finding) in session.history_infos.iter().enumerate() {
            findings.push_str(&format!(
                "### Finding {} (query: {})\n{}\n\n",
                i + 1,
                finding.query,
                finding.content
            ));
        }
        if findings.is_empty() {
            findings.push_str("(no findings were collected)\n");
        }
        vec![
            Message::system(REPORT_SYSTEM_PROMPT),
            Message::user(format!(
                "User Instruction: {}\n\nCollected findings:\n\n{}",
                session.task, findings
            )),
        ]
    }

    /// 调用模型一次生成报告，去掉外层代码围栏
    pub async fn synthesize(&self, session: &ResearchSession) -> Result<String, AgentError> {
        let raw = self.llm.complete(&Self::build_messages(session)).await?;
        let report = strip_code_fences(&raw);
        if report.is_empty() {
            return Err(AgentError::LlmError(crate::llm::LlmError::InvalidResponse(
                "empty report".to_string(),
            )));
        }
        Ok(report)
    }

    /// 写入原始发现记录
    pub async fn save_record(&self, session: &ResearchSession) -> Result<PathBuf, AgentError> {
        let dir = self.session_dir(&session.session_id);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(RECORD_FILE);
        fs::write(&path, serde_json::to_vec_pretty(session)?).await?;
        Ok(path)
    }

    /// 写入最终报告
    pub async fn save_report(&self, session_id: &str, report: &str) -> Result<PathBuf, AgentError> {
        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(REPORT_FILE);
        fs::write(&path, report).await?;
        Ok(path)
    }
}

/// 读取已保存的报告（缓存命中时使用）
pub async fn read_report(path: &Path) -> Option<String> {
    fs::read_to_string(path).await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;
    use crate::research::orchestrator::Finding;

    fn session() -> ResearchSession {
        let mut s = ResearchSession::new("compare A and B");
        s.history_infos.push(Finding {
            query: "A price".into(),
            content: "A costs 3".into(),
        });
        s
    }

    #[test]
    fn test_prompt_contains_task_and_findings() {
        let messages = ReportWriter::build_messages(&session());
        assert_eq!(messages.len(), 2);
        assert!(messages[1].content.contains("User Instruction: compare A and B"));
        assert!(messages[1].content.contains("(query: A price)\nA costs 3"));
    }

    #[tokio::test]
    async fn test_synthesize_strips_fences_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(ScriptedLlmClient::new(vec![Ok("```markdown\n# Report\nA is cheaper\n```".into())]));
        let writer = ReportWriter::new(llm, dir.path());
        let s = session();
        let report = writer.synthesize(&s).await.unwrap();
        assert_eq!(report, "# Report\nA is cheaper");

        let record = writer.save_record(&s).await.unwrap();
        let path = writer.save_report(&s.session_id, &report).await.unwrap();
        assert_eq!(record.parent(), path.parent());
        assert_eq!(read_report(&path).await.as_deref(), Some("# Report\nA is cheaper"));
        let saved: ResearchSession =
            serde_json::from_str(&std::fs::read_to_string(record).unwrap()).unwrap();
        assert_eq!(saved, s);
    }
}
