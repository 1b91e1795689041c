//! 深度研究编排集成测试：脚本化规划模型 + 假子任务执行器

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use forager::agent::{ActionResult, AgentHistory, AgentHistoryItem, EnvironmentState};
use forager::cache::ResultCache;
use forager::core::{AgentError, SessionSupervisor, TerminalState};
use forager::llm::{LlmError, ScriptedLlmClient};
use forager::research::{ResearchOrchestrator, ResearchSession, ResearchSettings, TaskRunner, RECORD_FILE, REPORT_FILE};

/// 记录派发的查询；fail_on 中的查询返回错误
#[derive(Default)]
struct FakeRunner {
    dispatched: Mutex<Vec<String>>,
    fail_on: Vec<String>,
}

impl FakeRunner {
    fn failing_on(query: &str) -> Self {
        Self {
            fail_on: vec![query.to_string()],
            ..Self::default()
        }
    }

    fn dispatched(&self) -> Vec<String> {
        let mut queries = self.dispatched.lock().unwrap().clone();
        queries.sort();
        queries
    }
}

#[async_trait]
impl TaskRunner for FakeRunner {
    async fn run_task(
        &self,
        task: &str,
        _max_steps: usize,
        _cancel: CancellationToken,
    ) -> Result<AgentHistory, AgentError> {
        self.dispatched.lock().unwrap().push(task.to_string());
        if self.fail_on.iter().any(|q| q == task) {
            return Err(AgentError::EnvironmentError(format!("cannot reach {}", task)));
        }
        let mut history = AgentHistory::new();
        history.push(AgentHistoryItem {
            model_output: None,
            state: EnvironmentState::default(),
            result: vec![ActionResult::done(Some(format!("answer for {}", task)))],
        });
        history.outcome = Some(TerminalState::Done);
        Ok(history)
    }
}

fn plan(queries: &[&str]) -> Result<String, LlmError> {
    Ok(serde_json::json!({ "queries": queries }).to_string())
}

fn settings(dir: &std::path::Path) -> ResearchSettings {
    ResearchSettings {
        max_search_iterations: 5,
        max_query_num: 3,
        max_steps_per_query: 4,
        save_dir: dir.to_path_buf(),
    }
}

fn cache() -> Arc<ResultCache> {
    Arc::new(ResultCache::in_memory(Duration::from_secs(60)))
}

#[tokio::test]
async fn test_two_queries_then_stop() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedLlmClient::new(vec![
        plan(&["a", "b"]),
        plan(&[]),
        Ok("```markdown\n# Report\nall good\n```".into()),
    ]));
    let runner = Arc::new(FakeRunner::default());
    let orchestrator = ResearchOrchestrator::new(llm.clone(), runner.clone(), cache(), settings(dir.path()));

    let outcome = orchestrator.research("compare a and b").await;

    assert_eq!(runner.dispatched(), vec!["a", "b"]);
    assert!(!outcome.is_partial(), "{:?}", outcome.errors());
    assert!(!outcome.from_cache);
    let findings: Vec<_> = outcome.findings().iter().map(|f| (f.query.as_str(), f.content.as_str())).collect();
    assert_eq!(findings, vec![("a", "answer for a"), ("b", "answer for b")]);
    assert_eq!(outcome.session.history_query, vec!["a", "b"]);
    assert_eq!(outcome.report.as_deref(), Some("# Report\nall good"));

    // 第二轮规划提示包含已发出的查询与发现
    let second_plan = &llm.seen()[1];
    let user = &second_plan.last().unwrap().content;
    assert!(user.contains(r#"Previous Queries: ["a","b"]"#), "{user}");
    assert!(user.contains("answer for b"), "{user}");

    let report_path = outcome.report_path.clone().unwrap();
    assert!(report_path.ends_with(REPORT_FILE));
    assert_eq!(std::fs::read_to_string(&report_path).unwrap(), "# Report\nall good");
    let record = report_path.with_file_name(RECORD_FILE);
    let saved: ResearchSession = serde_json::from_str(&std::fs::read_to_string(record).unwrap()).unwrap();
    assert_eq!(saved.history_infos.len(), 2);
}

#[tokio::test]
async fn test_repeated_task_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedLlmClient::new(vec![
        plan(&["a"]),
        plan(&[]),
        Ok("# Report".into()),
    ]));
    let runner = Arc::new(FakeRunner::default());
    let orchestrator = ResearchOrchestrator::new(llm.clone(), runner.clone(), cache(), settings(dir.path()));

    let first = orchestrator.research("find a").await;
    let second = orchestrator.research("find a").await;

    assert!(second.from_cache);
    assert_eq!(second.findings(), first.findings());
    assert_eq!(second.report.as_deref(), Some("# Report"));
    assert_eq!(runner.dispatched(), vec!["a"]);
    assert_eq!(llm.calls(), 3);
}

#[tokio::test]
async fn test_cached_query_is_not_dispatched_again() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedLlmClient::new(vec![
        plan(&["a"]),
        plan(&[]),
        Ok("# First".into()),
        plan(&["a", "c"]),
        plan(&[]),
        Ok("# Second".into()),
    ]));
    let runner = Arc::new(FakeRunner::default());
    let orchestrator = ResearchOrchestrator::new(llm, runner.clone(), cache(), settings(dir.path()));

    orchestrator.research("task one").await;
    let outcome = orchestrator.research("task two").await;

    assert_eq!(runner.dispatched(), vec!["a", "c"]);
    let queries: Vec<_> = outcome.findings().iter().map(|f| f.query.as_str()).collect();
    assert_eq!(queries, vec!["a", "c"]);
    assert_eq!(outcome.findings()[0].content, "answer for a");
}

#[tokio::test]
async fn test_failed_query_returns_partial_findings() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedLlmClient::new(vec![plan(&["a", "b"]), Ok("# Partial".into())]));
    let runner = Arc::new(FakeRunner::failing_on("b"));
    let orchestrator = ResearchOrchestrator::new(llm.clone(), runner.clone(), cache(), settings(dir.path()));

    let outcome = orchestrator.research("compare a and b").await;

    assert_eq!(runner.dispatched(), vec!["a", "b"]);
    assert!(outcome.is_partial());
    assert!(outcome.errors().iter().any(|e| e.contains("'b'") && e.contains("cannot reach b")));
    assert_eq!(outcome.findings().len(), 1);
    assert_eq!(outcome.findings()[0].query, "a");
    // 本轮结束即停止：一次规划 + 一次报告
    assert_eq!(llm.calls(), 2);
    assert_eq!(outcome.report.as_deref(), Some("# Partial"));
}

#[tokio::test]
async fn test_queries_are_truncated_and_rounds_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedLlmClient::new(vec![
        plan(&["a", "a", "b", "c"]),
        Ok("# Report".into()),
    ]));
    let runner = Arc::new(FakeRunner::default());
    let settings = ResearchSettings {
        max_search_iterations: 1,
        max_query_num: 2,
        ..settings(dir.path())
    };
    let orchestrator = ResearchOrchestrator::new(llm.clone(), runner.clone(), cache(), settings);

    let outcome = orchestrator.research("task").await;

    assert_eq!(runner.dispatched(), vec!["a", "b"]);
    assert_eq!(outcome.session.iteration, 1);
    assert_eq!(llm.calls(), 2);
}

#[tokio::test]
async fn test_report_failure_keeps_findings_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedLlmClient::new(vec![
        plan(&["a"]),
        plan(&[]),
        Err(LlmError::Request("upstream down".into())),
    ]));
    let orchestrator =
        ResearchOrchestrator::new(llm, Arc::new(FakeRunner::default()), cache(), settings(dir.path()));

    let outcome = orchestrator.research("find a").await;

    assert!(outcome.report.is_none());
    assert!(outcome.report_path.is_none());
    assert!(outcome.errors().iter().any(|e| e.contains("report synthesis failed")));
    assert_eq!(outcome.findings().len(), 1);
    let record = dir.path().join(&outcome.session.session_id).join(RECORD_FILE);
    assert!(record.exists());
}

#[tokio::test]
async fn test_stopped_session_skips_planning() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedLlmClient::new(vec![Ok("# Empty".into())]));
    let runner = Arc::new(FakeRunner::default());
    let supervisor = SessionSupervisor::new();
    supervisor.cancel();
    let orchestrator = ResearchOrchestrator::new(llm.clone(), runner.clone(), cache(), settings(dir.path()))
        .with_supervisor(supervisor);

    let outcome = orchestrator.research("anything").await;

    assert!(runner.dispatched().is_empty());
    assert!(outcome.errors().iter().any(|e| e.contains("stopped")));
    assert_eq!(llm.calls(), 1);
}

#[tokio::test]
async fn test_two_rounds_of_two_queries() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedLlmClient::new(vec![
        plan(&["a", "b", "c"]),
        plan(&["b", "c", "d", "e"]),
        Ok("# Report".into()),
    ]));
    let runner = Arc::new(FakeRunner::default());
    let settings = ResearchSettings {
        max_search_iterations: 2,
        max_query_num: 2,
        ..settings(dir.path())
    };
    let orchestrator = ResearchOrchestrator::new(llm.clone(), runner.clone(), cache(), settings);

    let outcome = orchestrator.research("compare a to e").await;

    assert_eq!(runner.dispatched(), vec!["a", "b", "c", "d"]);
    assert_eq!(outcome.session.history_query, vec!["a", "b", "c", "d"]);
    assert_eq!(outcome.session.iteration, 2);
    assert_eq!(outcome.findings().len(), 4);
    // 两轮规划 + 一次报告，不再进行第三轮
    assert_eq!(llm.calls(), 3);
    assert_eq!(outcome.report.as_deref(), Some("# Report"));
    assert!(!outcome.is_partial(), "{:?}", outcome.errors());
}
