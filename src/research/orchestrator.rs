//! 深度研究编排：多轮查询规划 → 并发子 Agent → 汇总 → 报告
//!
//! 每轮：模型根据任务、已发出的查询与已有发现给出新查询（去重、截断到 max_query_num）；
//! 没有新查询即结束。命中缓存的查询直接记为发现，其余每个查询派发一个独立的子 Agent 并发执行。
//! 子任务失败不会终止其他子任务；不可恢复的错误在本轮结束后停止会话，并把错误附在部分结果上。

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{parse_structured, Agent, AgentHistory, AgentSettings, DoneValidator, PromptBuilders};
use crate::cache::ResultCache;
use crate::core::{AgentError, SessionSupervisor, TerminalState};
use crate::environment::EnvironmentFactory;
use crate::llm::LlmClient;
use crate::memory::Message;
use crate::research::report::{read_report, ReportWriter};

/// 规划提示中每条发现保留的最大字符数
const FINDING_PREVIEW_CHARS: usize = 2000;

/// 研究会话的预算与输出目录
#[derive(Debug, Clone)]
pub struct ResearchSettings {
    pub max_search_iterations: usize,
    pub max_query_num: usize,
    pub max_steps_per_query: usize,
    pub save_dir: PathBuf,
}

impl Default for ResearchSettings {
    fn default() -> Self {
        Self {
            max_search_iterations: 5,
            max_query_num: 3,
            max_steps_per_query: 10,
            save_dir: PathBuf::from("./tmp/deep_research"),
        }
    }
}

/// 单个查询的发现
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub query: String,
    pub content: String,
}

/// 研究会话状态（同时是 record_infos.json 的内容）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchSession {
    pub session_id: String,
    pub task: String,
    /// 已发出的全部查询（按发出顺序）
    pub history_query: Vec<String>,
    /// 已收集的发现
    pub history_infos: Vec<Finding>,
    /// 已完成的规划轮数
    pub iteration: usize,
    pub errors: Vec<String>,
}

impl ResearchSession {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            task: task.into(),
            history_query: Vec::new(),
            history_infos: Vec::new(),
            iteration: 0,
            errors: Vec::new(),
        }
    }
}

/// 研究结果：会话记录、报告与报告路径；errors 非空表示部分结果
#[derive(Debug, Clone)]
pub struct ResearchOutcome {
    pub session: ResearchSession,
    pub report: Option<String>,
    pub report_path: Option<PathBuf>,
    pub from_cache: bool,
}

impl ResearchOutcome {
    pub fn findings(&self) -> &[Finding] {
        &self.session.history_infos
    }

    pub fn errors(&self) -> &[String] {
        &self.session.errors
    }

    pub fn is_partial(&self) -> bool {
        !self.session.errors.is_empty()
    }
}

/// 任务级缓存记录
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedResearch {
    findings: Vec<Finding>,
    report_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct QueryPlan {
    #[serde(default)]
    queries: Vec<String>,
}

fn task_cache_key(task: &str) -> String {
    format!("task::{}", task)
}

fn query_cache_key(query: &str) -> String {
    format!("query::{}", query)
}

/// 子任务执行接口：给定查询和步数预算跑完一个子 Agent
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run_task(
        &self,
        task: &str,
        max_steps: usize,
        cancel: CancellationToken,
    ) -> Result<AgentHistory, AgentError>;
}

/// 默认实现：每个子任务创建独立环境，共享 LLM 客户端（及其限流器）
pub struct AgentRunner {
    llm: Arc<dyn LlmClient>,
    env_factory: Arc<dyn EnvironmentFactory>,
    settings: AgentSettings,
    prompts: PromptBuilders,
    validator: Option<Arc<dyn DoneValidator>>,
}

impl AgentRunner {
    pub fn new(llm: Arc<dyn LlmClient>, env_factory: Arc<dyn EnvironmentFactory>) -> Self {
        Self {
            llm,
            env_factory,
            settings: AgentSettings::default(),
            prompts: PromptBuilders::default(),
            validator: None,
        }
    }

    pub fn with_settings(mut self, settings: AgentSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_prompts(mut self, prompts: PromptBuilders) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_done_validator(mut self, validator: Arc<dyn DoneValidator>) -> Self {
        self.validator = Some(validator);
        self
    }
}

#[async_trait]
impl TaskRunner for AgentRunner {
    async fn run_task(
        &self,
        task: &str,
        max_steps: usize,
        cancel: CancellationToken,
    ) -> Result<AgentHistory, AgentError> {
        let env = self.env_factory.create()?;
        let mut agent = Agent::new(task, self.llm.clone(), env)
            .with_settings(self.settings.clone())
            .with_prompts(self.prompts.clone())
            .with_cancel_token(cancel);
        if let Some(validator) = &self.validator {
            agent = agent.with_done_validator(validator.clone());
        }
        Ok(agent.run(max_steps).await)
    }
}

/// 一个查询的执行结果
enum QueryOutcome {
    Cached(String),
    Ran(Result<AgentHistory, AgentError>),
}

pub struct ResearchOrchestrator {
    llm: Arc<dyn LlmClient>,
    runner: Arc<dyn TaskRunner>,
    cache: Arc<ResultCache>,
    settings: ResearchSettings,
    supervisor: SessionSupervisor,
}

impl ResearchOrchestrator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        runner: Arc<dyn TaskRunner>,
        cache: Arc<ResultCache>,
        settings: ResearchSettings,
    ) -> Self {
        Self {
            llm,
            runner,
            cache,
            settings,
            supervisor: SessionSupervisor::new(),
        }
    }

    pub fn with_supervisor(mut self, supervisor: SessionSupervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn settings(&self) -> &ResearchSettings {
        &self.settings
    }

    /// 执行一次研究会话；不返回 Err，错误记录在 outcome.session.errors
    pub async fn research(&self, task: &str) -> ResearchOutcome {
        if let Some(cached) = self.cache.load_json::<CachedResearch>(&task_cache_key(task)) {
            info!(task, findings = cached.findings.len(), "research served from cache");
            let report = match &cached.report_path {
                Some(path) => read_report(path).await,
                None => None,
            };
            let mut session = ResearchSession::new(task);
            session.history_query = cached.findings.iter().map(|f| f.query.clone()).collect();
            session.history_infos = cached.findings;
            return ResearchOutcome {
                session,
                report,
                report_path: cached.report_path,
                from_cache: true,
            };
        }

        let mut session = ResearchSession::new(task);
        info!(session_id = %session.session_id, task, "research started");

        while session.iteration < self.settings.max_search_iterations {
            if self.supervisor.is_stop_requested() {
                session.errors.push("research stopped by user".to_string());
                break;
            }

            let queries = match self.plan_queries(&session).await {
                Ok(queries) => queries,
                Err(e) => {
                    warn!(error = %e, "query planning failed");
                    session.errors.push(format!("query planning failed: {}", e));
                    break;
                }
            };
            session.iteration += 1;
            if queries.is_empty() {
                info!(iteration = session.iteration, "no new queries, research complete");
                break;
            }
            info!(iteration = session.iteration, ?queries, "dispatching queries");
            session.history_query.extend(queries.iter().cloned());

            let fatal = self.run_round(&mut session, queries).await;
            if fatal {
                break;
            }
        }

        self.finish(session).await
    }

    /// 规划下一轮查询：去重（保序，排除已发出的查询）并截断
    async fn plan_queries(&self, session: &ResearchSession) -> Result<Vec<String>, AgentError> {
        let messages = self.query_plan_messages(session)?;
        let raw = self.llm.complete(&messages).await?;
        let plan: QueryPlan = parse_structured(&raw)?;
        Ok(dedup_queries(
            plan.queries,
            &session.history_query,
            self.settings.max_query_num,
        ))
    }

    fn query_plan_messages(&self, session: &ResearchSession) -> Result<Vec<Message>, AgentError> {
        let system = format!(
            "You are a research planner. Given a user instruction, the search queries already issued and the \
findings collected so far, decide which web research queries still need to be run.\n\
Respond with a single JSON object of the form {{\"queries\": [\"query 1\", \"query 2\"]}}.\n\
Rules:\n\
- Return at most {} queries, each specific enough to be answered by browsing the web.\n\
- Never repeat a previous query.\n\
- Return {{\"queries\": []}} when the collected findings are sufficient to answer the instruction.",
            self.settings.max_query_num
        );
        let mut findings = String::new();
        for (i, finding) in session.history_infos.iter().enumerate() {
            let preview: String = finding.content.chars().take(FINDING_PREVIEW_CHARS).collect();
            findings.push_str(&format!("{}. [{}] {}\n", i + 1, finding.query, preview));
        }
        if findings.is_empty() {
            findings.push_str("(none yet)\n");
        }
        let user = format!(
            "User Instruction: {}\nPrevious Queries: {}\nCollected findings:\n{}",
            session.task,
            serde_json::to_string(&session.history_query)?,
            findings
        );
        Ok(vec![Message::system(system), Message::user(user)])
    }

    /// 执行一轮查询；返回 true 表示出现不可恢复错误，应在本轮后停止
    async fn run_round(&self, session: &mut ResearchSession, queries: Vec<String>) -> bool {
        let mut outcomes: Vec<Option<QueryOutcome>> = Vec::with_capacity(queries.len());
        let mut join_set = JoinSet::new();

        for (index, query) in queries.iter().enumerate() {
            if let Some(content) = self.cache.load(&query_cache_key(query)) {
                debug!(query = %query, "query served from cache");
                outcomes.push(Some(QueryOutcome::Cached(content)));
                continue;
            }
            outcomes.push(None);
            let runner = self.runner.clone();
            let query = query.clone();
            let max_steps = self.settings.max_steps_per_query;
            let cancel = self.supervisor.child_token();
            join_set.spawn(async move {
                let result = runner.run_task(&query, max_steps, cancel).await;
                (index, result)
            });
        }

        let mut fatal = false;
        let mut stopped = false;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => outcomes[index] = Some(QueryOutcome::Ran(result)),
                Err(e) => {
                    warn!(error = %e, "query task aborted");
                    session.errors.push(format!("query task aborted: {}", e));
                    fatal = true;
                }
            }
        }

        for (query, outcome) in queries.into_iter().zip(outcomes) {
            match outcome {
                Some(QueryOutcome::Cached(content)) => session.history_infos.push(Finding { query, content }),
                Some(QueryOutcome::Ran(Ok(history))) => {
                    stopped |= self.absorb_history(session, &query, &history).await;
                }
                Some(QueryOutcome::Ran(Err(e))) => {
                    warn!(query = %query, error = %e, "query failed");
                    session.errors.push(format!("query '{}' failed: {}", query, e));
                    fatal = true;
                }
                None => {}
            }
        }
        if stopped {
            session.errors.push("research stopped by user".to_string());
        }
        fatal || stopped
    }

    /// 把子 Agent 的结果并入会话；仅 Done 且有内容时写入查询缓存。返回 true 表示用户已停止
    async fn absorb_history(&self, session: &mut ResearchSession, query: &str, history: &AgentHistory) -> bool {
        let content = history.final_result().filter(|c| !c.trim().is_empty());
        let stopped = matches!(history.outcome, Some(TerminalState::Stopped));
        match &history.outcome {
            Some(TerminalState::Failed { error }) => {
                session.errors.push(format!("query '{}' failed: {}", query, error));
            }
            Some(TerminalState::Done) => {
                if let Some(content) = &content {
                    if let Err(e) = self.cache.store(&query_cache_key(query), content.clone()).await {
                        warn!(error = %e, "failed to cache query result");
                    }
                }
            }
            _ => {}
        }
        if let Some(content) = content {
            session.history_infos.push(Finding {
                query: query.to_string(),
                content,
            });
        }
        stopped
    }

    /// 落盘发现、合成报告、写任务级缓存
    async fn finish(&self, mut session: ResearchSession) -> ResearchOutcome {
        let writer = ReportWriter::new(self.llm.clone(), &self.settings.save_dir);
        if let Err(e) = writer.save_record(&session).await {
            warn!(error = %e, "failed to save research record");
            session.errors.push(format!("failed to save findings: {}", e));
        }

        let mut report = None;
        let mut report_path = None;
        match writer.synthesize(&session).await {
            Ok(text) => {
                match writer.save_report(&session.session_id, &text).await {
                    Ok(path) => report_path = Some(path),
                    Err(e) => session.errors.push(format!("failed to save report: {}", e)),
                }
                report = Some(text);
            }
            Err(e) => {
                warn!(error = %e, "report synthesis failed");
                session.errors.push(format!("report synthesis failed: {}", e));
            }
        }

        if session.errors.is_empty() && !session.history_infos.is_empty() {
            let record = CachedResearch {
                findings: session.history_infos.clone(),
                report_path: report_path.clone(),
            };
            if let Err(e) = self.cache.store_json(&task_cache_key(&session.task), &record).await {
                warn!(error = %e, "failed to cache research result");
            }
        }

        info!(
            session_id = %session.session_id,
            findings = session.history_infos.len(),
            errors = session.errors.len(),
            "research finished"
        );
        ResearchOutcome {
            session,
            report,
            report_path,
            from_cache: false,
        }
    }
}

/// 保序去重，排除已发出的查询与空白查询，截断到 max
fn dedup_queries(queries: Vec<String>, previous: &[String], max: usize) -> Vec<String> {
    let mut seen: HashSet<String> = previous.iter().cloned().collect();
    let mut out = Vec::new();
    for query in queries {
        let query = query.trim().to_string();
        if query.is_empty() || !seen.insert(query.clone()) {
            continue;
        }
        out.push(query);
        if out.len() == max {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_preserves_order_and_excludes_previous() {
        let queries = vec!["b".into(), "a".into(), "b".into(), " ".into(), "c".into(), "d".into()];
        let out = dedup_queries(queries, &["a".to_string()], 2);
        assert_eq!(out, vec!["b", "c"]);
    }

    #[test]
    fn test_cache_keys_are_namespaced() {
        assert_ne!(task_cache_key("x"), query_cache_key("x"));
    }

    #[test]
    fn test_query_plan_accepts_missing_field() {
        let plan: QueryPlan = parse_structured("{}").unwrap();
        assert!(plan.queries.is_empty());
    }
}
